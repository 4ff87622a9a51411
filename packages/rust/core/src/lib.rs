//! Core enrichment pipeline for Markwise.
//!
//! This crate ties the cache store, render engines and an LLM capability
//! together into the end-to-end `organize` flow: records are enriched with
//! scraped content and generated metadata under a bounded worker pool, then
//! grouped into a validated folder taxonomy.

pub mod cache;
pub mod export;
pub mod fetch;
pub mod llm;
pub mod metadata;
pub mod organize;
pub mod pipeline;
pub mod retry;
pub mod taxonomy;

#[cfg(test)]
mod testing;

pub use cache::ResilientCache;
pub use export::{export_metadata, export_summary, export_tree};
pub use fetch::ContentFetcher;
pub use llm::{Completion, CompletionRequest, JsonReply, LlmClient, OpenAiClient, complete_json};
pub use metadata::MetadataGenerator;
pub use organize::{OrganizeResult, organize};
pub use pipeline::{
    Pipeline, PipelineOutcome, ProgressReporter, RecordOutcome, RunSummary, SilentProgress,
};
pub use retry::{Attempt, ErrorClass, RetryPolicy, classify_fetch_error, classify_llm_error};
pub use taxonomy::{Taxonomy, TaxonomyBuilder};

pub use tokio_util::sync::CancellationToken;
