//! Shared types, error model, and configuration for Markwise.
//!
//! This crate is the foundation depended on by all other Markwise crates.
//! It provides:
//! - [`MarkwiseError`]: the unified error type
//! - Domain types ([`SourceRecord`], [`ScrapeResult`], [`GeneratedMetadata`], [`FolderNode`])
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, DefaultsConfig, EngineKind, LlmConfig, PipelineSettings,
    RetryConfig, ScrapingConfig, TaxonomyConfig, config_dir, config_file_path, default_cache_path,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{MarkwiseError, Result};
pub use types::{
    CacheEntry, FolderNode, GeneratedMetadata, RecordId, ScrapeResult, SourceRecord, Stage,
    cache_key,
};
