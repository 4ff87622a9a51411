//! JSON exports of a run: metadata list, folder tree and summary.
//!
//! Every file carries a `_metadata` block with the format version, export
//! time and headline counts.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use markwise_shared::{FolderNode, GeneratedMetadata, MarkwiseError, Result};

use crate::pipeline::{PipelineOutcome, RunSummary};
use crate::taxonomy::Taxonomy;

pub const FORMAT_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Document shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MetadataDocument<'a> {
    bookmarks: &'a [GeneratedMetadata],
    #[serde(rename = "_metadata")]
    meta: MetadataInfo,
}

#[derive(Serialize)]
struct MetadataInfo {
    format_version: &'static str,
    exported_at: DateTime<Utc>,
    bookmark_count: usize,
    title_only_count: usize,
    total_tokens: u64,
}

#[derive(Serialize)]
struct TreeDocument<'a> {
    tree: &'a FolderNode,
    #[serde(rename = "_metadata")]
    meta: TreeInfo<'a>,
}

#[derive(Serialize)]
struct TreeInfo<'a> {
    format_version: &'static str,
    exported_at: DateTime<Utc>,
    total_folders: usize,
    total_bookmarks: usize,
    max_depth: usize,
    total_tokens: u64,
    fallback: bool,
    flattened: usize,
    missing: &'a [String],
    duplicates: &'a [String],
    unknown: &'a [String],
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    records: Vec<RecordRow<'a>>,
    #[serde(rename = "_metadata")]
    meta: SummaryInfo,
}

#[derive(Serialize)]
struct RecordRow<'a> {
    index: usize,
    url: &'a str,
    display_name: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
}

#[derive(Serialize)]
struct SummaryInfo {
    format_version: &'static str,
    exported_at: DateTime<Utc>,
    total_records: usize,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    cache_hits: usize,
    cache_degraded: usize,
    total_tokens: u64,
    elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Write the successful metadata list.
pub fn export_metadata(path: &Path, metadata: &[GeneratedMetadata]) -> Result<()> {
    let doc = MetadataDocument {
        bookmarks: metadata,
        meta: MetadataInfo {
            format_version: FORMAT_VERSION,
            exported_at: Utc::now(),
            bookmark_count: metadata.len(),
            title_only_count: metadata.iter().filter(|m| m.title_only).count(),
            total_tokens: metadata.iter().map(|m| m.cost_units).sum(),
        },
    };
    write_json(path, &doc)?;
    info!(path = %path.display(), bookmarks = metadata.len(), "exported metadata");
    Ok(())
}

/// Write the resolved folder tree.
pub fn export_tree(path: &Path, taxonomy: &Taxonomy) -> Result<()> {
    let doc = TreeDocument {
        tree: &taxonomy.root,
        meta: TreeInfo {
            format_version: FORMAT_VERSION,
            exported_at: Utc::now(),
            total_folders: taxonomy.root.folder_count(),
            total_bookmarks: taxonomy.root.bookmark_count(),
            max_depth: taxonomy.root.depth(),
            total_tokens: taxonomy.tokens_used,
            fallback: taxonomy.fallback,
            flattened: taxonomy.flattened,
            missing: &taxonomy.missing,
            duplicates: &taxonomy.duplicates,
            unknown: &taxonomy.unknown,
        },
    };
    write_json(path, &doc)?;
    info!(path = %path.display(), folders = doc.meta.total_folders, "exported folder tree");
    Ok(())
}

/// Write one row per record plus run totals. Error messages are reduced to
/// their kind so the file is safe to share.
pub fn export_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let records = summary
        .outcomes
        .iter()
        .map(|o| {
            let mut row = RecordRow {
                index: o.index,
                url: &o.record.url,
                display_name: &o.record.display_name,
                status: o.outcome.label(),
                from_cache: None,
                title_only: None,
                reason: None,
                error_kind: None,
            };
            match &o.outcome {
                PipelineOutcome::Success {
                    metadata,
                    from_cache,
                } => {
                    row.from_cache = Some(*from_cache);
                    row.title_only = Some(metadata.title_only);
                }
                PipelineOutcome::Skipped { reason } => row.reason = Some(reason.clone()),
                PipelineOutcome::Failed { error } => row.error_kind = Some(error.kind()),
            }
            row
        })
        .collect();

    let doc = SummaryDocument {
        records,
        meta: SummaryInfo {
            format_version: FORMAT_VERSION,
            exported_at: Utc::now(),
            total_records: summary.total(),
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
            cache_hits: summary.cache_hits,
            cache_degraded: summary.cache_degraded,
            total_tokens: summary.tokens_used,
            elapsed_ms: summary.elapsed.as_millis() as u64,
        },
    };
    write_json(path, &doc)?;
    info!(path = %path.display(), records = summary.total(), "exported run summary");
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| MarkwiseError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| MarkwiseError::validation(format!("JSON serialization failed: {e}")))?;
    std::fs::write(path, json).map_err(|e| MarkwiseError::io(path, e))?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}
