//! End-to-end `organize` flow: enrich every record, then build the tree.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use markwise_shared::{MarkwiseError, Result, SourceRecord};

use crate::pipeline::{Pipeline, ProgressReporter, RunSummary};
use crate::taxonomy::{Taxonomy, TaxonomyBuilder};

/// Result of [`organize`]. The summary is always complete; the tree step
/// can only add to it.
#[derive(Debug)]
pub struct OrganizeResult {
    pub summary: RunSummary,
    /// `None` when no taxonomy builder was given or the tree step failed.
    pub taxonomy: Option<Taxonomy>,
    /// Why the tree step produced nothing, e.g. a provider failure or
    /// cancellation after enrichment.
    pub tree_error: Option<MarkwiseError>,
}

/// Run the pipeline over `records` and organize the successes.
///
/// Fails only with [`MarkwiseError::NoUsableMetadata`], when no record
/// succeeded. A failed or cancelled tree step is reported in
/// [`OrganizeResult::tree_error`] next to the full run summary.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn organize(
    pipeline: &Pipeline,
    taxonomy: Option<&TaxonomyBuilder>,
    records: Vec<SourceRecord>,
    cancel: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<OrganizeResult> {
    progress.phase("Enriching bookmarks");
    let summary = pipeline.run(records, cancel, progress).await;

    let metadata = summary.metadata();
    if metadata.is_empty() {
        return Err(MarkwiseError::NoUsableMetadata {
            attempted: summary.total(),
        });
    }

    let mut result = OrganizeResult {
        summary,
        taxonomy: None,
        tree_error: None,
    };
    let Some(builder) = taxonomy else {
        return Ok(result);
    };

    if cancel.is_cancelled() {
        warn!("run cancelled before the folder tree was built");
        result.tree_error = Some(MarkwiseError::Cancelled);
        return Ok(result);
    }

    progress.phase("Building folder taxonomy");
    match builder.build(&metadata, cancel).await {
        Ok(tree) => {
            info!(
                bookmarks = tree.root.bookmark_count(),
                folders = tree.root.folder_count(),
                "organize complete"
            );
            result.taxonomy = Some(tree);
        }
        Err(error) => {
            warn!(kind = error.kind(), error = %error, "folder tree step failed, keeping run summary");
            result.tree_error = Some(error);
        }
    }
    Ok(result)
}
