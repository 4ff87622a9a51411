//! Pipeline controller: enriches every source record under one admission
//! limit and collects per-record outcomes.
//!
//! Per record: metadata cache → scrape (cache or fetch) → generate. A record
//! never fails the run; its error is kept in its [`PipelineOutcome`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use markwise_shared::{
    GeneratedMetadata, MarkwiseError, PipelineSettings, Result, ScrapeResult, SourceRecord, Stage,
};

use crate::cache::ResilientCache;
use crate::fetch::ContentFetcher;
use crate::metadata::MetadataGenerator;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one record.
#[derive(Debug)]
pub enum PipelineOutcome {
    Success {
        metadata: GeneratedMetadata,
        /// Resolved from the metadata cache without any network call.
        from_cache: bool,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: MarkwiseError,
    },
}

impl PipelineOutcome {
    pub fn metadata(&self) -> Option<&GeneratedMetadata> {
        match self {
            Self::Success { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A record and its outcome. `index` is the record's position in the input.
#[derive(Debug)]
pub struct RecordOutcome {
    pub index: usize,
    pub record: SourceRecord,
    pub outcome: PipelineOutcome,
}

/// Aggregate result of [`Pipeline::run`]. `outcomes` is in input order.
#[derive(Debug)]
pub struct RunSummary {
    pub outcomes: Vec<RecordOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Successes served from the metadata cache.
    pub cache_hits: usize,
    /// Cache reads or writes that fell back to uncached behaviour.
    pub cache_degraded: usize,
    /// LLM tokens spent in this run (cache hits cost nothing).
    pub tokens_used: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    fn from_outcomes(outcomes: Vec<RecordOutcome>, cache_degraded: usize, elapsed: Duration) -> Self {
        let mut summary = Self {
            outcomes: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cache_hits: 0,
            cache_degraded,
            tokens_used: 0,
            elapsed,
        };

        for item in &outcomes {
            match &item.outcome {
                PipelineOutcome::Success {
                    metadata,
                    from_cache,
                } => {
                    summary.succeeded += 1;
                    if *from_cache {
                        summary.cache_hits += 1;
                    } else {
                        summary.tokens_used += metadata.cost_units;
                    }
                }
                PipelineOutcome::Skipped { .. } => summary.skipped += 1,
                PipelineOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        summary.outcomes = outcomes;
        summary
    }

    /// Successful metadata, one entry per URL. When a URL appears more than
    /// once in the input, the later record wins but keeps the first position.
    pub fn metadata(&self) -> Vec<GeneratedMetadata> {
        let mut out: Vec<GeneratedMetadata> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();

        for metadata in self.outcomes.iter().filter_map(|o| o.outcome.metadata()) {
            match positions.get(metadata.url.as_str()) {
                Some(&pos) => out[pos] = metadata.clone(),
                None => {
                    positions.insert(metadata.url.as_str(), out.len());
                    out.push(metadata.clone());
                }
            }
        }
        out
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SourceRecord, &MarkwiseError)> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            PipelineOutcome::Failed { error } => Some((&o.record, error)),
            _ => None,
        })
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once with the number of records that will be processed.
    fn started(&self, total: usize);
    /// Called as each scheduled record settles.
    fn record_finished(&self, outcome: &RecordOutcome, done: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn started(&self, _total: usize) {}
    fn record_finished(&self, _outcome: &RecordOutcome, _done: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Bounded-concurrency enrichment over a record feed.
#[derive(Clone)]
pub struct Pipeline {
    fetcher: Arc<ContentFetcher>,
    generator: Arc<MetadataGenerator>,
    cache: Arc<ResilientCache>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<ContentFetcher>,
        generator: Arc<MetadataGenerator>,
        cache: Arc<ResilientCache>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            generator,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Process `records` with at most `settings.concurrency` in flight.
    ///
    /// After `cancel` fires no further record is scheduled; records never
    /// scheduled are reported as failed with [`MarkwiseError::Cancelled`].
    /// In-flight records observe cancellation at their next call boundary.
    #[instrument(skip_all, fields(records = records.len(), concurrency = self.settings.concurrency))]
    pub async fn run(
        &self,
        mut records: Vec<SourceRecord>,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> RunSummary {
        let start = Instant::now();
        let degraded_before = self.cache.degraded_events();

        if let Some(max) = self.settings.max_records {
            records.truncate(max);
        }
        let total = records.len();
        progress.started(total);
        info!(total, cache_only = self.settings.cache_only, "starting enrichment");

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks: JoinSet<(usize, PipelineOutcome)> = JoinSet::new();
        let mut settled: Vec<Option<PipelineOutcome>> = (0..total).map(|_| None).collect();
        let mut done = 0usize;

        for (index, record) in records.iter().enumerate() {
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.settle(joined, &records, &mut settled, &mut done, progress);
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => break permit.ok(),
                }
            };
            let Some(permit) = permit else {
                warn!(scheduled = index, total, "run cancelled, no further records scheduled");
                break;
            };

            let worker = self.clone();
            let record = record.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                // Inner task so a panicking record is reported, not lost.
                let work = tokio::spawn(async move { worker.process(&record, &cancel).await });
                let outcome = match work.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(index, error = %e, "record worker panicked");
                        PipelineOutcome::Failed {
                            error: MarkwiseError::Task(e.to_string()),
                        }
                    }
                };
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &records, &mut settled, &mut done, progress);
        }

        let outcomes: Vec<RecordOutcome> = records
            .into_iter()
            .zip(settled)
            .enumerate()
            .map(|(index, (record, outcome))| RecordOutcome {
                index,
                record,
                outcome: outcome.unwrap_or(PipelineOutcome::Failed {
                    error: MarkwiseError::Cancelled,
                }),
            })
            .collect();

        let summary = RunSummary::from_outcomes(
            outcomes,
            self.cache.degraded_events().saturating_sub(degraded_before),
            start.elapsed(),
        );
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cache_hits = summary.cache_hits,
            tokens = summary.tokens_used,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "enrichment complete"
        );
        summary
    }

    fn settle(
        &self,
        joined: std::result::Result<(usize, PipelineOutcome), JoinError>,
        records: &[SourceRecord],
        settled: &mut [Option<PipelineOutcome>],
        done: &mut usize,
        progress: &dyn ProgressReporter,
    ) {
        let (index, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "record task lost");
                return;
            }
        };

        *done += 1;
        let report = RecordOutcome {
            index,
            record: records[index].clone(),
            outcome,
        };
        progress.record_finished(&report, *done, records.len());
        settled[index] = Some(report.outcome);
    }

    async fn process(&self, record: &SourceRecord, cancel: &CancellationToken) -> PipelineOutcome {
        match self.enrich(record, cancel).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if error.is_cancelled() {
                    debug!(url = %record.url, "record cancelled");
                } else {
                    warn!(url = %record.url, kind = error.kind(), error = %error, "record failed");
                }
                PipelineOutcome::Failed { error }
            }
        }
    }

    async fn enrich(
        &self,
        record: &SourceRecord,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let url = record.url.trim();
        let ttl = self.settings.cache_ttl;

        if !self.settings.force_refresh {
            if let Some(metadata) = self
                .cache
                .get::<GeneratedMetadata>(url, Stage::Metadata)
                .await
            {
                debug!(url, "metadata cache hit");
                return Ok(PipelineOutcome::Success {
                    metadata,
                    from_cache: true,
                });
            }
        }

        if self.settings.cache_only {
            return Ok(PipelineOutcome::Skipped {
                reason: "no cached metadata".into(),
            });
        }

        if cancel.is_cancelled() {
            return Err(MarkwiseError::Cancelled);
        }

        let cached_scrape = if self.settings.force_refresh {
            None
        } else {
            self.cache.get::<ScrapeResult>(url, Stage::Scrape).await
        };
        let scrape = match cached_scrape {
            Some(scrape) => scrape,
            None => {
                let scrape = self.fetcher.fetch(url, cancel).await?;
                self.cache.put(url, Stage::Scrape, &scrape, ttl).await;
                scrape
            }
        };

        if cancel.is_cancelled() {
            return Err(MarkwiseError::Cancelled);
        }

        let metadata = self
            .generator
            .generate(&record.display_name, &scrape, cancel)
            .await?;
        self.cache.put(url, Stage::Metadata, &metadata, ttl).await;

        Ok(PipelineOutcome::Success {
            metadata,
            from_cache: false,
        })
    }
}
