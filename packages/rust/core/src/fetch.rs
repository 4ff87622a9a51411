//! Content fetcher: engine fallback, retries and title salvage around
//! [`markwise_extract`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use markwise_fetcher::{BrowserlessEngine, HttpEngine, RenderEngine, check_url, engine_label};
use markwise_shared::{AppConfig, EngineKind, MarkwiseError, Result, ScrapeResult, ScrapingConfig};

use crate::retry::{RetryPolicy, classify_fetch_error};

/// Fetches a page through an ordered list of engines and extracts its text.
pub struct ContentFetcher {
    engines: Vec<Arc<dyn RenderEngine>>,
    retry: RetryPolicy,
    timeout: Duration,
    max_content_length: usize,
    allow_private_hosts: bool,
}

impl ContentFetcher {
    pub fn new(
        engines: Vec<Arc<dyn RenderEngine>>,
        retry: RetryPolicy,
        config: &ScrapingConfig,
    ) -> Self {
        Self {
            engines,
            retry,
            timeout: Duration::from_secs(config.timeout_secs),
            max_content_length: config.max_content_length,
            allow_private_hosts: config.allow_private_hosts,
        }
    }

    /// Build the engine chain from `[scraping]`: primary first, then the
    /// fallback unless it repeats the primary. Browserless is left out when
    /// no endpoint is configured.
    pub fn from_config(config: &AppConfig, browserless_token: Option<String>) -> Result<Self> {
        let scraping = &config.scraping;

        let mut kinds = vec![scraping.primary_engine];
        if let Some(fallback) = scraping.fallback_engine.filter(|f| *f != scraping.primary_engine) {
            kinds.push(fallback);
        }

        let mut engines: Vec<Arc<dyn RenderEngine>> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match kind {
                EngineKind::Http => engines.push(Arc::new(HttpEngine::new(&scraping.user_agent)?)),
                EngineKind::Browserless => match scraping.browserless_url.as_deref() {
                    Some(base) => engines.push(Arc::new(BrowserlessEngine::new(
                        base,
                        browserless_token.clone(),
                    )?)),
                    None => warn!(
                        engine = engine_label(kind),
                        "no scraping.browserless_url configured, engine disabled"
                    ),
                },
            }
        }

        if engines.is_empty() {
            return Err(MarkwiseError::config(
                "no render engine available; set scraping.browserless_url or use the http engine",
            ));
        }

        Ok(Self::new(engines, RetryPolicy::from(&config.retry), scraping))
    }

    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    /// Engine labels in the order they are tried.
    pub fn engine_names(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    /// Fetch `raw_url` and return its cleaned text.
    ///
    /// Falls back to a `title_only` result when no engine produced text but
    /// some page offered a title. Fails with [`MarkwiseError::Fetch`] when
    /// there is nothing at all to show for the URL.
    #[instrument(skip(self, cancel), fields(url = %raw_url))]
    pub async fn fetch(&self, raw_url: &str, cancel: &CancellationToken) -> Result<ScrapeResult> {
        let url = check_url(raw_url, self.allow_private_hosts)?;

        let error_page_title: Mutex<Option<String>> = Mutex::new(None);
        let mut empty_page_title: Option<String> = None;
        let mut last_error: Option<MarkwiseError> = None;

        for engine in &self.engines {
            let engine = engine.as_ref();
            let rendered = self
                .retry
                .execute(
                    || self.render_once(engine, &url, &error_page_title),
                    classify_fetch_error,
                    cancel,
                )
                .await;

            match rendered {
                Ok(html) => {
                    let extracted = markwise_extract::extract(&html, self.max_content_length);
                    if !extracted.text.is_empty() {
                        debug!(engine = engine.name(), chars = extracted.text.len(), "page fetched");
                        return Ok(ScrapeResult {
                            url: raw_url.trim().to_string(),
                            text: extracted.text,
                            source_title: extracted.title,
                            title_only: false,
                        });
                    }

                    debug!(engine = engine.name(), "page had no readable text");
                    if empty_page_title.is_none() && !extracted.title.is_empty() {
                        empty_page_title = Some(extracted.title);
                    }
                    last_error = Some(MarkwiseError::Fetch(format!(
                        "{}: no readable text at {url}",
                        engine.name()
                    )));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(engine = engine.name(), error = %e, "engine failed");
                    last_error = Some(e);
                }
            }
        }

        let salvaged = empty_page_title.or_else(|| {
            error_page_title
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        });

        match salvaged {
            Some(title) => {
                info!(title = %title, "no page text, keeping title only");
                Ok(ScrapeResult {
                    url: raw_url.trim().to_string(),
                    text: markwise_extract::truncate(&title, self.max_content_length),
                    source_title: title,
                    title_only: true,
                })
            }
            None => Err(MarkwiseError::Fetch(match last_error {
                Some(e) => format!("{url}: {e}"),
                None => format!("{url}: no render engine configured"),
            })),
        }
    }

    /// One engine call. Error pages become `Http` errors so the retry policy
    /// can classify them, after their title is kept for salvage.
    async fn render_once(
        &self,
        engine: &dyn RenderEngine,
        url: &Url,
        error_page_title: &Mutex<Option<String>>,
    ) -> Result<String> {
        let page = engine.render(url, self.timeout).await?;
        if page.is_success() {
            return Ok(page.html);
        }

        if let Some(title) = markwise_extract::extract_title(&page.html) {
            if let Ok(mut slot) = error_page_title.lock() {
                slot.get_or_insert(title);
            }
        }

        Err(MarkwiseError::http(
            page.status,
            format!("{} returned {} for {url}", engine.name(), page.status),
        ))
    }
}
