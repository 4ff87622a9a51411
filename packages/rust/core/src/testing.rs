//! Scripted collaborators shared by the unit tests in this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use markwise_fetcher::{RenderEngine, RenderedPage};
use markwise_shared::{MarkwiseError, Result};
use url::Url;

use crate::llm::{Completion, CompletionRequest, LlmClient};
use crate::retry::RetryPolicy;

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
        .with_rate_limit_window(Duration::from_millis(1), Duration::from_millis(2))
}

pub(crate) fn reply(text: &str, tokens_used: u64) -> Completion {
    Completion {
        text: text.to_string(),
        tokens_used,
    }
}

pub(crate) fn html_page(title: &str, body: &str) -> String {
    format!("<html><head><title>{title}</title></head><body><article><p>{body}</p></article></body></html>")
}

/// Tracks how many calls are running at once.
#[derive(Debug, Default)]
pub(crate) struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

type LlmHandler = Box<dyn Fn(&CompletionRequest) -> Result<Completion> + Send + Sync>;

pub(crate) struct ScriptedLlm {
    handler: LlmHandler,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    pub(crate) gauge: Arc<Gauge>,
}

impl ScriptedLlm {
    pub(crate) fn new(
        handler: impl Fn(&CompletionRequest) -> Result<Completion> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            gauge: Arc::default(),
        }
    }

    /// Replies in order; errors once the script runs out.
    pub(crate) fn sequence(replies: Vec<Result<Completion>>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(MarkwiseError::Llm("script exhausted".into())))
        })
    }

    /// Answers metadata prompts with a name derived from the `URL:` line.
    pub(crate) fn metadata() -> Self {
        Self::new(|request| {
            let url = prompt_url(&request.prompt);
            Ok(reply(
                &serde_json::json!({
                    "name": format!("Name for {url}"),
                    "description": format!("About {url}"),
                })
                .to_string(),
                10,
            ))
        })
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Count calls on `gauge`, which may be shared with other doubles.
    pub(crate) fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = gauge;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

pub(crate) fn prompt_url(prompt: &str) -> &str {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("URL: "))
        .unwrap_or_default()
        .trim()
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let out = (self.handler)(request);
        self.gauge.exit();
        out
    }
}

// ---------------------------------------------------------------------------
// Render engine
// ---------------------------------------------------------------------------

type EngineHandler = Box<dyn Fn(&Url) -> Result<RenderedPage> + Send + Sync>;

pub(crate) struct ScriptedEngine {
    name: String,
    handler: EngineHandler,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    pub(crate) gauge: Arc<Gauge>,
}

impl ScriptedEngine {
    pub(crate) fn new(
        name: &str,
        handler: impl Fn(&Url) -> Result<RenderedPage> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            gauge: Arc::default(),
        }
    }

    /// Every URL renders as a small article titled after its path.
    pub(crate) fn healthy(name: &str) -> Self {
        Self::new(name, |url| {
            Ok(RenderedPage {
                status: 200,
                html: html_page(url.path(), &format!("Content of {url}")),
            })
        })
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Count calls on `gauge`, which may be shared with other doubles.
    pub(crate) fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = gauge;
        self
    }

    pub(crate) fn calls_for(&self, url: &str) -> usize {
        let key = Url::parse(url).map(|u| u.to_string()).unwrap_or_default();
        self.calls.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl RenderEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn render(&self, url: &Url, _timeout: Duration) -> Result<RenderedPage> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let out = (self.handler)(url);
        self.gauge.exit();
        out
    }
}
