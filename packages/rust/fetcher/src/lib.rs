//! Render engines and URL guarding for page fetches.
//!
//! This crate provides:
//! - [`RenderEngine`]: the capability the content fetcher drives, one page at a time
//! - [`HttpEngine`]: plain HTTP GET
//! - [`BrowserlessEngine`]: full page render through a Browserless `/content` endpoint
//! - [`guard`]: scheme and private-network checks applied before any engine runs

mod browserless;
pub mod guard;
mod http;

use std::time::Duration;

use async_trait::async_trait;
use markwise_shared::{EngineKind, MarkwiseError, Result};
use url::Url;

pub use browserless::BrowserlessEngine;
pub use guard::{check_url, is_private_ip};
pub use http::HttpEngine;

/// A rendered page as returned by an engine.
///
/// Non-2xx responses are returned as pages, not errors, so callers can
/// inspect the body of error pages.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub status: u16,
    pub html: String,
}

impl RenderedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something that can turn a URL into HTML.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Fetch and render `url`, giving up after `timeout`.
    ///
    /// Transport failures are `Network`, an exceeded timeout is `Timeout`.
    async fn render(&self, url: &Url, timeout: Duration) -> Result<RenderedPage>;
}

/// Label for an [`EngineKind`], matching each engine's [`RenderEngine::name`].
pub fn engine_label(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::Http => http::NAME,
        EngineKind::Browserless => browserless::NAME,
    }
}

/// Map a reqwest failure onto the shared error taxonomy.
pub(crate) fn transport_error(engine: &str, url: &Url, e: reqwest::Error) -> MarkwiseError {
    if e.is_timeout() {
        MarkwiseError::Timeout(format!("{engine}: {url}"))
    } else {
        MarkwiseError::Network(format!("{engine}: {url}: {e}"))
    }
}
