//! Full page rendering through a Browserless-compatible `/content` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use markwise_shared::{MarkwiseError, Result};

use crate::{RenderEngine, RenderedPage, transport_error};

pub(crate) const NAME: &str = "browserless";

/// Header Browserless uses to report the target page's own status.
const RESPONSE_CODE_HEADER: &str = "x-response-code";

/// Extra time granted to the service on top of the navigation timeout.
const SERVICE_GRACE: Duration = Duration::from_secs(5);

/// Runs pages in a headless browser so client-rendered content is present.
pub struct BrowserlessEngine {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessEngine {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| MarkwiseError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl RenderEngine for BrowserlessEngine {
    fn name(&self) -> &str {
        NAME
    }

    #[instrument(skip_all, fields(engine = NAME, url = %url))]
    async fn render(&self, url: &Url, timeout: Duration) -> Result<RenderedPage> {
        let endpoint = format!("{}/content", self.base_url);
        let body = serde_json::json!({
            "url": url.as_str(),
            "gotoOptions": {
                "waitUntil": "networkidle2",
                "timeout": timeout.as_millis() as u64,
            },
        });

        let mut request = self
            .client
            .post(&endpoint)
            .json(&body)
            .timeout(timeout + SERVICE_GRACE);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.as_str())]);
        }

        let response = request.send().await.map_err(|e| transport_error(NAME, url, e))?;

        let service_status = response.status();
        if !service_status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MarkwiseError::http(
                service_status.as_u16(),
                format!("{NAME} service: {url}: {}", message.trim()),
            ));
        }

        let status = response
            .headers()
            .get(RESPONSE_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(200);

        let html = response
            .text()
            .await
            .map_err(|e| transport_error(NAME, url, e))?;

        debug!(status, len = html.len(), "page rendered");
        Ok(RenderedPage { status, html })
    }
}
