//! Plain HTTP GET engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::{debug, instrument};
use url::Url;

use markwise_shared::{MarkwiseError, Result};

use crate::{RenderEngine, RenderedPage, transport_error};

pub(crate) const NAME: &str = "http";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";

/// Fetches raw HTML without running scripts. Cheap, but blind to
/// client-rendered pages.
pub struct HttpEngine {
    client: Client,
}

impl HttpEngine {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| MarkwiseError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RenderEngine for HttpEngine {
    fn name(&self) -> &str {
        NAME
    }

    #[instrument(skip_all, fields(engine = NAME, url = %url))]
    async fn render(&self, url: &Url, timeout: Duration) -> Result<RenderedPage> {
        let response = self
            .client
            .get(url.as_str())
            .header(ACCEPT, ACCEPT_HTML)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(NAME, url, e))?;

        let status = response.status().as_u16();
        let html = response
            .text()
            .await
            .map_err(|e| transport_error(NAME, url, e))?;

        debug!(status, len = html.len(), "page fetched");
        Ok(RenderedPage { status, html })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> HttpEngine {
        HttpEngine::new("markwise-test").expect("build engine")
    }

    #[tokio::test]
    async fn returns_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .and(header("user-agent", "markwise-test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><title>Hi</title></html>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/article", server.uri())).unwrap();
        let page = engine().render(&url, Duration::from_secs(5)).await.unwrap();
        assert!(page.is_success());
        assert!(page.html.contains("<title>Hi</title>"));
    }

    #[tokio::test]
    async fn error_status_is_a_page_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("<html><title>Access denied</title></html>"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let page = engine().render(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(page.status, 403);
        assert!(!page.is_success());
        assert!(page.html.contains("Access denied"));
    }

    #[tokio::test]
    async fn slow_response_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = engine()
            .render(&url, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();

        let err = engine().render(&url, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.kind(), "network");
    }
}
