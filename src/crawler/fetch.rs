//! Page fetch transport.
//!
//! The extractor and discovery talk to the network through [`PageFetcher`],
//! so the whole pipeline can run against scripted responses in tests. The
//! real implementation classifies failures into the crawl taxonomy: the
//! scheduler picks a backoff per class, so the transport itself never
//! retries.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tracing::debug;

use crate::models::Config;

const USER_AGENT: &str = "PriceWatchBot/1.0 (+https://pricewatch.example/bot)";
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";

/// Classified fetch failure; maps 1:1 onto terminal crawl statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// 401/403/429 or bot-protection responses.
    Blocked(String),
    /// Other 4xx or non-HTML content; needs a human to pick a better URL.
    ManualNeeded(String),
    /// Timeouts, transport errors, 5xx.
    Error(String),
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a page and return its HTML, truncated to the configured cap.
    async fn fetch(&self, url: &str) -> Result<String, FetchFailure>;
}

/// reqwest-backed fetcher with a bounded deadline per request.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    max_html_length: usize,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Self {
        let timeout = Duration::from_millis(config.crawl_fetch_timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            timeout,
            max_html_length: config.crawl_max_html_length,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchFailure> {
        let request = self
            .client
            .get(url)
            .header(header::ACCEPT, ACCEPT_HTML)
            .header(header::CACHE_CONTROL, "no-cache");

        // Outer deadline covers connect, redirects, and body download.
        let result = tokio::time::timeout(self.timeout, async {
            let response = request.send().await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, content_type, body))
        })
        .await;

        let (status, content_type, body) = match result {
            Err(_) => return Err(FetchFailure::Error("Request timed out".to_string())),
            Ok(Err(e)) if e.is_timeout() => {
                return Err(FetchFailure::Error("Request timed out".to_string()))
            }
            Ok(Err(e)) => return Err(FetchFailure::Error(format!("Request failed: {e}"))),
            Ok(Ok(parts)) => parts,
        };

        classify_status(status)?;

        if let Some(ct) = &content_type {
            if !ct.to_ascii_lowercase().contains("text/html") {
                return Err(FetchFailure::ManualNeeded(format!(
                    "Unsupported content type: {ct}"
                )));
            }
        }

        debug!(url, bytes = body.len(), "Fetched page");
        Ok(truncate_chars(body, self.max_html_length))
    }
}

fn classify_status(status: StatusCode) -> Result<(), FetchFailure> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            Err(FetchFailure::Blocked(format!("HTTP {}", status.as_u16())))
        }
        s if s.is_client_error() => Err(FetchFailure::ManualNeeded(format!(
            "HTTP {}",
            s.as_u16()
        ))),
        s => Err(FetchFailure::Error(format!("HTTP {}", s.as_u16()))),
    }
}

fn truncate_chars(body: String, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((byte_idx, _)) => body[..byte_idx].to_string(),
        None => body,
    }
}

/// Scripted fetcher for tests: maps normalized URLs to canned outcomes.
/// Responses can be swapped mid-test to simulate a page changing between
/// crawls.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: parking_lot::Mutex<HashMap<String, Result<String, FetchFailure>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_html(self, url: &str, html: &str) -> Self {
        self.set_html(url, html);
        self
    }

    pub fn with_failure(self, url: &str, failure: FetchFailure) -> Self {
        self.set_failure(url, failure);
        self
    }

    pub fn set_html(&self, url: &str, html: &str) {
        self.responses
            .lock()
            .insert(url.to_string(), Ok(html.to_string()));
    }

    pub fn set_failure(&self, url: &str, failure: FetchFailure) {
        self.responses.lock().insert(url.to_string(), Err(failure));
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchFailure> {
        self.responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(FetchFailure::Error(format!("No scripted response for {url}"))))
    }
}
