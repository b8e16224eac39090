//! Unsubscribe link discovery and HTTP follow-through

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::config::UnsubscribeConfig;
use crate::error::{CleanupError, Result};
use crate::models::{NormalizedMessage, UnsubscribeAttemptResult};

/// Status of a completed HTTP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOutcome {
    pub status: u16,
    /// 2xx after redirects
    pub ok: bool,
}

/// Issues the request behind an unsubscribe link
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UnsubscribeTransport: Send + Sync {
    async fn request(&self, method: Method, url: &str) -> Result<HttpOutcome>;
}

/// `reqwest`-backed transport; redirects are followed
pub struct HttpUnsubscribeClient {
    client: reqwest::Client,
}

impl HttpUnsubscribeClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| CleanupError::HttpError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_config(config: &UnsubscribeConfig) -> Result<Self> {
        Self::new(
            Duration::from_secs(config.request_timeout_secs),
            &config.user_agent,
        )
    }
}

#[async_trait]
impl UnsubscribeTransport for HttpUnsubscribeClient {
    async fn request(&self, method: Method, url: &str) -> Result<HttpOutcome> {
        let parsed = url::Url::parse(url)
            .map_err(|e| CleanupError::HttpError(format!("Invalid URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CleanupError::HttpError(format!(
                "Unsupported scheme '{}' in {}",
                parsed.scheme(),
                url
            )));
        }

        let response = self.client.request(method, parsed).send().await?;
        let status = response.status();
        Ok(HttpOutcome {
            status: status.as_u16(),
            ok: status.is_success(),
        })
    }
}

/// Links found in one message and, when requested, what happened to each
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeReport {
    pub links: Vec<String>,
    /// `None` when no request was issued
    pub results: Option<Vec<UnsubscribeAttemptResult>>,
}

impl UnsubscribeReport {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .flatten()
            .filter(|r| r.succeeded)
            .count()
    }
}

/// GET every link, one after the other, in the given order
///
/// A failed request is recorded and does not stop later links.
pub async fn unsubscribe_from_links(
    links: &[String],
    transport: &dyn UnsubscribeTransport,
) -> Vec<UnsubscribeAttemptResult> {
    let mut results = Vec::with_capacity(links.len());

    for url in links {
        let result = match transport.request(Method::GET, url).await {
            Ok(outcome) => {
                debug!(url = %url, status = outcome.status, "unsubscribe request completed");
                UnsubscribeAttemptResult::from_response(url.clone(), outcome.status, outcome.ok)
            }
            Err(e) => {
                warn!(url = %url, "Unsubscribe request failed: {}", e);
                UnsubscribeAttemptResult::from_error(url.clone(), e)
            }
        };
        results.push(result);
    }

    results
}

/// Extract unsubscribe links from a message body and optionally follow them
pub async fn unsubscribe_from_email(
    html: &str,
    auto_unsubscribe: bool,
    classifier: &Classifier,
    transport: &dyn UnsubscribeTransport,
) -> UnsubscribeReport {
    let links = classifier.extract_unsubscribe_links(html);
    follow_links(links, auto_unsubscribe, transport).await
}

/// Like [`unsubscribe_from_email`], adding the http(s) targets of the
/// message's `List-Unsubscribe` header after the body links
pub async fn unsubscribe_from_message(
    message: &NormalizedMessage,
    auto_unsubscribe: bool,
    classifier: &Classifier,
    transport: &dyn UnsubscribeTransport,
) -> UnsubscribeReport {
    let mut links = message
        .html_body
        .as_deref()
        .map(|html| classifier.extract_unsubscribe_links(html))
        .unwrap_or_default();
    for link in message
        .list_unsubscribe
        .as_deref()
        .map(list_unsubscribe_links)
        .unwrap_or_default()
    {
        if !links.contains(&link) {
            links.push(link);
        }
    }
    follow_links(links, auto_unsubscribe, transport).await
}

/// http(s) URIs of a `List-Unsubscribe` header (RFC 2369), in header order
///
/// `mailto:` entries are skipped; they need a mail client, not a request.
pub fn list_unsubscribe_links(header: &str) -> Vec<String> {
    header
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let uri = entry.strip_prefix('<')?.strip_suffix('>')?.trim();
            let parsed = url::Url::parse(uri).ok()?;
            matches!(parsed.scheme(), "http" | "https").then(|| uri.to_string())
        })
        .collect()
}

async fn follow_links(
    links: Vec<String>,
    auto_unsubscribe: bool,
    transport: &dyn UnsubscribeTransport,
) -> UnsubscribeReport {
    if !auto_unsubscribe || links.is_empty() {
        return UnsubscribeReport {
            links,
            results: None,
        };
    }

    let results = unsubscribe_from_links(&links, transport).await;
    UnsubscribeReport {
        links,
        results: Some(results),
    }
}
