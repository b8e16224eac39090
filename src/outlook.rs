//! Microsoft Graph mail provider

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::auth::OAuthManager;
use crate::client::{with_retry, MailProvider};
use crate::config::OutlookConfig;
use crate::error::{parse_retry_after, CleanupError, Result};
use crate::parser::{OutlookMessage, RawMessage};

const MAX_RETRIES: u32 = 3;

const MESSAGE_FIELDS: &str = "id,subject,receivedDateTime,from,isRead,body,categories,\
inferenceClassification,internetMessageHeaders";

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<MessageRef>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Graph `/me` mailbox with a bearer token from an [`OAuthManager`]
pub struct OutlookProvider {
    http: reqwest::Client,
    oauth: Arc<OAuthManager>,
    base_url: Url,
    folder: String,
    page_size: usize,
    max_messages: usize,
}

impl OutlookProvider {
    pub fn new(
        oauth: Arc<OAuthManager>,
        config: &OutlookConfig,
        max_messages: usize,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            CleanupError::ConfigError(format!("Invalid outlook.base_url '{}': {}", config.base_url, e))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            oauth,
            base_url,
            folder: config.folder.clone(),
            page_size: config.page_size,
            max_messages,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                CleanupError::ConfigError(format!("outlook.base_url cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .push("me")
            .extend(segments);
        Ok(url)
    }

    fn list_url(&self, query: &str, top: usize) -> Result<Url> {
        let mut url = self.endpoint(&["mailFolders", self.folder.as_str(), "messages"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$top", &top.to_string());
            pairs.append_pair("$select", "id");
            if !query.trim().is_empty() {
                pairs.append_pair("$filter", query.trim());
            }
        }
        Ok(url)
    }

    /// Send one authenticated request, mapping non-success statuses to errors
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.oauth.access_token().await?;
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(CleanupError::from_status(status.as_u16(), &body, retry_after))
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    async fn list_messages(&self, query: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut next = Some(self.list_url(query, self.page_size.min(self.max_messages))?);

        while let Some(url) = next.take() {
            if ids.len() >= self.max_messages {
                break;
            }

            let page: MessagePage = with_retry("list_messages", MAX_RETRIES, || {
                let url = url.clone();
                async move { Ok(self.send(Method::GET, url, None).await?.json().await?) }
            })
            .await?;

            ids.extend(page.value.into_iter().map(|m| m.id));
            next = match page.next_link {
                Some(link) => Some(Url::parse(&link).map_err(|e| {
                    CleanupError::ApiError(format!("Invalid @odata.nextLink '{}': {}", link, e))
                })?),
                None => None,
            };
        }

        ids.truncate(self.max_messages);
        debug!(count = ids.len(), query, "Listed Outlook messages");
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage> {
        let mut url = self.endpoint(&["messages", id])?;
        url.query_pairs_mut().append_pair("$select", MESSAGE_FIELDS);

        let message: OutlookMessage = with_retry("get_message", MAX_RETRIES, || {
            let url = url.clone();
            async move { Ok(self.send(Method::GET, url, None).await?.json().await?) }
        })
        .await?;
        Ok(RawMessage::Outlook(message))
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&["messages", id])?;
        with_retry("delete_message", MAX_RETRIES, || {
            let url = url.clone();
            async move {
                let response = self.send(Method::DELETE, url, None).await?;
                debug!(id, status = %response.status(), "Outlook message deleted");
                Ok(())
            }
        })
        .await
    }

    async fn mark_read(&self, id: &str, read: bool) -> Result<()> {
        let url = self.endpoint(&["messages", id])?;
        let body = serde_json::json!({ "isRead": read });
        with_retry("mark_read", MAX_RETRIES, || {
            let url = url.clone();
            let body = &body;
            async move {
                self.send(Method::PATCH, url, Some(body)).await?;
                Ok(())
            }
        })
        .await
    }
}
