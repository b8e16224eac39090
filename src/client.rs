//! Provider abstraction and the Gmail API implementation

use async_trait::async_trait;
use google_gmail1::api::ModifyMessageRequest;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::auth::{GmailHub, GMAIL_FULL_SCOPE, GMAIL_MODIFY_SCOPE};
use crate::config::GmailConfig;
use crate::error::{CleanupError, Result};
use crate::parser::RawMessage;

/// The four mailbox verbs every backend supports
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Ids of messages matching a provider-specific query
    async fn list_messages(&self, query: &str) -> Result<Vec<String>>;

    /// Full message, including bodies
    async fn get_message(&self, id: &str) -> Result<RawMessage>;

    async fn delete_message(&self, id: &str) -> Result<()>;

    async fn mark_read(&self, id: &str, read: bool) -> Result<()>;
}

/// Execute an async operation with exponential backoff retry
///
/// Only transient errors (rate limit, 5xx, network) are retried. The delay
/// starts at one second, doubles per attempt and is capped at 30 seconds; a
/// rate-limit response raises the delay to its `retry_after` hint.
pub(crate) async fn with_retry<T, F, Fut>(
    operation_name: &str,
    max_retries: u32,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts <= max_retries => {
                if let CleanupError::RateLimitExceeded { retry_after } = e {
                    delay = delay.max(Duration::from_secs(retry_after));
                }
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

const MAX_RETRIES: u32 = 3;

/// Gmail API provider with rate limiting and retry logic
///
/// Concurrent calls are bounded by a semaphore so callers can fan out
/// fetches without tripping the per-user quota.
pub struct GmailProvider {
    hub: GmailHub,
    rate_limiter: Arc<Semaphore>,
    permanent_delete: bool,
    max_messages: usize,
}

impl GmailProvider {
    pub fn new(hub: GmailHub, config: &GmailConfig, max_messages: usize) -> Self {
        Self {
            hub,
            rate_limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            permanent_delete: config.permanent_delete,
            max_messages,
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.rate_limiter.acquire().await.map_err(|e| {
            CleanupError::Unknown(format!("Failed to acquire rate limit permit: {}", e))
        })
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn list_messages(&self, query: &str) -> Result<Vec<String>> {
        let mut all_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = self.max_messages.saturating_sub(all_ids.len());
            if remaining == 0 {
                break;
            }
            let page_size = remaining.min(500) as u32;

            let response = with_retry("list_messages", MAX_RETRIES, || {
                let token = page_token.clone();
                async move {
                    let _permit = self.permit().await?;
                    let mut call = self
                        .hub
                        .users()
                        .messages_list("me")
                        .q(query)
                        .max_results(page_size);
                    if let Some(token) = token.as_ref() {
                        call = call.page_token(token);
                    }
                    let (_, response) = call.add_scope(GMAIL_MODIFY_SCOPE).doit().await?;
                    Ok(response)
                }
            })
            .await?;

            for msg_ref in response.messages.unwrap_or_default() {
                if let Some(id) = msg_ref.id {
                    all_ids.push(id);
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        all_ids.truncate(self.max_messages);
        debug!(count = all_ids.len(), query, "Listed Gmail messages");
        Ok(all_ids)
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage> {
        with_retry("get_message", MAX_RETRIES, || async {
            let _permit = self.permit().await?;
            let (_, msg) = self
                .hub
                .users()
                .messages_get("me", id)
                .format("full")
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(RawMessage::Gmail(msg))
        })
        .await
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        with_retry("delete_message", MAX_RETRIES, || async {
            let _permit = self.permit().await?;
            if self.permanent_delete {
                self.hub
                    .users()
                    .messages_delete("me", id)
                    .add_scope(GMAIL_FULL_SCOPE)
                    .doit()
                    .await?;
            } else {
                self.hub
                    .users()
                    .messages_trash("me", id)
                    .add_scope(GMAIL_MODIFY_SCOPE)
                    .doit()
                    .await?;
            }
            Ok(())
        })
        .await
    }

    async fn mark_read(&self, id: &str, read: bool) -> Result<()> {
        let unread = vec!["UNREAD".to_string()];
        let request = if read {
            ModifyMessageRequest {
                remove_label_ids: Some(unread),
                ..Default::default()
            }
        } else {
            ModifyMessageRequest {
                add_label_ids: Some(unread),
                ..Default::default()
            }
        };

        with_retry("mark_read", MAX_RETRIES, || {
            let request = request.clone();
            async move {
                let _permit = self.permit().await?;
                self.hub
                    .users()
                    .messages_modify(request, "me", id)
                    .add_scope(GMAIL_MODIFY_SCOPE)
                    .doit()
                    .await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_succeeds_after_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                let current = count.fetch_add(1, Ordering::SeqCst);
                if current < 2 {
                    Err(CleanupError::NetworkError("Connection timeout".to_string()))
                } else {
                    Ok("success".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_fails_on_permanent_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(CleanupError::AuthError("Invalid credentials".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_exhausts_all_retries() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(CleanupError::RateLimitExceeded { retry_after: 1 })
            }
        })
        .await;

        assert!(matches!(result, Err(CleanupError::RateLimitExceeded { .. })));
        // initial + 3 retries
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_honours_retry_after() {
        let start = tokio::time::Instant::now();
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_retry("test_op", 1, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CleanupError::RateLimitExceeded { retry_after: 20 })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(20));
    }
}
