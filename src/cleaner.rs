//! Rule-ordered cleaning of a message batch

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::client::MailProvider;
use crate::config::CleaningConfig;
use crate::error::Result;
use crate::models::{CleaningAction, CleaningOutcome, NormalizedMessage};

/// Which rules are active for one cleaning run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleaningOptions {
    pub delete_newsletters: bool,
    pub delete_spam: bool,
    /// `None` or `Some(0)` disables the age rule
    pub max_age_days: Option<u32>,
    /// Protected addresses, compared trimmed and case-insensitively however
    /// they were inserted
    pub except_senders: HashSet<String>,
}

impl CleaningOptions {
    pub fn with_except_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.except_senders = senders
            .into_iter()
            .map(|s| s.as_ref().trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    fn is_protected(&self, sender: &str) -> bool {
        let sender = sender.trim().to_lowercase();
        self.except_senders.contains(&sender)
            || self
                .except_senders
                .iter()
                .any(|protected| protected.trim().to_lowercase() == sender)
    }

    fn max_age(&self) -> Option<Duration> {
        self.max_age_days
            .filter(|days| *days > 0)
            .map(|days| Duration::days(i64::from(days)))
    }
}

impl From<&CleaningConfig> for CleaningOptions {
    fn from(config: &CleaningConfig) -> Self {
        CleaningOptions {
            delete_newsletters: config.delete_newsletters,
            delete_spam: config.delete_spam,
            max_age_days: config.max_age_days,
            except_senders: HashSet::new(),
        }
        .with_except_senders(&config.except_senders)
    }
}

/// Removes one message from the mailbox
#[async_trait]
pub trait MessageDeleter: Send + Sync {
    async fn delete(&self, message_id: &str) -> Result<()>;
}

/// Deletes through a live provider connection
pub struct ProviderDeleter<'a>(pub &'a dyn MailProvider);

#[async_trait]
impl MessageDeleter for ProviderDeleter<'_> {
    async fn delete(&self, message_id: &str) -> Result<()> {
        self.0.delete_message(message_id).await
    }
}

/// Records deletions without touching the mailbox
#[derive(Debug, Default)]
pub struct DryRunDeleter {
    deleted: Mutex<Vec<String>>,
}

impl DryRunDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids that would have been deleted, in call order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageDeleter for DryRunDeleter {
    async fn delete(&self, message_id: &str) -> Result<()> {
        info!(message_id, "[dry run] would delete message");
        if let Ok(mut ids) = self.deleted.lock() {
            ids.push(message_id.to_string());
        }
        Ok(())
    }
}

/// Apply the cleaning rules to every message, in order
///
/// Rules are checked protected sender, age, newsletter, spam; the first one
/// that matches decides the action. A failed delete is recorded as
/// [`CleaningAction::Error`] and the batch continues. The result has one
/// entry per input message, in input order.
pub async fn clean_emails(
    messages: &[NormalizedMessage],
    options: &CleaningOptions,
    classifier: &Classifier,
    deleter: &dyn MessageDeleter,
    now: DateTime<Utc>,
) -> Vec<CleaningOutcome> {
    let max_age = options.max_age();
    let mut outcomes = Vec::with_capacity(messages.len());

    for message in messages {
        let action = decide_and_apply(message, options, max_age, classifier, deleter, now).await;
        debug!(message_id = %message.id, action = %action, "cleaned message");
        outcomes.push(CleaningOutcome {
            message_id: message.id.clone(),
            action,
        });
    }

    let deleted = outcomes.iter().filter(|o| o.action.is_deletion()).count();
    debug!(total = outcomes.len(), deleted, "Cleaning pass finished");
    outcomes
}

async fn decide_and_apply(
    message: &NormalizedMessage,
    options: &CleaningOptions,
    max_age: Option<Duration>,
    classifier: &Classifier,
    deleter: &dyn MessageDeleter,
    now: DateTime<Utc>,
) -> CleaningAction {
    if options.is_protected(&message.sender) {
        return CleaningAction::SkippedProtected;
    }

    let deletion = if max_age.is_some_and(|age| now - message.date > age) {
        CleaningAction::DeletedTooOld
    } else if options.delete_newsletters
        && classifier.classify_newsletter(
            &message.subject,
            &message.sender,
            message.html_body.as_deref(),
        )
    {
        CleaningAction::DeletedNewsletter
    } else if options.delete_spam && message.is_spam {
        CleaningAction::DeletedSpam
    } else {
        return CleaningAction::Kept;
    };

    match deleter.delete(&message.id).await {
        Ok(()) => deletion,
        Err(e) => {
            warn!(message_id = %message.id, "Failed to delete message: {}", e);
            CleaningAction::Error(e.to_string())
        }
    }
}
