use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Provider-agnostic view of a message, produced by [`crate::parser`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: String,
    /// Bare sender address, lowercased
    pub sender: String,
    pub sender_name: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub size_bytes: u64,
    pub is_read: bool,
    /// Provider-flagged or inferred by the classifier
    pub is_spam: bool,
    /// Lowercase category names
    pub categories: BTreeSet<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// Raw `List-Unsubscribe` header, when the provider exposes it
    pub list_unsubscribe: Option<String>,
}

impl NormalizedMessage {
    /// Minimal message with every optional field defaulted
    pub fn new(id: impl Into<String>, sender: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            sender: sender.into().trim().to_lowercase(),
            sender_name: String::new(),
            subject: String::new(),
            date,
            size_bytes: 0,
            is_read: false,
            is_spam: false,
            categories: BTreeSet::new(),
            html_body: None,
            text_body: None,
            list_unsubscribe: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_html_body(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    pub fn with_text_body(mut self, text: impl Into<String>) -> Self {
        self.text_body = Some(text.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    pub fn with_spam(mut self, is_spam: bool) -> Self {
        self.is_spam = is_spam;
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.add_category(category);
        self
    }

    /// Insert a category, normalized to lowercase
    pub fn add_category(&mut self, category: &str) {
        let normalized = category.trim().to_lowercase();
        if !normalized.is_empty() {
            self.categories.insert(normalized);
        }
    }

    /// Domain part of the sender address (empty when the address has none)
    pub fn sender_domain(&self) -> &str {
        self.sender.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }
}

/// Outcome of running the classifier over one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_newsletter: bool,
    pub is_spam: bool,
    /// Unique links in first-seen order
    pub unsubscribe_links: Vec<String>,
}

/// The single action the cleaner took for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum CleaningAction {
    SkippedProtected,
    DeletedTooOld,
    DeletedNewsletter,
    DeletedSpam,
    Kept,
    Error(String),
}

impl CleaningAction {
    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            CleaningAction::DeletedTooOld
                | CleaningAction::DeletedNewsletter
                | CleaningAction::DeletedSpam
        )
    }
}

impl fmt::Display for CleaningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleaningAction::SkippedProtected => write!(f, "skipped - sender protected"),
            CleaningAction::DeletedTooOld => write!(f, "deleted - too old"),
            CleaningAction::DeletedNewsletter => write!(f, "deleted - newsletter"),
            CleaningAction::DeletedSpam => write!(f, "deleted - spam"),
            CleaningAction::Kept => write!(f, "kept"),
            CleaningAction::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Per-message entry of the cleaner's action log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningOutcome {
    pub message_id: String,
    #[serde(flatten)]
    pub action: CleaningAction,
}

/// Result of one unsubscribe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeAttemptResult {
    pub url: String,
    pub http_status: Option<u16>,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

impl UnsubscribeAttemptResult {
    pub fn from_response(url: impl Into<String>, status: u16, ok: bool) -> Self {
        Self {
            url: url.into(),
            http_status: Some(status),
            succeeded: ok,
            error_message: None,
        }
    }

    pub fn from_error(url: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            url: url.into(),
            http_status: None,
            succeeded: false,
            error_message: Some(error.to_string()),
        }
    }
}
