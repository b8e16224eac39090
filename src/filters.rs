//! Composable message predicates
//!
//! Predicates are plain shared closures so they can be built once and reused
//! across runs. [`FilterSpec`] is the declarative form that lives in the
//! config file.

use crate::models::NormalizedMessage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type Predicate = Arc<dyn Fn(&NormalizedMessage) -> bool + Send + Sync>;

/// True when the message date is strictly before `threshold`
pub fn older_than(threshold: DateTime<Utc>) -> Predicate {
    Arc::new(move |msg: &NormalizedMessage| msg.date < threshold)
}

/// Match a full address (value contains `@`) or a sender domain
///
/// Address matching is exact, domain matching compares the sender's domain
/// part. Both are case-insensitive.
pub fn from_sender_or_domain(value: &str) -> Predicate {
    let value = value.trim().to_lowercase();
    if value.contains('@') {
        Arc::new(move |msg: &NormalizedMessage| msg.sender.to_lowercase() == value)
    } else {
        let domain = value.trim_start_matches('@').to_string();
        Arc::new(move |msg: &NormalizedMessage| msg.sender_domain().eq_ignore_ascii_case(&domain))
    }
}

/// Case-insensitive substring match on the subject
pub fn subject_contains(keyword: &str) -> Predicate {
    let keyword = keyword.to_lowercase();
    Arc::new(move |msg: &NormalizedMessage| {
        !msg.subject.is_empty() && msg.subject.to_lowercase().contains(&keyword)
    })
}

pub fn size_greater_than(bytes: u64) -> Predicate {
    Arc::new(move |msg: &NormalizedMessage| msg.size_bytes > bytes)
}

pub fn has_category(category: &str) -> Predicate {
    let category = category.trim().to_lowercase();
    Arc::new(move |msg: &NormalizedMessage| msg.categories.contains(&category))
}

pub fn is_unread() -> Predicate {
    Arc::new(|msg: &NormalizedMessage| !msg.is_read)
}

/// Conjunction, short-circuits on the first false. Empty is true.
pub fn and_all(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |msg: &NormalizedMessage| predicates.iter().all(|p| p(msg)))
}

/// Disjunction, short-circuits on the first true. Empty is false.
pub fn or_any(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |msg: &NormalizedMessage| predicates.iter().any(|p| p(msg)))
}

/// Declarative predicate, as written in `cleaning.scope`
///
/// ```toml
/// [cleaning.scope]
/// all = [{ older_than_days = 7 }, { category = "promotions" }]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    OlderThanDays(u32),
    From(String),
    SubjectContains(String),
    LargerThan(u64),
    Category(String),
    Unread(bool),
    All(Vec<FilterSpec>),
    Any(Vec<FilterSpec>),
}

impl FilterSpec {
    /// Build the predicate, resolving relative ages against `now`
    pub fn build(&self, now: DateTime<Utc>) -> Predicate {
        match self {
            FilterSpec::OlderThanDays(days) => older_than(now - Duration::days(i64::from(*days))),
            FilterSpec::From(value) => from_sender_or_domain(value),
            FilterSpec::SubjectContains(keyword) => subject_contains(keyword),
            FilterSpec::LargerThan(bytes) => size_greater_than(*bytes),
            FilterSpec::Category(category) => has_category(category),
            FilterSpec::Unread(true) => is_unread(),
            FilterSpec::Unread(false) => Arc::new(|msg: &NormalizedMessage| msg.is_read),
            FilterSpec::All(specs) => and_all(specs.iter().map(|s| s.build(now)).collect()),
            FilterSpec::Any(specs) => or_any(specs.iter().map(|s| s.build(now)).collect()),
        }
    }
}
