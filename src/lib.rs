//! Inbox cleanup toolkit
//!
//! Authenticates against a mail provider (Gmail, Outlook, generic IMAP),
//! fetches and normalizes messages, classifies them and applies bulk
//! actions: delete, unsubscribe, and the same on a schedule.
//!
//! # Overview
//!
//! - **Providers**: one [`client::MailProvider`] trait over the Gmail API,
//!   Microsoft Graph and IMAP
//! - **Extraction**: provider payloads become [`models::NormalizedMessage`]
//! - **Classification**: keyword/regex newsletter and spam rules plus
//!   unsubscribe link discovery
//! - **Cleaning**: fixed rule order (protected sender, age, newsletter,
//!   spam), one action per message
//! - **Scheduling**: named recurring jobs with broadcast notifications
//! - **Entitlements**: premium tiers gating auto-unsubscribe and scheduling
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use inbox_cleanup::{cli, classifier::Classifier, config::Config, pipeline::Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let provider = cli::connect_provider(&config).await?;
//!     let classifier = Arc::new(Classifier::from_config(&config.classifier)?);
//!
//!     let report = Pipeline::new(provider, classifier, &config)
//!         .clean(true, chrono::Utc::now())
//!         .await?;
//!     println!("{} message(s) would be deleted", report.summary.deleted());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - Gmail hub bootstrap and the OAuth2 code/refresh manager
//! - [`client`] - Provider trait, retry helper and the Gmail provider
//! - [`outlook`] - Microsoft Graph provider
//! - [`imap`] - IMAP provider
//! - [`parser`] - Metadata extraction from provider payloads
//! - [`classifier`] - Newsletter/spam rules and unsubscribe links
//! - [`filters`] - Composable message predicates
//! - [`cleaner`] - Rule-ordered cleaning
//! - [`unsubscribe`] - Unsubscribe requests
//! - [`scheduler`] - Recurring jobs
//! - [`entitlements`] - Premium tiers and preferences
//! - [`pipeline`] - Fetch/classify/act orchestration
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`models`] - Core data structures

pub mod auth;
pub mod classifier;
pub mod cleaner;
pub mod cli;
pub mod client;
pub mod config;
pub mod entitlements;
pub mod error;
pub mod filters;
pub mod imap;
pub mod models;
pub mod outlook;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
pub mod unsubscribe;

// Re-export commonly used types for convenience
pub use error::{CleanupError, Result};

// Core data models
pub use models::{
    CleaningAction, CleaningOutcome, ClassificationResult, NormalizedMessage,
    UnsubscribeAttemptResult,
};

pub use classifier::Classifier;
pub use cleaner::{clean_emails, CleaningOptions, DryRunDeleter, MessageDeleter};
pub use client::{GmailProvider, MailProvider};
pub use config::{Config, ProviderKind};
pub use entitlements::{EntitlementStore, Feature, PremiumLevel, UserEntitlement};
pub use filters::{FilterSpec, Predicate};
pub use imap::ImapProvider;
pub use outlook::OutlookProvider;
pub use parser::{extract_metadata, RawMessage};
pub use pipeline::{CleanReport, Pipeline};
pub use scheduler::{JobEvent, Scheduler};
pub use unsubscribe::{unsubscribe_from_email, HttpUnsubscribeClient, UnsubscribeTransport};

// CLI types (for binary usage)
pub use cli::{Cli, Commands, ProgressReporter};
