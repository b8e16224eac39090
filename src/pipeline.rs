//! List, fetch, classify and act on one mailbox
//!
//! A [`Pipeline`] is the unit of work behind the `clean` and `unsubscribe`
//! commands and the job the scheduler re-runs.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::cleaner::{clean_emails, CleaningOptions, DryRunDeleter, MessageDeleter, ProviderDeleter};
use crate::client::MailProvider;
use crate::config::{AccountConfig, Config};
use crate::entitlements::{EntitlementStore, Feature, PremiumLevel, SubscriptionUpdate, UserEntitlement, UserStore};
use crate::error::{CleanupError, Result};
use crate::filters::FilterSpec;
use crate::models::{CleaningAction, CleaningOutcome, NormalizedMessage};
use crate::parser::extract_metadata_at;
use crate::scheduler::{job, JobTask};
use crate::unsubscribe::{unsubscribe_from_message, UnsubscribeReport, UnsubscribeTransport};

/// A message that could not be fetched or parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub message_id: String,
    pub error: String,
}

/// Normalized, annotated messages plus the ids that failed along the way
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Number of ids the provider listed
    pub listed: usize,
    /// Messages that passed the scope filter, in listing order
    pub messages: Vec<NormalizedMessage>,
    pub failures: Vec<FetchFailure>,
}

/// Per-action counts of a cleaning run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanSummary {
    pub protected: usize,
    pub deleted_too_old: usize,
    pub deleted_newsletter: usize,
    pub deleted_spam: usize,
    pub kept: usize,
    pub errors: usize,
}

impl CleanSummary {
    pub fn from_outcomes(outcomes: &[CleaningOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome.action {
                CleaningAction::SkippedProtected => summary.protected += 1,
                CleaningAction::DeletedTooOld => summary.deleted_too_old += 1,
                CleaningAction::DeletedNewsletter => summary.deleted_newsletter += 1,
                CleaningAction::DeletedSpam => summary.deleted_spam += 1,
                CleaningAction::Kept => summary.kept += 1,
                CleaningAction::Error(_) => summary.errors += 1,
            }
        }
        summary
    }

    pub fn deleted(&self) -> usize {
        self.deleted_too_old + self.deleted_newsletter + self.deleted_spam
    }
}

/// Everything one cleaning run did, serializable as the JSON report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub listed: usize,
    pub in_scope: usize,
    pub summary: CleanSummary,
    pub outcomes: Vec<CleaningOutcome>,
    pub fetch_failures: Vec<FetchFailure>,
}

impl CleanReport {
    pub async fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        info!("Wrote clean report to {:?}", path);
        Ok(())
    }
}

/// Unsubscribe links found in one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnsubscribe {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    #[serde(flatten)]
    pub report: UnsubscribeReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRunReport {
    pub auto_unsubscribe: bool,
    /// Only messages with at least one link
    pub messages: Vec<MessageUnsubscribe>,
}

impl UnsubscribeRunReport {
    pub fn link_count(&self) -> usize {
        self.messages.iter().map(|m| m.report.links.len()).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.messages.iter().map(|m| m.report.succeeded()).sum()
    }
}

/// One configured mailbox with its classifier and cleaning rules
pub struct Pipeline {
    provider: Arc<dyn MailProvider>,
    classifier: Arc<Classifier>,
    query: String,
    max_concurrent_fetches: usize,
    scope: Option<FilterSpec>,
    options: CleaningOptions,
    progress: ProgressBar,
}

impl Pipeline {
    pub fn new(provider: Arc<dyn MailProvider>, classifier: Arc<Classifier>, config: &Config) -> Self {
        Self {
            provider,
            classifier,
            query: config.provider.effective_query().to_string(),
            max_concurrent_fetches: config.provider.max_concurrent_fetches.max(1),
            scope: config.cleaning.scope.clone(),
            options: CleaningOptions::from(&config.cleaning),
            progress: ProgressBar::hidden(),
        }
    }

    /// Report fetch progress on `progress` (length is set once ids are listed)
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_options(mut self, options: CleaningOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CleaningOptions {
        &self.options
    }

    /// List, fetch and normalize messages, then keep those in scope
    ///
    /// Listing errors abort the run. A message that fails to fetch or parse is
    /// recorded in [`FetchResult::failures`] and skipped.
    pub async fn fetch(&self, now: DateTime<Utc>) -> Result<FetchResult> {
        let ids = self.provider.list_messages(&self.query).await?;
        let listed = ids.len();
        info!(count = listed, query = %self.query, "Listed messages");

        self.progress.set_length(listed as u64);
        self.progress.set_position(0);

        let provider = &self.provider;
        let progress = &self.progress;
        let fetched: Vec<(String, Result<NormalizedMessage>)> = stream::iter(ids)
            .map(|id| async move {
                let result = provider
                    .get_message(&id)
                    .await
                    .and_then(|raw| extract_metadata_at(&raw, now));
                progress.inc(1);
                (id, result)
            })
            .buffered(self.max_concurrent_fetches)
            .collect()
            .await;

        let in_scope = self.scope.as_ref().map(|spec| spec.build(now));
        let mut result = FetchResult {
            listed,
            ..FetchResult::default()
        };

        for (id, fetched) in fetched {
            match fetched {
                Ok(mut message) => {
                    self.classifier.annotate(&mut message);
                    if in_scope.as_ref().map_or(true, |pred| pred(&message)) {
                        result.messages.push(message);
                    } else {
                        debug!(message_id = %id, "message outside cleaning scope");
                    }
                }
                Err(e) => {
                    warn!(message_id = %id, "Failed to fetch message: {}", e);
                    result.failures.push(FetchFailure {
                        message_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.progress.finish_and_clear();
        Ok(result)
    }

    /// Fetch and clean; with `dry_run` nothing is deleted
    pub async fn clean(&self, dry_run: bool, now: DateTime<Utc>) -> Result<CleanReport> {
        let started_at = Utc::now();
        let fetched = self.fetch(now).await?;

        let dry_run_deleter = DryRunDeleter::new();
        let provider_deleter = ProviderDeleter(self.provider.as_ref());
        let deleter: &dyn MessageDeleter = if dry_run {
            &dry_run_deleter
        } else {
            &provider_deleter
        };

        let outcomes = clean_emails(&fetched.messages, &self.options, &self.classifier, deleter, now).await;
        let summary = CleanSummary::from_outcomes(&outcomes);
        info!(
            in_scope = fetched.messages.len(),
            deleted = summary.deleted(),
            protected = summary.protected,
            kept = summary.kept,
            errors = summary.errors,
            dry_run,
            "Cleaning finished"
        );

        Ok(CleanReport {
            started_at,
            finished_at: Utc::now(),
            dry_run,
            listed: fetched.listed,
            in_scope: fetched.messages.len(),
            summary,
            outcomes,
            fetch_failures: fetched.failures,
        })
    }

    /// Collect unsubscribe links from every in-scope message (HTML body and
    /// `List-Unsubscribe` header) and, with `auto_unsubscribe`, request each of them
    pub async fn unsubscribe(
        &self,
        auto_unsubscribe: bool,
        transport: &dyn UnsubscribeTransport,
        now: DateTime<Utc>,
    ) -> Result<UnsubscribeRunReport> {
        let fetched = self.fetch(now).await?;
        let mut report = UnsubscribeRunReport {
            auto_unsubscribe,
            messages: Vec::new(),
        };

        for message in &fetched.messages {
            let links =
                unsubscribe_from_message(message, auto_unsubscribe, &self.classifier, transport).await;
            if links.links.is_empty() {
                continue;
            }
            report.messages.push(MessageUnsubscribe {
                message_id: message.id.clone(),
                sender: message.sender.clone(),
                subject: message.subject.clone(),
                report: links,
            });
        }

        info!(
            messages = report.messages.len(),
            links = report.link_count(),
            succeeded = report.succeeded(),
            "Unsubscribe pass finished"
        );
        Ok(report)
    }
}

/// Scheduler task that runs a cleaning pass and optionally writes its report
pub fn scheduled_clean(pipeline: Arc<Pipeline>, dry_run: bool, report_path: Option<PathBuf>) -> JobTask {
    job(move || {
        let pipeline = Arc::clone(&pipeline);
        let report_path = report_path.clone();
        async move {
            let report = pipeline.clean(dry_run, Utc::now()).await?;
            if report.summary.errors > 0 {
                warn!(errors = report.summary.errors, "Scheduled clean had delete failures");
            }
            if let Some(path) = report_path {
                report.write_json(&path).await?;
            }
            Ok(())
        }
    })
}

/// Resolve the configured account and check it may use `feature`
///
/// The account's tier from the config file is applied to the store before
/// the check, so the config is the source of truth for a local install.
pub async fn authorize_feature<S: UserStore>(
    store: &EntitlementStore<S>,
    account: &AccountConfig,
    feature: Feature,
) -> Result<UserEntitlement> {
    if account.email.trim().is_empty() {
        return Err(CleanupError::ConfigError(format!(
            "account.email is required for {}",
            feature
        )));
    }

    let user = store.get_or_create_user(&account.email).await?;
    let update = SubscriptionUpdate {
        level: Some(PremiumLevel::try_from(account.premium_level)?),
        valid: Some(account.subscription_valid),
        expiry: account.subscription_expiry,
    };
    store.update_subscription(user.id, update).await?;
    store.expire_lapsed(Utc::now()).await?;
    store.require_feature(user.id, feature).await?;

    store
        .get_user(user.id)
        .await?
        .ok_or_else(|| CleanupError::Unknown(format!("user {} vanished", user.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RawMessage;
    use crate::unsubscribe::{HttpOutcome, MockUnsubscribeTransport};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mailbox backed by a map of MIME messages
    struct FakeMailbox {
        messages: Vec<(String, String)>,
        broken: Vec<String>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeMailbox {
        fn new(messages: &[(&str, String)]) -> Self {
            Self {
                messages: messages
                    .iter()
                    .map(|(id, raw)| (id.to_string(), raw.clone()))
                    .collect(),
                broken: Vec::new(),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MailProvider for FakeMailbox {
        async fn list_messages(&self, _query: &str) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self.messages.iter().map(|(id, _)| id.clone()).collect();
            ids.extend(self.broken.iter().cloned());
            Ok(ids)
        }

        async fn get_message(&self, id: &str) -> Result<RawMessage> {
            let by_id: HashMap<_, _> = self.messages.iter().cloned().collect();
            by_id
                .get(id)
                .map(|raw| RawMessage::Mime {
                    id: id.to_string(),
                    raw: raw.clone().into_bytes(),
                    seen: true,
                })
                .ok_or_else(|| CleanupError::MessageNotFound(id.to_string()))
        }

        async fn delete_message(&self, id: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn mark_read(&self, _id: &str, _read: bool) -> Result<()> {
            Ok(())
        }
    }

    fn mime(from: &str, subject: &str, date: DateTime<Utc>, html: &str) -> String {
        format!(
            "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}\r\n",
            from,
            subject,
            date.to_rfc2822(),
            html
        )
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.cleaning.delete_newsletters = true;
        config.cleaning.delete_spam = true;
        config.cleaning.max_age_days = Some(30);
        config.cleaning.except_senders = vec!["boss@corp.com".to_string()];
        config
    }

    fn mailbox(now: DateTime<Utc>) -> FakeMailbox {
        FakeMailbox::new(&[
            (
                "1",
                mime("Boss <boss@corp.com>", "Weekly newsletter", now - Duration::days(500), "<p>hi</p>"),
            ),
            (
                "2",
                mime("Shop <deals@shop.example>", "Big sale", now - Duration::days(2),
                    r#"<a href="https://shop.example/unsubscribe">Unsubscribe</a>"#),
            ),
            (
                "3",
                mime("Finance <finance@corp.com>", "Q3 Budget Review", now - Duration::days(1), "<p>numbers</p>"),
            ),
            (
                "4",
                mime("Old <old@corp.com>", "Minutes", now - Duration::days(45), "<p>old</p>"),
            ),
        ])
    }

    #[tokio::test]
    async fn test_clean_applies_rules_in_listing_order() {
        let now = Utc::now();
        let provider = Arc::new(mailbox(now));
        let pipeline = Pipeline::new(provider.clone(), Arc::new(Classifier::default()), &config());

        let report = pipeline.clean(false, now).await.unwrap();
        let actions: Vec<_> = report
            .outcomes
            .iter()
            .map(|o| (o.message_id.as_str(), o.action.clone()))
            .collect();

        assert_eq!(
            actions,
            vec![
                ("1", CleaningAction::SkippedProtected),
                ("2", CleaningAction::DeletedNewsletter),
                ("3", CleaningAction::Kept),
                ("4", CleaningAction::DeletedTooOld),
            ]
        );
        assert_eq!(report.summary.deleted(), 2);
        assert_eq!(*provider.deleted.lock().unwrap(), vec!["2", "4"]);
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let now = Utc::now();
        let provider = Arc::new(mailbox(now));
        let pipeline = Pipeline::new(provider.clone(), Arc::new(Classifier::default()), &config());

        let report = pipeline.clean(true, now).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.summary.deleted(), 2);
        assert!(provider.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failures_are_recorded_and_skipped() {
        let now = Utc::now();
        let mut provider = mailbox(now);
        provider.broken.push("missing".to_string());
        let pipeline = Pipeline::new(Arc::new(provider), Arc::new(Classifier::default()), &config());

        let fetched = pipeline.fetch(now).await.unwrap();
        assert_eq!(fetched.listed, 5);
        assert_eq!(fetched.messages.len(), 4);
        assert_eq!(fetched.failures.len(), 1);
        assert_eq!(fetched.failures[0].message_id, "missing");
    }

    #[tokio::test]
    async fn test_scope_limits_cleaned_messages() {
        let now = Utc::now();
        let mut config = config();
        config.cleaning.scope = Some(FilterSpec::From("corp.com".to_string()));
        let pipeline = Pipeline::new(Arc::new(mailbox(now)), Arc::new(Classifier::default()), &config);

        let report = pipeline.clean(true, now).await.unwrap();
        let ids: Vec<_> = report.outcomes.iter().map(|o| o.message_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "4"]);
        assert_eq!(report.listed, 4);
        assert_eq!(report.in_scope, 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_only_messages_with_links() {
        let now = Utc::now();
        let pipeline = Pipeline::new(Arc::new(mailbox(now)), Arc::new(Classifier::default()), &config());

        let mut transport = MockUnsubscribeTransport::new();
        transport
            .expect_request()
            .times(1)
            .returning(|_, _| Ok(HttpOutcome { status: 200, ok: true }));

        let report = pipeline.unsubscribe(true, &transport, now).await.unwrap();
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].message_id, "2");
        assert_eq!(report.link_count(), 1);
        assert_eq!(report.succeeded(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_clean_writes_report() {
        let now = Utc::now();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reports").join("clean.json");
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(mailbox(now)),
            Arc::new(Classifier::default()),
            &config(),
        ));

        let task = scheduled_clean(pipeline, true, Some(path.clone()));
        task().await.unwrap();

        let written: CleanReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.outcomes.len(), 4);
        assert!(written.dry_run);
    }

    #[tokio::test]
    async fn test_authorize_feature_uses_account_tier() {
        let store = EntitlementStore::in_memory();
        let mut account = AccountConfig {
            email: "User@Example.com".to_string(),
            premium_level: 1,
            subscription_valid: true,
            subscription_expiry: None,
        };

        let user = authorize_feature(&store, &account, Feature::AutoUnsubscribe)
            .await
            .unwrap();
        assert_eq!(user.email, "user@example.com");

        let err = authorize_feature(&store, &account, Feature::ScheduledCleaning)
            .await
            .unwrap_err();
        assert!(matches!(err, CleanupError::AccessDenied(_)));

        account.premium_level = 2;
        account.subscription_expiry = Some(Utc::now() - Duration::days(1));
        let err = authorize_feature(&store, &account, Feature::ScheduledCleaning)
            .await
            .unwrap_err();
        assert!(matches!(err, CleanupError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_authorize_feature_requires_email() {
        let store = EntitlementStore::in_memory();
        let err = authorize_feature(&store, &AccountConfig::default(), Feature::AutoUnsubscribe)
            .await
            .unwrap_err();
        assert!(matches!(err, CleanupError::ConfigError(_)));
    }
}
