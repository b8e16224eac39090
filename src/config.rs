use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::classifier::{
    Classifier, DEFAULT_NEWSLETTER_PATTERNS, DEFAULT_SPAM_PATTERNS, DEFAULT_UNSUBSCRIBE_PATTERNS,
};
use crate::entitlements::PremiumLevel;
use crate::error::{CleanupError, Result};
use crate::filters::FilterSpec;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub outlook: OutlookConfig,
    #[serde(default)]
    pub imap: ImapConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub unsubscribe: UnsubscribeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gmail,
    Outlook,
    Imap,
}

impl ProviderKind {
    /// Query used when `provider.query` is not set
    pub fn default_query(self) -> &'static str {
        match self {
            ProviderKind::Gmail => "in:inbox",
            ProviderKind::Outlook => "",
            ProviderKind::Imap => "ALL",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Gmail => write!(f, "gmail"),
            ProviderKind::Outlook => write!(f, "outlook"),
            ProviderKind::Imap => write!(f, "imap"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    /// Gmail search query, Graph `$filter` or IMAP SEARCH criteria
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl ProviderConfig {
    pub fn effective_query(&self) -> &str {
        self.query
            .as_deref()
            .unwrap_or_else(|| self.kind.default_query())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            query: None,
            max_messages: default_max_messages(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    #[serde(default = "default_gmail_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_gmail_token_cache_path")]
    pub token_cache_path: PathBuf,
    /// Delete permanently instead of moving to trash (needs the full mail scope)
    #[serde(default)]
    pub permanent_delete: bool,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_gmail_credentials_path(),
            token_cache_path: default_gmail_token_cache_path(),
            permanent_delete: false,
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlookConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_outlook_tenant")]
    pub tenant: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_outlook_token_cache_path")]
    pub token_cache_path: PathBuf,
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
    #[serde(default = "default_outlook_folder")]
    pub folder: String,
    #[serde(default = "default_outlook_page_size")]
    pub page_size: usize,
}

impl Default for OutlookConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            tenant: default_outlook_tenant(),
            redirect_uri: default_redirect_uri(),
            token_cache_path: default_outlook_token_cache_path(),
            base_url: default_graph_base_url(),
            folder: default_outlook_folder(),
            page_size: default_outlook_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_imap_mailbox")]
    pub mailbox: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_imap_port(),
            username: String::new(),
            mailbox: default_imap_mailbox(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningConfig {
    #[serde(default)]
    pub delete_newsletters: bool,
    #[serde(default = "default_delete_spam")]
    pub delete_spam: bool,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub except_senders: Vec<String>,
    /// Only messages matching this filter are considered for cleaning
    #[serde(default)]
    pub scope: Option<FilterSpec>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            delete_newsletters: false,
            delete_spam: default_delete_spam(),
            max_age_days: None,
            except_senders: Vec::new(),
            scope: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_newsletter_patterns")]
    pub newsletter_patterns: Vec<String>,
    #[serde(default = "default_spam_patterns")]
    pub spam_patterns: Vec<String>,
    #[serde(default = "default_unsubscribe_patterns")]
    pub unsubscribe_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            newsletter_patterns: default_newsletter_patterns(),
            spam_patterns: default_spam_patterns(),
            unsubscribe_patterns: default_unsubscribe_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    #[serde(default)]
    pub auto_unsubscribe: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UnsubscribeConfig {
    fn default() -> Self {
        Self {
            auto_unsubscribe: false,
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_job_id")]
    pub job_id: String,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            job_id: default_job_id(),
            interval_minutes: default_interval_minutes(),
        }
    }
}

/// Subscription of the local account, used to gate premium features
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub premium_level: u8,
    #[serde(default)]
    pub subscription_valid: bool,
    #[serde(default)]
    pub subscription_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub dry_run: bool,
    /// Write a JSON report of every cleaning run here
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

fn default_max_messages() -> usize {
    500
}

fn default_max_concurrent_fetches() -> usize {
    10
}

fn default_max_concurrent_requests() -> usize {
    40
}

fn default_gmail_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_gmail_token_cache_path() -> PathBuf {
    PathBuf::from("token.json")
}

fn default_outlook_tenant() -> String {
    "common".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080".to_string()
}

fn default_outlook_token_cache_path() -> PathBuf {
    PathBuf::from("outlook_token.json")
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_outlook_folder() -> String {
    "inbox".to_string()
}

fn default_outlook_page_size() -> usize {
    50
}

fn default_imap_port() -> u16 {
    993
}

fn default_imap_mailbox() -> String {
    "INBOX".to_string()
}

fn default_delete_spam() -> bool {
    true
}

fn default_newsletter_patterns() -> Vec<String> {
    DEFAULT_NEWSLETTER_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_spam_patterns() -> Vec<String> {
    DEFAULT_SPAM_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_unsubscribe_patterns() -> Vec<String> {
    DEFAULT_UNSUBSCRIBE_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("inbox-cleanup/{}", env!("CARGO_PKG_VERSION"))
}

fn default_job_id() -> String {
    "inbox-cleanup".to_string()
}

fn default_interval_minutes() -> u64 {
    60
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CleanupError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| CleanupError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CleanupError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| CleanupError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| CleanupError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.provider.max_messages == 0 {
            return Err(CleanupError::ConfigError(
                "provider.max_messages must be at least 1".to_string(),
            ));
        }
        if self.provider.max_concurrent_fetches == 0 || self.provider.max_concurrent_fetches > 50 {
            return Err(CleanupError::ConfigError(
                "provider.max_concurrent_fetches must be between 1 and 50".to_string(),
            ));
        }

        // Stay under Gmail's per-user quota of 250 units/sec
        if self.gmail.max_concurrent_requests == 0 || self.gmail.max_concurrent_requests > 50 {
            return Err(CleanupError::ConfigError(
                "gmail.max_concurrent_requests must be between 1 and 50".to_string(),
            ));
        }

        match self.provider.kind {
            ProviderKind::Gmail => {}
            ProviderKind::Outlook => {
                if self.outlook.client_id.trim().is_empty() {
                    return Err(CleanupError::ConfigError(
                        "outlook.client_id is required when provider.kind = \"outlook\"".to_string(),
                    ));
                }
                if self.outlook.page_size == 0 || self.outlook.page_size > 1000 {
                    return Err(CleanupError::ConfigError(
                        "outlook.page_size must be between 1 and 1000".to_string(),
                    ));
                }
            }
            ProviderKind::Imap => {
                if self.imap.host.trim().is_empty() {
                    return Err(CleanupError::ConfigError(
                        "imap.host is required when provider.kind = \"imap\"".to_string(),
                    ));
                }
                if self.imap.username.trim().is_empty() {
                    return Err(CleanupError::ConfigError(
                        "imap.username is required when provider.kind = \"imap\"".to_string(),
                    ));
                }
                if self.imap.port == 0 {
                    return Err(CleanupError::ConfigError(
                        "imap.port must be greater than 0".to_string(),
                    ));
                }
            }
        }

        if self.cleaning.max_age_days == Some(0) {
            return Err(CleanupError::ConfigError(
                "cleaning.max_age_days must be at least 1 (omit it to disable the age rule)"
                    .to_string(),
            ));
        }
        if self.cleaning.except_senders.iter().any(|s| s.trim().is_empty()) {
            return Err(CleanupError::ConfigError(
                "cleaning.except_senders cannot contain empty strings".to_string(),
            ));
        }

        // Compiles every pattern list and reports the first bad one
        Classifier::from_config(&self.classifier)?;

        if self.unsubscribe.request_timeout_secs == 0 {
            return Err(CleanupError::ConfigError(
                "unsubscribe.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.schedule.interval_minutes == 0 {
            return Err(CleanupError::ConfigError(
                "schedule.interval_minutes must be greater than 0".to_string(),
            ));
        }
        if self.schedule.job_id.trim().is_empty() {
            return Err(CleanupError::ConfigError(
                "schedule.job_id cannot be empty".to_string(),
            ));
        }

        PremiumLevel::try_from(self.account.premium_level).map_err(|_| {
            CleanupError::ConfigError(format!(
                "account.premium_level must be 0, 1 or 2 (got {})",
                self.account.premium_level
            ))
        })?;

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
