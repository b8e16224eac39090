//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::auth::{self, OAuthManager, GMAIL_MODIFY_SCOPE, OUTLOOK_SCOPES};
use crate::classifier::Classifier;
use crate::client::{GmailProvider, MailProvider};
use crate::config::{Config, ProviderKind};
use crate::entitlements::{EntitlementStore, Feature};
use crate::error::{CleanupError, Result};
use crate::imap::ImapProvider;
use crate::outlook::OutlookProvider;
use crate::pipeline::{authorize_feature, scheduled_clean, CleanReport, Pipeline, UnsubscribeRunReport};
use crate::scheduler::{JobEvent, Scheduler};
use crate::unsubscribe::HttpUnsubscribeClient;

#[derive(Parser, Debug)]
#[command(name = "inbox-cleanup")]
#[command(version)]
#[command(about = "Classify, filter and bulk-clean mailboxes", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with the configured provider
    Auth {
        /// Force re-authentication even if a token exists
        #[arg(long)]
        force: bool,
    },

    /// Fetch, classify and delete messages per the cleaning rules
    Clean {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Write a JSON report of every action to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List unsubscribe links found in messages
    Unsubscribe {
        /// Follow every link found (premium)
        #[arg(long)]
        auto: bool,
    },

    /// Run the clean command on a fixed interval until interrupted (premium)
    Schedule {
        /// Override schedule.interval_minutes
        #[arg(long)]
        interval_minutes: Option<u64>,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share the `MultiProgress` the log writer prints through
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect to the provider selected in `[provider]`
pub async fn connect_provider(config: &Config) -> Result<Arc<dyn MailProvider>> {
    let max_messages = config.provider.max_messages;
    match config.provider.kind {
        ProviderKind::Gmail => {
            let hub = auth::initialize_gmail_hub(&config.gmail).await?;
            Ok(Arc::new(GmailProvider::new(hub, &config.gmail, max_messages)))
        }
        ProviderKind::Outlook => {
            let oauth = outlook_oauth(config).await?;
            Ok(Arc::new(OutlookProvider::new(oauth, &config.outlook, max_messages)?))
        }
        ProviderKind::Imap => Ok(Arc::new(
            ImapProvider::connect_from_env(&config.imap, max_messages).await?,
        )),
    }
}

/// OAuth manager primed from the token file, persisting every refresh
async fn outlook_oauth(config: &Config) -> Result<Arc<OAuthManager>> {
    let path = config.outlook.token_cache_path.clone();
    let tokens = auth::load_token_file(&path).await?.ok_or_else(|| {
        CleanupError::AuthError(format!(
            "No Outlook token at {:?}; run `inbox-cleanup auth` first",
            path
        ))
    })?;

    let oauth = Arc::new(OAuthManager::for_outlook(&config.outlook));
    oauth.set_tokens(tokens).await;
    persist_token_updates(&oauth, path);
    Ok(oauth)
}

fn persist_token_updates(oauth: &OAuthManager, path: PathBuf) {
    let mut updates = oauth.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(tokens) => {
                    if let Err(e) = auth::save_token_file(&path, &tokens).await {
                        warn!("Failed to persist refreshed token: {}", e);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Run the interactive login for the configured provider
pub async fn authenticate(config: &Config, force: bool) -> Result<()> {
    match config.provider.kind {
        ProviderKind::Gmail => {
            let token_cache = &config.gmail.token_cache_path;
            if let Some(parent) = token_cache.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            if force && token_cache.exists() {
                tokio::fs::remove_file(token_cache).await?;
                info!("Removed existing token cache");
            }

            let hub = auth::initialize_gmail_hub(&config.gmail).await?;
            let (_, profile) = hub
                .users()
                .get_profile("me")
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;

            println!("Successfully authenticated with Gmail API");
            println!("Token cached at: {:?}", token_cache);
            println!("Connected to account: {}", profile.email_address.unwrap_or_default());
        }
        ProviderKind::Outlook => {
            if config.outlook.client_id.is_empty() {
                return Err(CleanupError::ConfigError(
                    "outlook.client_id must be set".to_string(),
                ));
            }
            let path = &config.outlook.token_cache_path;
            let oauth = OAuthManager::for_outlook(&config.outlook);

            let existing = if force { None } else { auth::load_token_file(path).await? };
            let tokens = match existing {
                Some(tokens) => {
                    oauth.set_tokens(tokens).await;
                    oauth.refresh_if_expired().await?
                }
                None => {
                    let state = uuid::Uuid::new_v4().to_string();
                    let url = oauth.authorization_url(OUTLOOK_SCOPES, &state)?;
                    println!("Open this URL in a browser and grant access:\n\n  {}\n", url);
                    println!("Paste the `code` parameter of the redirect URL:");
                    let code = read_line().await?;
                    oauth.exchange_code(code.trim()).await?
                }
            };

            auth::save_token_file(path, &tokens).await?;
            println!("Successfully authenticated with Microsoft Graph");
            println!("Token cached at: {:?}", path);
        }
        ProviderKind::Imap => {
            let provider = ImapProvider::connect_from_env(&config.imap, 1).await?;
            provider.logout().await?;
            println!(
                "Successfully logged in to {} as {}",
                config.imap.host, config.imap.username
            );
        }
    }
    Ok(())
}

async fn read_line() -> Result<String> {
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(line)
}

async fn build_pipeline(config: &Config, reporter: &ProgressReporter) -> Result<Pipeline> {
    let classifier = Arc::new(Classifier::from_config(&config.classifier)?);

    let auth_spinner = reporter.add_spinner(&format!("Connecting to {}...", config.provider.kind));
    let provider = connect_provider(config).await?;
    reporter.finish_spinner(&auth_spinner, &format!("Connected to {}", config.provider.kind));

    let progress = reporter.add_progress_bar(0, "Fetching messages");
    Ok(Pipeline::new(provider, classifier, config).with_progress(progress))
}

/// `clean`: one pass over the mailbox
pub async fn run_clean(
    config: &Config,
    dry_run: bool,
    report_path: Option<PathBuf>,
    reporter: &ProgressReporter,
) -> Result<CleanReport> {
    let dry_run = dry_run || config.execution.dry_run;
    if dry_run {
        let _ = reporter
            .multi_progress()
            .println("Running in DRY RUN mode - nothing will be deleted");
    }

    let pipeline = build_pipeline(config, reporter).await?;
    let report = pipeline.clean(dry_run, chrono::Utc::now()).await?;

    if let Some(path) = report_path.or_else(|| config.execution.report_path.clone()) {
        report.write_json(&path).await?;
    }
    Ok(report)
}

/// `unsubscribe`: list links, following them only for entitled accounts
pub async fn run_unsubscribe(
    config: &Config,
    auto: bool,
    reporter: &ProgressReporter,
) -> Result<UnsubscribeRunReport> {
    let auto = auto || config.unsubscribe.auto_unsubscribe;
    if auto {
        let store = EntitlementStore::in_memory();
        authorize_feature(&store, &config.account, Feature::AutoUnsubscribe).await?;
    }

    let transport = HttpUnsubscribeClient::from_config(&config.unsubscribe)?;
    let pipeline = build_pipeline(config, reporter).await?;
    pipeline.unsubscribe(auto, &transport, chrono::Utc::now()).await
}

/// `schedule`: re-run `clean` every interval until Ctrl-C
pub async fn run_schedule(
    config: &Config,
    interval_minutes: Option<u64>,
    reporter: &ProgressReporter,
) -> Result<()> {
    let store = EntitlementStore::in_memory();
    authorize_feature(&store, &config.account, Feature::ScheduledCleaning).await?;

    let minutes = interval_minutes.unwrap_or(config.schedule.interval_minutes);
    let interval = Duration::from_secs(minutes.saturating_mul(60));

    let classifier = Arc::new(Classifier::from_config(&config.classifier)?);
    let provider = connect_provider(config).await?;
    let _ = reporter
        .multi_progress()
        .println(format!("Connected to {}", config.provider.kind));
    let pipeline = Arc::new(Pipeline::new(provider, classifier, config));

    let scheduler = Scheduler::new();
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::Succeeded { job_id }) => info!(job_id = %job_id, "Scheduled run finished"),
                Ok(JobEvent::Failed { job_id, error }) => {
                    error!(job_id = %job_id, "Scheduled run failed: {}", error)
                }
                Ok(JobEvent::Removed { job_id }) => info!(job_id = %job_id, "Job removed"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let task = scheduled_clean(
        pipeline,
        config.execution.dry_run,
        config.execution.report_path.clone(),
    );
    scheduler.add_job(&config.schedule.job_id, interval, task)?;
    println!(
        "Scheduled '{}' every {} minute(s). Press Ctrl-C to stop.",
        config.schedule.job_id, minutes
    );

    tokio::signal::ctrl_c().await?;
    scheduler.stop_all();
    println!("Scheduler stopped");
    Ok(())
}

/// Human-readable summary of a cleaning run
pub fn format_clean_summary(report: &CleanReport) -> String {
    let mut out = String::new();
    out.push_str("========================================\n");
    out.push_str(if report.dry_run {
        "Clean Summary (dry run)\n"
    } else {
        "Clean Summary\n"
    });
    out.push_str("========================================\n");
    let mut line = |label: &str, value: usize| out.push_str(&format!("{:<22}{}\n", label, value));
    line("Messages listed:", report.listed);
    line("Messages in scope:", report.in_scope);
    line("Protected senders:", report.summary.protected);
    line("Deleted (too old):", report.summary.deleted_too_old);
    line("Deleted (newsletter):", report.summary.deleted_newsletter);
    line("Deleted (spam):", report.summary.deleted_spam);
    line("Kept:", report.summary.kept);
    line("Errors:", report.summary.errors);
    if !report.fetch_failures.is_empty() {
        line("Fetch failures:", report.fetch_failures.len());
    }
    out.push_str("========================================");
    out
}

/// Human-readable listing of an unsubscribe pass
pub fn format_unsubscribe_summary(report: &UnsubscribeRunReport) -> String {
    let mut out = String::new();
    for message in &report.messages {
        out.push_str(&format!(
            "{} | {}\n",
            message.sender,
            truncate_string(&message.subject, 60)
        ));
        match &message.report.results {
            Some(results) => {
                for result in results {
                    let status = match (result.http_status, &result.error_message) {
                        (Some(code), _) => code.to_string(),
                        (None, Some(err)) => format!("error: {}", err),
                        (None, None) => "error".to_string(),
                    };
                    out.push_str(&format!("    [{}] {}\n", status, result.url));
                }
            }
            None => {
                for link in &message.report.links {
                    out.push_str(&format!("    {}\n", link));
                }
            }
        }
    }
    out.push_str(&format!(
        "{} message(s), {} link(s)",
        report.messages.len(),
        report.link_count()
    ));
    if report.auto_unsubscribe {
        out.push_str(&format!(", {} unsubscribed", report.succeeded()));
    }
    out
}
