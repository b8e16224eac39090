use anyhow::Result;
use clap::Parser;
use inbox_cleanup::cli::{self, Cli, Commands, ProgressReporter};
use inbox_cleanup::config::Config;
use inbox_cleanup::error::CleanupError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Vec<u8>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Vec::new(),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let msg = String::from_utf8_lossy(&self.buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: inbox-cleanup --help");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: Arc<MultiProgress>) {
    let default_directive = if cli.verbose {
        "inbox_cleanup=debug,info"
    } else {
        "inbox_cleanup=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let make_writer = MultiProgressMakeWriter { multi };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pin one crypto provider per platform
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, Arc::clone(&multi_progress));
    let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());

    match cli.command {
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(CleanupError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nPlease edit this file to customize your settings.");
            println!("Key settings to review:");
            println!("  - provider.kind: 'gmail', 'outlook' or 'imap'");
            println!("  - cleaning.except_senders: addresses that are never deleted");
            println!("  - cleaning.max_age_days: delete anything older than this");
            println!("  - account.email / account.premium_level: unlocks premium features");
            Ok(())
        }

        Commands::Auth { force } => {
            let config = Config::load(&cli.config).await?;
            tracing::info!("Authenticating with {}...", config.provider.kind);
            cli::authenticate(&config, force).await?;
            Ok(())
        }

        Commands::Clean { dry_run, report } => {
            let config = Config::load(&cli.config).await?;
            let result = cli::run_clean(&config, dry_run, report, &reporter).await?;
            println!("\n{}", cli::format_clean_summary(&result));
            Ok(())
        }

        Commands::Unsubscribe { auto } => {
            let config = Config::load(&cli.config).await?;
            let result = cli::run_unsubscribe(&config, auto, &reporter).await?;
            println!("\n{}", cli::format_unsubscribe_summary(&result));
            Ok(())
        }

        Commands::Schedule { interval_minutes } => {
            let config = Config::load(&cli.config).await?;
            cli::run_schedule(&config, interval_minutes, &reporter).await?;
            Ok(())
        }
    }
}
