//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lazymirror_service::config::Config;
use lazymirror_service::{metrics, mirror};

use crate::logging;
use crate::server;

const LONG_VERSION: &str = concat!(
    "version: ",
    env!("CARGO_PKG_VERSION"),
    "\ngit commit: ",
    env!("LAZYMIRROR_GIT_VERSION")
);

/// lazymirror commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Remove staging files left behind by interrupted downloads.
    CleanStaging,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "lazymirror", version, long_version = LONG_VERSION)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("LAZYMIRROR_RELEASE").into()),
        session_mode: sentry::SessionMode::Request,
        auto_session_tracking: false,
        ..Default::default()
    });

    // SAFETY: No runtime has been started yet, the process is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        if let Some(tag) = config.metrics.environment_tag.clone() {
            if let Some(name) = sentry.options().environment.as_ref() {
                tags.insert(tag, name.to_string());
            }
        }

        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to set up statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::CleanStaging => clean_staging(&config)?,
    }

    Ok(())
}

fn clean_staging(config: &Config) -> Result<()> {
    let root = &config.mirror_root;
    let removed = mirror::clean_staging(root)
        .with_context(|| format!("failed to clean up {}", root.display()))?;

    tracing::info!("Removed {removed} staging files from {}", root.display());
    Ok(())
}
