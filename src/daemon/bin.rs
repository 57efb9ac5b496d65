//! Torrent Mirror Daemon Binary
//!
//! Builds a service graph for every configured user and streams their
//! events to stdout as JSON lines until interrupted.
//!
//! # Usage
//!
//! ```bash
//! torrent-mirror-daemon --config ~/.config/torrent-mirror/config.toml
//! torrent-mirror-daemon --user alice --log-level debug
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use torrent_mirror::{EventSink, MirrorConfig, MirrorError, ServiceRegistry};

/// Torrent Mirror Daemon
#[derive(Parser, Debug)]
#[command(name = "torrent-mirror-daemon")]
#[command(about = "Mirror torrent daemons into per-user event streams")]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "TORRENT_MIRROR_CONFIG")]
    config: Option<PathBuf>,

    /// Only start these users (repeatable)
    #[arg(short, long = "user")]
    users: Vec<String>,

    /// Log level for the mirror crates
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("torrent_mirror={}", args.log_level).parse()?)
                .add_directive(format!("torrent_mirror_daemon={}", args.log_level).parse()?),
        )
        .init();

    match run(args).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => match e.downcast_ref::<MirrorError>() {
            Some(error) => {
                tracing::error!("{:#}", e);
                Ok(error.exit_code())
            }
            None => Err(e),
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let path = match args.config {
        Some(path) => path,
        None => MirrorConfig::default_path().context("no config directory on this platform")?,
    };
    let config = MirrorConfig::load_from(&path)?;

    let users: Vec<String> = if args.users.is_empty() {
        config.users.iter().map(|u| u.id.clone()).collect()
    } else {
        args.users
    };
    if users.is_empty() {
        return Err(MirrorError::ConfigError {
            message: format!("no users configured in {}", path.display()),
        }
        .into());
    }

    let registry = Arc::new(ServiceRegistry::from_config(config));
    let sink = Arc::new(EventSink::stdout());

    for user in &users {
        let mut rx = registry
            .subscribe(user)
            .with_context(|| format!("starting services for {}", user))?;
        let sink = Arc::clone(&sink);
        let task_user = user.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.emit(&task_user, &event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("[{}] Event sink lagged, {} events dropped", task_user, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        tracing::info!("Mirroring {}", user);
    }

    tracing::info!("Torrent mirror running for {} user(s)", users.len());
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    registry.destroy_all();
    Ok(())
}
