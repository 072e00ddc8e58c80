use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use snapback::cli::{Cli, Command};
use snapback::config::Config;
use snapback::{exporter, importer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.log_level)?;

    let cancel = CancellationToken::new();
    spawn_signal_handlers(cancel.clone());

    match cli.command {
        Command::Exporter(_) => {
            tracing::info!(listen = %config.exporter.listen, "starting exporter");
            exporter::run(&config.exporter, &config.transport, cancel).await
        }
        Command::Importer(_) => {
            tracing::info!(connect = %config.importer.connect, "starting importer");
            importer::run(&config.importer, &config.transport, cancel).await
        }
    }
}

/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {level}"))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn spawn_signal_handlers(cancel: CancellationToken) {
    let cancel_for_int = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, shutting down");
            cancel_for_int.cancel();
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sig) = signal(SignalKind::terminate()) {
            sig.recv().await;
            tracing::info!("SIGTERM received, shutting down");
            cancel.cancel();
        }
    });
}
