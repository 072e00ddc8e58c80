//! Command-line interface.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::Config;

/// Ship block-storage snapshot diffs over QUIC.
#[derive(Parser, Debug)]
#[command(name = "snapback", version, about)]
pub struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, env = "SNAPBACK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `snapback=debug`. `RUST_LOG` wins.
    #[arg(long, env = "SNAPBACK_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve pools, snapshots and exports from local storage.
    Exporter(ExporterArgs),
    /// Periodically pull snapshot diffs from an exporter.
    Importer(ImporterArgs),
}

#[derive(Args, Debug, Default)]
pub struct ExporterArgs {
    /// Address to listen on.
    #[arg(long, env = "SNAPBACK_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Path to the rbd tool.
    #[arg(long)]
    pub rbd_binary: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct ImporterArgs {
    /// Exporter address (`host:port`).
    #[arg(long, env = "SNAPBACK_CONNECT")]
    pub connect: Option<String>,

    /// Pool to import.
    #[arg(long)]
    pub pool: Option<String>,

    /// Seconds between import cycles.
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Directory exports are archived in.
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,

    /// SHA-256 fingerprint the exporter certificate must match.
    #[arg(long = "pin", value_name = "FINGERPRINT")]
    pub pinned_fingerprint: Option<String>,
}

impl Cli {
    /// Override `config` with everything given on the command line.
    pub fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }

        match &self.command {
            Command::Exporter(args) => {
                if let Some(listen) = args.listen {
                    config.exporter.listen = listen;
                }
                if let Some(binary) = &args.rbd_binary {
                    config.exporter.rbd_binary = binary.clone();
                }
            }
            Command::Importer(args) => {
                if let Some(connect) = &args.connect {
                    config.importer.connect = connect.clone();
                }
                if let Some(pool) = &args.pool {
                    config.importer.pool = pool.clone();
                }
                if let Some(interval) = args.interval {
                    config.importer.interval_secs = interval;
                }
                if let Some(dir) = &args.archive_dir {
                    config.importer.archive_dir = Some(dir.clone());
                }
                if let Some(pin) = &args.pinned_fingerprint {
                    config.importer.pinned_fingerprint = Some(pin.clone());
                }
            }
        }
    }
}
