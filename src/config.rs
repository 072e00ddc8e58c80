//! Configuration file handling.
//!
//! Every key is optional; a missing file means all defaults. Values set on
//! the command line are applied on top (see `cli.rs`).
//!
//! ```toml
//! log_level = "info"
//!
//! [exporter]
//! listen = "0.0.0.0:4242"
//! rbd_args = ["--id", "backup"]
//!
//! [importer]
//! connect = "backup-source:4242"
//! pool = "nova"
//! interval_secs = 10
//! archive_dir = "~/snapback"
//!
//! [transport]
//! idle_timeout_secs = 60
//! ```

use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::importer::ImporterSettings;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::storage::DEFAULT_CHUNK_SIZE;
use crate::transport::tls::normalize_fingerprint;
use crate::transport::TransportSettings;

// Room for the envelope around a chunk's payload.
const ENVELOPE_OVERHEAD: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub exporter: ExporterConfig,
    pub importer: ImporterConfig,
    pub transport: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            exporter: ExporterConfig::default(),
            importer: ImporterConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterConfig {
    pub listen: SocketAddr,
    pub max_frame_size: usize,
    pub rbd_binary: PathBuf,
    /// Put in front of every rbd subcommand, e.g. `["--id", "backup"]`.
    pub rbd_args: Vec<String>,
    pub chunk_size: usize,
    /// Subject alternative names of the ephemeral certificate.
    pub certificate_names: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 4242)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            rbd_binary: PathBuf::from("rbd"),
            rbd_args: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            certificate_names: vec!["localhost".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImporterConfig {
    /// `host:port` of the exporter.
    pub connect: String,
    pub server_name: String,
    pub pool: String,
    pub interval_secs: u64,
    /// Exports are discarded when unset.
    pub archive_dir: Option<PathBuf>,
    pub export_full_when_no_snapshots: bool,
    /// SHA-256 of the exporter certificate, hex with optional colons.
    pub pinned_fingerprint: Option<String>,
    pub max_frame_size: usize,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            connect: "localhost:4242".to_string(),
            server_name: "localhost".to_string(),
            pool: "nova".to_string(),
            interval_secs: 10,
            archive_dir: None,
            export_full_when_no_snapshots: false,
            pinned_fingerprint: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ImporterConfig {
    pub fn settings(&self) -> ImporterSettings {
        ImporterSettings {
            pool: self.pool.clone(),
            interval: Duration::from_secs(self.interval_secs),
            export_full_when_no_snapshots: self.export_full_when_no_snapshots,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub idle_timeout_secs: u64,
    /// 0 disables keep-alive.
    pub keep_alive_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            keep_alive_secs: 15,
        }
    }
}

impl TransportConfig {
    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            keep_alive: (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs)),
        }
    }
}

impl Config {
    /// Load `path`, or the default location if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => expand_tilde(path),
            None => match default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.importer.pool.is_empty() {
            return invalid("importer.pool must not be empty".into());
        }
        if self.importer.interval_secs == 0 {
            return invalid("importer.interval_secs must be at least 1".into());
        }
        if self.exporter.chunk_size == 0 {
            return invalid("exporter.chunk_size must be at least 1".into());
        }
        // Stuffing can double a chunk in the worst case.
        let worst_case = self
            .exporter
            .chunk_size
            .checked_mul(2)
            .and_then(|size| size.checked_add(ENVELOPE_OVERHEAD));
        if worst_case.map_or(true, |size| size > self.exporter.max_frame_size) {
            return invalid(format!(
                "exporter.chunk_size {} does not fit exporter.max_frame_size {}",
                self.exporter.chunk_size, self.exporter.max_frame_size
            ));
        }
        if self.importer.max_frame_size < ENVELOPE_OVERHEAD {
            return invalid("importer.max_frame_size is too small".into());
        }
        if self.exporter.certificate_names.is_empty() {
            return invalid("exporter.certificate_names must not be empty".into());
        }
        if self.transport.idle_timeout_secs == 0 {
            return invalid("transport.idle_timeout_secs must be at least 1".into());
        }
        if self.transport.keep_alive_secs >= self.transport.idle_timeout_secs {
            return invalid("transport.keep_alive_secs must be below idle_timeout_secs".into());
        }
        if let Some(pin) = &self.importer.pinned_fingerprint {
            let pin = normalize_fingerprint(pin);
            if pin.len() != 64 || !pin.chars().all(|c| c.is_ascii_hexdigit()) {
                return invalid("importer.pinned_fingerprint must be a SHA-256 hex digest".into());
            }
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/snapback/config.toml` or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("snapback").join("config.toml"))
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}
