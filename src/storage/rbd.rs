//! Backend driving the `rbd` command line tool.
//!
//! Every call spawns its own child process. Children are killed on drop so
//! an abandoned export never outlives its stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::io::ReaderStream;

use super::{image_spec, validate_name, ExportStream, StorageBackend, StorageError, DEFAULT_CHUNK_SIZE};

// rbd exits with the errno of the failed call; 2 is ENOENT.
const EXIT_NOT_FOUND: i32 = 2;

#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    name: String,
}

#[derive(Debug, Clone)]
pub struct RbdBackend {
    binary: PathBuf,
    extra_args: Vec<String>,
    chunk_size: usize,
}

impl RbdBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Arguments put in front of every subcommand, e.g. `--id backup`.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        parts.extend(self.extra_args.iter().cloned());
        parts.extend(args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }

    /// Run a listing command and return its stdout. Exit status 2 is mapped
    /// through `not_found`.
    async fn run(
        &self,
        args: &[&str],
        not_found: impl FnOnce() -> StorageError,
    ) -> Result<Vec<u8>, StorageError> {
        let command = self.describe(args);
        tracing::debug!(%command, "running rbd");

        let output = self.command(args).output().await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        if output.status.code() == Some(EXIT_NOT_FOUND) {
            return Err(not_found());
        }
        Err(StorageError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl Default for RbdBackend {
    fn default() -> Self {
        Self::new("rbd")
    }
}

fn parse_images(command: &str, stdout: &[u8]) -> Result<Vec<String>, StorageError> {
    // An empty pool prints nothing at all on some releases.
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(stdout).map_err(|source| StorageError::Parse {
        command: command.to_string(),
        source,
    })
}

fn parse_snapshots(command: &str, stdout: &[u8]) -> Result<Vec<String>, StorageError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let entries: Vec<SnapshotEntry> =
        serde_json::from_slice(stdout).map_err(|source| StorageError::Parse {
            command: command.to_string(),
            source,
        })?;
    Ok(entries.into_iter().map(|e| e.name).collect())
}

#[async_trait]
impl StorageBackend for RbdBackend {
    async fn list_images(&self, pool: &str) -> Result<Vec<String>, StorageError> {
        validate_name("pool", pool)?;
        let args = ["ls", "--format", "json", pool];
        let stdout = self
            .run(&args, || StorageError::PoolNotFound(pool.to_string()))
            .await?;
        parse_images(&self.describe(&args), &stdout)
    }

    async fn list_snapshots(&self, pool: &str, image: &str) -> Result<Vec<String>, StorageError> {
        validate_name("pool", pool)?;
        validate_name("image", image)?;
        let spec = image_spec(pool, image, None);
        let args = ["snap", "ls", "--format", "json", spec.as_str()];
        let stdout = self
            .run(&args, || StorageError::ImageNotFound {
                pool: pool.to_string(),
                image: image.to_string(),
            })
            .await?;
        parse_snapshots(&self.describe(&args), &stdout)
    }

    async fn export(
        &self,
        pool: &str,
        image: &str,
        snapshot: Option<&str>,
    ) -> Result<ExportStream, StorageError> {
        validate_name("pool", pool)?;
        validate_name("image", image)?;
        if let Some(snapshot) = snapshot {
            validate_name("snapshot", snapshot)?;
        }
        let spec = image_spec(pool, image, snapshot);
        let args = ["export-diff", spec.as_str(), "-"];
        let command = self.describe(&args);
        tracing::info!(%command, "starting export");

        let mut cmd = self.command(&args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("rbd export-diff stdout not captured"))
        })?;

        let data = ReaderStream::with_capacity(stdout, self.chunk_size).map_err(StorageError::from);

        // Yields nothing on a clean exit, one error otherwise.
        let exit = futures::stream::once(async move {
            let status = child.wait().await?;
            if status.success() {
                Ok(())
            } else {
                Err(StorageError::CommandFailed {
                    command,
                    status: status.to_string(),
                    stderr: String::new(),
                })
            }
        })
        .try_filter_map(|()| futures::future::ready(Ok(None::<Bytes>)));

        Ok(data.chain(exit).boxed())
    }
}
