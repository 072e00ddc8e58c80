//! Where pulled exports end up.
//!
//! The directory archive lays exports out as
//! `<root>/<pool>/<image>/<snapshot>.diff` (or `full.export` for a full
//! image) and only makes a file visible once the whole export arrived.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

const PARTIAL_SUFFIX: &str = ".partial";
const FULL_EXPORT_NAME: &str = "full.export";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid {what} name {name:?}: {reason}")]
    InvalidName {
        what: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("archive I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One export: a snapshot diff, or the full image when `snapshot` is None.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportTarget {
    pub pool: String,
    pub image: String,
    pub snapshot: Option<String>,
}

impl ExportTarget {
    pub fn new(pool: &str, image: &str, snapshot: Option<&str>) -> Self {
        Self {
            pool: pool.to_string(),
            image: image.to_string(),
            snapshot: snapshot.map(str::to_string),
        }
    }
}

impl fmt::Display for ExportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.snapshot {
            Some(snapshot) => write!(f, "{}/{}@{}", self.pool, self.image, snapshot),
            None => write!(f, "{}/{}", self.pool, self.image),
        }
    }
}

/// Destination for exports.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Start receiving `target`. Nothing is visible until the writer is
    /// committed.
    async fn begin(&self, target: &ExportTarget) -> Result<Box<dyn ArchiveWriter>, ArchiveError>;
}

#[async_trait]
pub trait ArchiveWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), ArchiveError>;

    /// Make the export visible. Returns the number of bytes written.
    async fn commit(self: Box<Self>) -> Result<u64, ArchiveError>;

    /// Throw away whatever was written.
    async fn abort(self: Box<Self>);
}

// =============================================================================
// Directory archive
// =============================================================================

/// Validate a name used as one path component under the archive root.
fn validate_component(what: &'static str, name: &str) -> Result<(), ArchiveError> {
    let invalid = |reason| ArchiveError::InvalidName {
        what,
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(invalid("contains a path separator or NUL"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid("not a plain file name")),
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of `target`, after validating every name in it.
    pub fn path_for(&self, target: &ExportTarget) -> Result<PathBuf, ArchiveError> {
        validate_component("pool", &target.pool)?;
        validate_component("image", &target.image)?;
        let file_name = match &target.snapshot {
            Some(snapshot) => {
                validate_component("snapshot", snapshot)?;
                format!("{snapshot}.diff")
            }
            None => FULL_EXPORT_NAME.to_string(),
        };
        Ok(self.root.join(&target.pool).join(&target.image).join(file_name))
    }
}

#[async_trait]
impl ArchiveSink for DirectoryArchive {
    async fn begin(&self, target: &ExportTarget) -> Result<Box<dyn ArchiveWriter>, ArchiveError> {
        let final_path = self.path_for(target)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }

        let mut partial = final_path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial_path = PathBuf::from(partial);

        let guard = PartialFileGuard::new(&partial_path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial_path)
            .await
            .map_err(io_error(&partial_path))?;

        Ok(Box::new(DirectoryWriter {
            file: BufWriter::new(file),
            partial_path,
            final_path,
            written: 0,
            guard,
        }))
    }
}

/// Removes a partial file on drop unless defused.
struct PartialFileGuard {
    path: Option<PathBuf>,
}

impl PartialFileGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    fn defuse(mut self) {
        self.path = None;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove partial export");
                }
            }
        }
    }
}

struct DirectoryWriter {
    file: BufWriter<File>,
    partial_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    guard: PartialFileGuard,
}

#[async_trait]
impl ArchiveWriter for DirectoryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ArchiveError> {
        self.file
            .write_all(data)
            .await
            .map_err(io_error(&self.partial_path))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64, ArchiveError> {
        let Self {
            mut file,
            partial_path,
            final_path,
            written,
            guard,
        } = *self;

        file.flush().await.map_err(io_error(&partial_path))?;
        file.get_ref()
            .sync_all()
            .await
            .map_err(io_error(&partial_path))?;
        drop(file);

        fs::rename(&partial_path, &final_path)
            .await
            .map_err(io_error(&final_path))?;
        guard.defuse();

        tracing::debug!(path = %final_path.display(), bytes = written, "export committed");
        Ok(written)
    }

    async fn abort(self: Box<Self>) {
        let Self {
            file,
            partial_path,
            guard,
            ..
        } = *self;
        drop(file);
        if let Err(e) = fs::remove_file(&partial_path).await {
            tracing::debug!(path = %partial_path.display(), error = %e, "failed to remove partial export");
        }
        guard.defuse();
    }
}

// =============================================================================
// Discard archive
// =============================================================================

/// Counts bytes and keeps nothing. Used when no archive directory is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardArchive;

struct DiscardWriter {
    written: u64,
}

#[async_trait]
impl ArchiveSink for DiscardArchive {
    async fn begin(&self, _target: &ExportTarget) -> Result<Box<dyn ArchiveWriter>, ArchiveError> {
        Ok(Box::new(DiscardWriter { written: 0 }))
    }
}

#[async_trait]
impl ArchiveWriter for DiscardWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ArchiveError> {
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64, ArchiveError> {
        Ok(self.written)
    }

    async fn abort(self: Box<Self>) {}
}
