//! Storage backends the exporter reads pools, images and snapshot diffs
//! from.

mod memory;
mod rbd;

pub use memory::MemoryBackend;
pub use rbd::RbdBackend;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;

/// Default size of the buffers an export is read in.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("image not found: {pool}/{image}")]
    ImageNotFound { pool: String, image: String },

    #[error("snapshot not found: {pool}/{image}@{snapshot}")]
    SnapshotNotFound {
        pool: String,
        image: String,
        snapshot: String,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to parse output of `{command}`: {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {what} name {name:?}: {reason}")]
    InvalidName {
        what: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Raw export bytes, in the order the backend produced them.
pub type ExportStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Access to block images and their snapshots.
///
/// Implementations open whatever context they need per call; one backend is
/// shared by every stream task.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn list_images(&self, pool: &str) -> Result<Vec<String>, StorageError>;

    async fn list_snapshots(&self, pool: &str, image: &str) -> Result<Vec<String>, StorageError>;

    /// Export the diff up to `snapshot`, or the whole image when `None`.
    async fn export(
        &self,
        pool: &str,
        image: &str,
        snapshot: Option<&str>,
    ) -> Result<ExportStream, StorageError>;
}

/// Check a pool, image or snapshot name taken from a request before it is
/// handed to a backend. Names end up as command line arguments, so option
/// lookalikes and spec separators are refused.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), StorageError> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.starts_with('-') {
        "starts with '-'"
    } else if name.contains(['/', '@', '\0']) {
        "contains '/', '@' or NUL"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidName {
        what,
        name: name.to_string(),
        reason,
    })
}

/// `pool/image` or `pool/image@snapshot`.
pub fn image_spec(pool: &str, image: &str, snapshot: Option<&str>) -> String {
    match snapshot {
        Some(snapshot) => format!("{pool}/{image}@{snapshot}"),
        None => format!("{pool}/{image}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_spec() {
        assert_eq!(image_spec("nova", "vol-a", None), "nova/vol-a");
        assert_eq!(image_spec("nova", "vol-a", Some("snap1")), "nova/vol-a@snap1");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("pool", "nova").is_ok());
        assert!(validate_name("snapshot", "snap-2024.03.05_10:00").is_ok());
        for bad in ["", "-x", "--log-file=/tmp/x", "nova/vol-a", "vol@snap", "a\0b"] {
            assert!(
                matches!(validate_name("image", bad), Err(StorageError::InvalidName { .. })),
                "{bad:?} accepted"
            );
        }
    }
}
