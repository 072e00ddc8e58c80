//! In-memory backend for tests and embedding.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;

use super::{ExportStream, StorageBackend, StorageError, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone, Default)]
struct Image {
    data: Bytes,
    // Insertion order is the snapshot order.
    snapshots: Vec<(String, Bytes)>,
}

/// Immutable set of pools, images and snapshot diffs.
///
/// ```
/// use snapback::storage::MemoryBackend;
///
/// let storage = MemoryBackend::new()
///     .with_image("nova", "vol-a", b"head".to_vec())
///     .with_snapshot("nova", "vol-a", "snap1", b"diff".to_vec());
/// # let _ = storage;
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    pools: BTreeMap<String, BTreeMap<String, Image>>,
    chunk_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            pools: BTreeMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pools.entry(pool.to_string()).or_default();
        self
    }

    /// Add an image; `data` is what a full-image export returns.
    pub fn with_image(mut self, pool: &str, image: &str, data: impl Into<Bytes>) -> Self {
        let images = self.pools.entry(pool.to_string()).or_default();
        images.entry(image.to_string()).or_default().data = data.into();
        self
    }

    /// Add a snapshot whose diff export returns `diff`. Creates the image if
    /// needed.
    pub fn with_snapshot(
        mut self,
        pool: &str,
        image: &str,
        snapshot: &str,
        diff: impl Into<Bytes>,
    ) -> Self {
        let images = self.pools.entry(pool.to_string()).or_default();
        let entry = images.entry(image.to_string()).or_default();
        entry.snapshots.push((snapshot.to_string(), diff.into()));
        self
    }

    /// Size of the buffers exports are split into.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn image(&self, pool: &str, image: &str) -> Result<&Image, StorageError> {
        self.pools
            .get(pool)
            .ok_or_else(|| StorageError::PoolNotFound(pool.to_string()))?
            .get(image)
            .ok_or_else(|| StorageError::ImageNotFound {
                pool: pool.to_string(),
                image: image.to_string(),
            })
    }
}

fn split(data: Bytes, chunk_size: usize) -> Vec<Result<Bytes, StorageError>> {
    let mut buffers = Vec::with_capacity(data.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        buffers.push(Ok(data.slice(offset..end)));
        offset = end;
    }
    buffers
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_images(&self, pool: &str) -> Result<Vec<String>, StorageError> {
        let images = self
            .pools
            .get(pool)
            .ok_or_else(|| StorageError::PoolNotFound(pool.to_string()))?;
        Ok(images.keys().cloned().collect())
    }

    async fn list_snapshots(&self, pool: &str, image: &str) -> Result<Vec<String>, StorageError> {
        let image = self.image(pool, image)?;
        Ok(image.snapshots.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn export(
        &self,
        pool: &str,
        image: &str,
        snapshot: Option<&str>,
    ) -> Result<ExportStream, StorageError> {
        let entry = self.image(pool, image)?;
        let data = match snapshot {
            None => entry.data.clone(),
            Some(snapshot) => entry
                .snapshots
                .iter()
                .find(|(name, _)| name == snapshot)
                .map(|(_, diff)| diff.clone())
                .ok_or_else(|| StorageError::SnapshotNotFound {
                    pool: pool.to_string(),
                    image: image.to_string(),
                    snapshot: snapshot.to_string(),
                })?,
        };
        Ok(futures::stream::iter(split(data, self.chunk_size)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn backend() -> MemoryBackend {
        MemoryBackend::new()
            .with_pool("empty")
            .with_image("nova", "vol-b", b"full image".to_vec())
            .with_snapshot("nova", "vol-a", "snap2", b"second".to_vec())
            .with_snapshot("nova", "vol-a", "snap1", b"first".to_vec())
            .with_chunk_size(4)
    }

    #[tokio::test]
    async fn test_listing() {
        let storage = backend();
        assert_eq!(storage.list_images("nova").await.unwrap(), vec!["vol-a", "vol-b"]);
        assert!(storage.list_images("empty").await.unwrap().is_empty());
        assert_eq!(
            storage.list_snapshots("nova", "vol-a").await.unwrap(),
            vec!["snap2", "snap1"]
        );
        assert!(matches!(
            storage.list_images("glance").await,
            Err(StorageError::PoolNotFound(_))
        ));
        assert!(matches!(
            storage.list_snapshots("nova", "vol-z").await,
            Err(StorageError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_export_chunks() {
        let storage = backend();
        let buffers: Vec<Bytes> = storage
            .export("nova", "vol-b", None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers.concat(), b"full image");

        let diff: Vec<Bytes> = storage
            .export("nova", "vol-a", Some("snap1"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(diff.concat(), b"first");

        assert!(matches!(
            storage.export("nova", "vol-a", Some("snap9")).await,
            Err(StorageError::SnapshotNotFound { .. })
        ));
    }
}
