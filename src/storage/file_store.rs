use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::StorageError;
use super::traits::{CheckpointStore, VersionedBlob};

/// A [`CheckpointStore`] keeping one file per key in a directory
///
/// File layout is the decimal version on the first line followed by the raw
/// blob. Writes go to a `.tmp` file and are renamed into place. A store-wide
/// mutex serializes compare-and-set within this process.
pub struct FileCheckpointStore {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a checkpoint directory
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self, StorageError> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.state", sanitize(key)))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.state.tmp", sanitize(key)))
    }

    async fn read_blob(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError> {
        let raw = match tokio::fs::read(self.blob_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let split = raw.iter().position(|b| *b == b'\n').unwrap_or(raw.len());
        let version = std::str::from_utf8(&raw[..split])
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("corrupt version header in {key}"),
                )
            })?;
        let data = raw.get(split + 1..).map(<[u8]>::to_vec).unwrap_or_default();

        Ok(Some(VersionedBlob { version, data }))
    }

    async fn write_blob(&self, key: &str, version: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut contents = format!("{version}\n").into_bytes();
        contents.extend_from_slice(data);

        let tmp = self.tmp_path(key);
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, self.blob_path(key)).await?;

        debug!(key, version, bytes = data.len(), "state blob written");
        Ok(())
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError> {
        self.read_blob(key).await
    }

    async fn set(&self, key: &str, data: Vec<u8>) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let version = self.read_blob(key).await?.map_or(1, |b| b.version + 1);
        self.write_blob(key, version, &data).await?;
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        data: Vec<u8>,
    ) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_blob(key).await?.map(|b| b.version);
        if current != expected {
            return Ok(false);
        }
        self.write_blob(key, expected.map_or(1, |v| v + 1), &data).await?;
        Ok(true)
    }
}
