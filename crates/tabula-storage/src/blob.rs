use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{sha256_hex, StoreError};

pub type BlobMetadata = BTreeMap<String, String>;

const CONTENT_HASH_KEY: &str = "content-sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub checksum_sha256: String,
    pub byte_size: usize,
    /// The key already held identical bytes; nothing was rewritten.
    pub deduplicated: bool,
}

/// Object storage addressed by deterministic `/`-separated keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<StoredBlob, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn metadata(&self, key: &str) -> Result<Option<BlobMetadata>, StoreError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<StoredBlob, StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let metadata = BlobMetadata::from([("content-type".to_string(), "application/json".to_string())]);
    store.put(key, &bytes, &metadata).await
}

pub async fn read_json<T: DeserializeOwned>(
    store: &dyn BlobStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Blob store on the local filesystem. Objects live under `objects/`, their
/// metadata as JSON under `meta/`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join("objects").join(key)
    }

    /// Deepest directory that can hold keys starting with `prefix`.
    fn list_root(&self, prefix: &str) -> Result<PathBuf, StoreError> {
        let objects = self.root.join("objects");
        match prefix.rsplit_once('/') {
            Some((dir, _)) => {
                validate_key(dir)?;
                Ok(objects.join(dir))
            }
            None => Ok(objects),
        }
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join("meta").join(format!("{key}.json"))
    }

    async fn read_meta(&self, key: &str) -> Result<Option<BlobMetadata>, StoreError> {
        let path = self.meta_path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path)(err)),
        }
    }

    /// Write via a temp file in the target directory and rename over the target.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        file.write_all(bytes).await.map_err(io_error(&temp_path))?;
        file.flush().await.map_err(io_error(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(path)(err));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<StoredBlob, StoreError> {
        validate_key(key)?;
        let checksum_sha256 = sha256_hex(bytes);
        let object_path = self.object_path(key);

        let unchanged = match self.read_meta(key).await? {
            Some(existing) => {
                existing.get(CONTENT_HASH_KEY) == Some(&checksum_sha256)
                    && fs::try_exists(&object_path)
                        .await
                        .map_err(io_error(&object_path))?
            }
            None => false,
        };

        if !unchanged {
            Self::write_atomic(&object_path, bytes).await?;
        }

        let mut stored_meta = metadata.clone();
        stored_meta.insert(CONTENT_HASH_KEY.to_string(), checksum_sha256.clone());
        Self::write_atomic(&self.meta_path(key), &serde_json::to_vec(&stored_meta)?).await?;

        Ok(StoredBlob {
            key: key.to_string(),
            checksum_sha256,
            byte_size: bytes.len(),
            deduplicated: unchanged,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        let path = self.object_path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path)(err)),
        }
    }

    async fn metadata(&self, key: &str) -> Result<Option<BlobMetadata>, StoreError> {
        validate_key(key)?;
        self.read_meta(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.root.join("objects");
        let mut keys = Vec::new();
        let mut pending = vec![self.list_root(prefix)?];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(&dir)(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_error(&path))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&objects) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        for path in [self.object_path(key), self.meta_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&path)(err)),
            }
        }
        Ok(())
    }
}

/// In-process blob store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, BlobMetadata)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, BlobMetadata)>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<StoredBlob, StoreError> {
        validate_key(key)?;
        let checksum_sha256 = sha256_hex(bytes);
        let mut objects = self.objects();
        let deduplicated = objects
            .get(key)
            .is_some_and(|(existing, _)| existing.as_slice() == bytes);
        objects.insert(key.to_string(), (bytes.to_vec(), metadata.clone()));
        Ok(StoredBlob {
            key: key.to_string(),
            checksum_sha256,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects().get(key).map(|(bytes, _)| bytes.clone()))
    }

    async fn metadata(&self, key: &str) -> Result<Option<BlobMetadata>, StoreError> {
        Ok(self.objects().get(key).map(|(_, meta)| meta.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects().remove(key);
        Ok(())
    }
}
