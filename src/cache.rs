//! Content-addressed storage of completed generations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::{CacheKey, Error};

/// Key-value store of completed response text.
///
/// `get` may fail with [`Error::CacheRead`] and `put` with
/// [`Error::CacheWrite`]; the gateway treats the former as a miss and logs
/// the latter.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, Error>;

    /// Store `text` under `key`. Repeated writes of the same content are idempotent.
    async fn put(&self, key: &CacheKey, text: &str) -> Result<(), Error>;
}

/// In-process cache, mainly for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().await.contains_key(key)
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, Error> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, text: &str) -> Result<(), Error> {
        self.entries
            .write()
            .await
            .insert(key.clone(), text.to_string());
        Ok(())
    }
}

/// On-disk entry format: `{"response": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    response: String,
}

/// One JSON file per entry, named `<key>.json`, under a cache directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// The directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait::async_trait]
impl CacheStore for FileCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, Error> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::cache_read(format!("{}: {e}", path.display())));
            }
        };

        let entry: CacheFile = serde_json::from_slice(&data)
            .map_err(|e| Error::cache_read(format!("{}: {e}", path.display())))?;
        Ok(Some(entry.response))
    }

    async fn put(&self, key: &CacheKey, text: &str) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::cache_write(format!("{}: {e}", self.dir.display())))?;

        let data = serde_json::to_vec(&CacheFile {
            response: text.to_string(),
        })?;

        // Readers must only ever see complete entries
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::cache_write(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::cache_write(format!("{}: {e}", path.display())))?;

        Ok(())
    }
}
