//! Key-path JSON document storage + the external classifier client.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod classifier;

pub use classifier::{
    BackoffPolicy, ClassifierConfig, ClassifyError, ClassifyItem, ClassifyOutcome, Classifier,
    HttpClassifier, RateLimit, RateLimiter, RetryDisposition,
};

pub const CRATE_NAME: &str = "opsdash-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid document key `{0}`")]
    InvalidKey(String),
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {key}: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub content_hash: String,
    /// The stored bytes already matched; nothing was rewritten.
    pub unchanged: bool,
}

/// Opaque key-value store of JSON documents with date-scoped string keys.
///
/// No multi-key transactions; callers serialise read-modify-write cycles
/// themselves.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;
    async fn put(&self, key: &str, value: &JsonValue) -> Result<PutOutcome, StoreError>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Serde {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn DocumentStore,
    key: &str,
    value: &T,
) -> Result<PutOutcome, StoreError> {
    let json = serde_json::to_value(value).map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &json).await
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Keys are relative `/`-separated paths without `.`/`..` segments.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn encode(key: &str, value: &JsonValue) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
    })
}

fn decode(key: &str, bytes: &[u8]) -> Result<JsonValue, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
    })
}

fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        key: key.to_string(),
        source,
    }
}

/// Filesystem-backed store: one pretty-printed JSON file per key under `root`.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str().map(ToString::to_string),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => decode(key, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(key)(err)),
        }
    }

    /// Atomic temp-file write + rename; identical content is left untouched.
    async fn put(&self, key: &str, value: &JsonValue) -> Result<PutOutcome, StoreError> {
        let path = self.path_for(key)?;
        let bytes = encode(key, value)?;
        let content_hash = sha256_hex(&bytes);

        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err(key))?;

        match fs::read(&path).await {
            Ok(existing) if sha256_hex(&existing) == content_hash => {
                return Ok(PutOutcome {
                    content_hash,
                    unchanged: true,
                });
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(key)(err)),
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(key))?;
        file.write_all(&bytes).await.map_err(io_err(key))?;
        file.flush().await.map_err(io_err(key))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(key)(err));
        }

        Ok(PutOutcome {
            content_hash,
            unchanged: false,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(prefix)(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_err(prefix))? {
                let file_type = entry.file_type().await.map_err(io_err(prefix))?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Some(key) = self.key_for(&entry.path()) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(key)(err)),
        }
    }
}

/// In-process store with the same encoding as [`FsDocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        validate_key(key)?;
        let docs = self.docs.lock().await;
        docs.get(key).map(|bytes| decode(key, bytes)).transpose()
    }

    async fn put(&self, key: &str, value: &JsonValue) -> Result<PutOutcome, StoreError> {
        validate_key(key)?;
        let bytes = encode(key, value)?;
        let content_hash = sha256_hex(&bytes);
        let mut docs = self.docs.lock().await;
        let unchanged = docs
            .get(key)
            .is_some_and(|existing| sha256_hex(existing) == content_hash);
        if !unchanged {
            docs.insert(key.to_string(), bytes);
        }
        Ok(PutOutcome {
            content_hash,
            unchanged,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let docs = self.docs.lock().await;
        Ok(docs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.docs.lock().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        assert!(validate_key("daily/2026-01-10.json").is_ok());
        assert!(validate_key("../secrets.json").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("daily//x.json").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_skips_identical_writes() {
        let dir = tempdir().expect("tempdir");
        let store = FsDocumentStore::new(dir.path());
        let doc = json!({"date": "2026-01-10", "total_records": 3});

        let first = store.put("daily/2026-01-10.json", &doc).await.expect("first put");
        let second = store.put("daily/2026-01-10.json", &doc).await.expect("second put");
        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);

        let loaded = store.get("daily/2026-01-10.json").await.expect("get");
        assert_eq!(loaded, Some(doc));
        assert_eq!(store.get("daily/2026-01-11.json").await.expect("missing"), None);
    }

    #[tokio::test]
    async fn fs_store_lists_by_prefix_and_deletes() {
        let dir = tempdir().expect("tempdir");
        let store = FsDocumentStore::new(dir.path());
        for key in ["daily/2026-01-11.json", "daily/2026-01-10.json", "oec/2026-01-10.json"] {
            store.put(key, &json!({"k": key})).await.expect("put");
        }

        let daily = store.list("daily/").await.expect("list");
        assert_eq!(daily, vec!["daily/2026-01-10.json", "daily/2026-01-11.json"]);
        assert_eq!(store.list("").await.expect("all").len(), 3);

        assert!(store.delete("daily/2026-01-10.json").await.expect("delete"));
        assert!(!store.delete("daily/2026-01-10.json").await.expect("delete again"));
        assert_eq!(store.list("daily/").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn memory_store_matches_fs_semantics() {
        let store = MemoryDocumentStore::new();
        let doc = json!({"a": 1});
        assert!(!store.put("config/dashboard.json", &doc).await.unwrap().unchanged);
        assert!(store.put("config/dashboard.json", &doc).await.unwrap().unchanged);
        assert_eq!(store.list("config/").await.unwrap(), vec!["config/dashboard.json"]);
        assert!(store.get("../x").await.is_err());
    }

    #[tokio::test]
    async fn typed_helpers_report_malformed_documents() {
        let store = MemoryDocumentStore::new();
        store.put("config/pnl.json", &json!({"not": "a list"})).await.unwrap();
        let typed = get_json::<Vec<String>>(&store, "config/pnl.json").await;
        assert!(matches!(typed, Err(StoreError::Serde { .. })));

        put_json(&store, "config/list.json", &vec!["a".to_string()]).await.unwrap();
        let back: Option<Vec<String>> = get_json(&store, "config/list.json").await.unwrap();
        assert_eq!(back, Some(vec!["a".to_string()]));
    }
}
