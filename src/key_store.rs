/* gemrelay/src/key_store.rs

Upstream API key pool with a persisted round-robin cursor.

- One `KeyStore` per process, shared by every handler behind an `Arc`.
- All mutation (dispense, add, remove) happens under a single mutex, so two
  concurrent `next()` calls never hand out the same slot or race the cursor.
- Persistence goes through the `KeyStorage` trait. Storage failures are
  logged and swallowed: the in-memory pool stays authoritative.

Backends:
- file:<path>  JSON document `{ "apiKeys": [...], "currentKeyIndex": n }`
- memory       process-local, nothing survives a restart

Rotation is strict round-robin. There is no health tracking: a key that just
failed upstream is still handed out on its next turn.
*/

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::models::admin::{KeysResponse, RedactedKey};

const REDACTED_PREFIX_CHARS: usize = 10;

// ==============================
// Persisted document
// ==============================

/// On-disk shape of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedKeys {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub current_key_index: i64,
}

// ==============================
// Storage trait
// ==============================

pub trait KeyStorage: Send + Sync {
    fn load(&self) -> Result<Option<PersistedKeys>>;
    fn save(&self, keys: &PersistedKeys) -> Result<()>;
    fn describe(&self) -> String;
}

// ==============================
// JSON file backend
// ==============================

pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "api-keys.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl KeyStorage for JsonFileStorage {
    fn load(&self) -> Result<Option<PersistedKeys>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| ProxyError::Persistence(format!("read {}: {}", self.path.display(), e)))?;
        let keys = serde_json::from_str::<PersistedKeys>(&text)
            .map_err(|e| ProxyError::Persistence(format!("parse {}: {}", self.path.display(), e)))?;
        Ok(Some(keys))
    }

    fn save(&self, keys: &PersistedKeys) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ProxyError::Persistence(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }
        let body = serde_json::to_vec_pretty(keys)
            .map_err(|e| ProxyError::Persistence(format!("encode: {}", e)))?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, body)
            .map_err(|e| ProxyError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            ProxyError::Persistence(format!("rename into {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

// ==============================
// In-memory backend
// ==============================

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Option<PersistedKeys>>,
}

impl MemoryStorage {
    pub fn with_keys(keys: PersistedKeys) -> Self {
        Self {
            inner: Mutex::new(Some(keys)),
        }
    }
}

impl KeyStorage for MemoryStorage {
    fn load(&self) -> Result<Option<PersistedKeys>> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| ProxyError::Persistence(format!("lock: {}", e)))?;
        Ok(guard.clone())
    }

    fn save(&self, keys: &PersistedKeys) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| ProxyError::Persistence(format!("lock: {}", e)))?;
        *guard = Some(keys.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// Backends selectable at runtime via CLI/env
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBackend {
    File { path: PathBuf },
    Memory,
}

impl KeyBackend {
    /// Parse a backend spec string:
    /// - "file:<path>" → JSON file at path
    /// - "memory"      → in-memory only
    pub fn from_spec(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if let Some(rest) = spec.strip_prefix("file:") {
            let rest = rest.trim();
            if rest.is_empty() {
                return None;
            }
            return Some(KeyBackend::File {
                path: PathBuf::from(rest),
            });
        }
        if spec.eq_ignore_ascii_case("memory") {
            return Some(KeyBackend::Memory);
        }
        None
    }

    pub fn into_storage(self) -> Arc<dyn KeyStorage> {
        match self {
            KeyBackend::File { path } => Arc::new(JsonFileStorage::new(path)),
            KeyBackend::Memory => Arc::new(MemoryStorage::default()),
        }
    }
}

// ==============================
// Pool + manager
// ==============================

/// Keys in rotation order plus the index of the next key to dispense.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPool {
    pub keys: Vec<String>,
    pub cursor: usize,
}

impl KeyPool {
    /// Build from a persisted document, clamping an out-of-range cursor to 0.
    fn from_persisted(doc: PersistedKeys) -> Self {
        let len = doc.api_keys.len();
        let cursor = if doc.current_key_index < 0 || doc.current_key_index as u64 >= len as u64 {
            0
        } else {
            doc.current_key_index as usize
        };
        Self {
            keys: doc.api_keys,
            cursor,
        }
    }

    fn to_persisted(&self) -> PersistedKeys {
        PersistedKeys {
            api_keys: self.keys.clone(),
            current_key_index: self.cursor as i64,
        }
    }
}

pub struct KeyStore {
    storage: Arc<dyn KeyStorage>,
    pool: Mutex<KeyPool>,
}

impl KeyStore {
    /// Restore the pool from storage. Missing or unreadable storage yields an
    /// empty pool; this never fails.
    pub fn load(storage: Arc<dyn KeyStorage>) -> Self {
        let pool = match storage.load() {
            Ok(Some(doc)) => {
                let pool = KeyPool::from_persisted(doc);
                info!(
                    "Loaded {} key{} from {}",
                    pool.keys.len(),
                    if pool.keys.len() == 1 { "" } else { "s" },
                    storage.describe()
                );
                pool
            }
            Ok(None) => {
                info!(
                    "No key data at {}, starting with an empty pool",
                    storage.describe()
                );
                KeyPool::default()
            }
            Err(err) => {
                error!(
                    "Failed to load keys from {} (starting empty): {}",
                    storage.describe(),
                    err
                );
                KeyPool::default()
            }
        };
        Self {
            storage,
            pool: Mutex::new(pool),
        }
    }

    pub fn from_backend(backend: KeyBackend) -> Self {
        Self::load(backend.into_storage())
    }

    pub fn in_memory() -> Self {
        Self::from_backend(KeyBackend::Memory)
    }

    fn lock(&self) -> MutexGuard<'_, KeyPool> {
        // Mutations are single steps, so a poisoned pool is still consistent.
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best-effort write of the current pool. Called with the lock held so
    /// writes land in the same order as the mutations they record.
    fn persist(&self, pool: &KeyPool) {
        let start = Instant::now();
        match self.storage.save(&pool.to_persisted()) {
            Ok(()) => Self::log_store_latency("save", start.elapsed()),
            Err(err) => error!("Failed to persist key pool (continuing in memory): {}", err),
        }
    }

    /// Slow saves are surfaced: debug past 50ms, warn past 250ms.
    fn log_store_latency(operation: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        match ms {
            250.. => warn!(operation, duration_ms = ms, "Slow key storage write"),
            50..=249 => debug!(operation, duration_ms = ms, "Slow key storage write"),
            _ => {}
        }
    }

    /// Write the current pool without changing it.
    pub fn save(&self) {
        let pool = self.lock();
        self.persist(&pool);
    }

    /// Dispense the key at the cursor and advance the cursor by one.
    pub fn next(&self) -> Result<String> {
        let mut pool = self.lock();
        if pool.keys.is_empty() {
            return Err(ProxyError::NoKeysAvailable);
        }
        let index = pool.cursor;
        let key = pool.keys[index].clone();
        pool.cursor = (index + 1) % pool.keys.len();
        self.persist(&pool);
        debug!(key_index = index, key = %redact(&key), "Dispensed upstream key");
        Ok(key)
    }

    /// Append a key. Returns the new pool size.
    pub fn add(&self, key: &str) -> Result<usize> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ProxyError::InvalidKey("key is empty".to_string()));
        }
        let mut pool = self.lock();
        pool.keys.push(key.to_string());
        self.persist(&pool);
        info!(total = pool.keys.len(), key = %redact(key), "Added upstream key");
        Ok(pool.keys.len())
    }

    /// Remove the key at `index`. Returns the new pool size.
    ///
    /// Removing a slot before the cursor shifts the cursor with it, so the
    /// key that was due next is still due next.
    pub fn remove(&self, index: i64) -> Result<usize> {
        let mut pool = self.lock();
        let len = pool.keys.len();
        if index < 0 || index as u64 >= len as u64 {
            return Err(ProxyError::IndexOutOfRange { index, len });
        }
        let index = index as usize;
        pool.keys.remove(index);
        if index < pool.cursor {
            pool.cursor -= 1;
        }
        if pool.cursor >= pool.keys.len() {
            pool.cursor = 0;
        }
        self.persist(&pool);
        info!(total = pool.keys.len(), removed_index = index, "Removed upstream key");
        Ok(pool.keys.len())
    }

    /// Redacted view for the admin listing.
    pub fn list(&self) -> KeysResponse {
        let pool = self.lock();
        KeysResponse {
            keys: pool
                .keys
                .iter()
                .enumerate()
                .map(|(id, key)| RedactedKey {
                    id,
                    key: redact(key),
                })
                .collect(),
            total: pool.keys.len(),
            current_index: pool.cursor,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().keys.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    pub fn snapshot(&self) -> KeyPool {
        self.lock().clone()
    }
}

/// First ten characters followed by "...".
pub fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(REDACTED_PREFIX_CHARS).collect();
    format!("{}...", prefix)
}
