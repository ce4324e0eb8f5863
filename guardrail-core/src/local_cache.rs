//! Local durable cache for reload survival
//!
//! The breadcrumb tracker and the debugger keep a small, wholesale-overwritten
//! copy of their latest entries here so a restarted process can recover the
//! trail leading up to a crash. Every write is best-effort: callers log and
//! drop failures.

use crate::error::{GuardrailError, GuardrailResult};
use parking_lot::Mutex;
use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const BREADCRUMBS_KEY: &str = "breadcrumbs";
pub const SNAPSHOTS_KEY: &str = "snapshots";

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("guardrail_cache");

/// Key/value storage that survives a process restart
pub trait LocalCache: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> GuardrailResult<()>;

    fn load(&self, key: &str) -> GuardrailResult<Option<Vec<u8>>>;

    fn remove(&self, key: &str) -> GuardrailResult<()>;
}

/// Serialize `value` as JSON and overwrite `key`, logging instead of failing.
pub fn save_json_best_effort<T: Serialize + ?Sized>(cache: &dyn LocalCache, key: &str, value: &T) {
    let result = serde_json::to_vec(value)
        .map_err(GuardrailError::from)
        .and_then(|bytes| cache.save(key, &bytes));
    if let Err(e) = result {
        warn!(key, error = %e, "Failed to persist local cache entry");
    }
}

/// Load and decode `key`, treating any failure as an empty cache.
pub fn load_json_best_effort<T: DeserializeOwned>(cache: &dyn LocalCache, key: &str) -> Option<T> {
    match cache.load(key) {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable local cache entry");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(key, error = %e, "Failed to read local cache entry");
            None
        }
    }
}

/// redb-backed cache stored in a single file
pub struct RedbCache {
    database: Database,
}

impl RedbCache {
    pub fn open(path: impl AsRef<Path>) -> GuardrailResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let database = Database::create(path)?;

        // Make sure the table exists so that reads never hit TableDoesNotExist
        let txn = database.begin_write()?;
        {
            let _table = txn.open_table(CACHE_TABLE)?;
        }
        txn.commit()?;

        debug!("Opened local cache at {}", path.display());
        Ok(Self { database })
    }
}

impl LocalCache for RedbCache {
    fn save(&self, key: &str, value: &[u8]) -> GuardrailResult<()> {
        let txn = self.database.begin_write()?;
        {
            let mut table = txn.open_table(CACHE_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn load(&self, key: &str) -> GuardrailResult<Option<Vec<u8>>> {
        let txn = self.database.begin_read()?;
        let table = txn.open_table(CACHE_TABLE)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn remove(&self, key: &str) -> GuardrailResult<()> {
        let txn = self.database.begin_write()?;
        {
            let mut table = txn.open_table(CACHE_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// In-process cache used when no cache path is configured
#[derive(Default, Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn save(&self, key: &str, value: &[u8]) -> GuardrailResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> GuardrailResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> GuardrailResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
