//! Process-wide key-value store backing `kv/global.json` and `kv/custom.json`
//! (spec §6 directory layout; not otherwise specified). `global` holds
//! server-assigned identifiers, `custom` holds dashboard-settable scalars.
//! Both are loaded once at startup and flushed on shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;

use crate::error::Result;

pub struct KvStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Value>>,
}

impl KvStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.write().unwrap().insert(key.into(), value);
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = self.entries.read().unwrap();
        let json = serde_json::to_string_pretty(&*snapshot)
            .map_err(|e| crate::error::ServerError::WireFormat(format!("kv serialize failed: {e}")))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

pub struct KvStores {
    pub global: KvStore,
    pub custom: KvStore,
}

impl KvStores {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("kv");
        Ok(Self {
            global: KvStore::open(dir.join("global.json"))?,
            custom: KvStore::open(dir.join("custom.json"))?,
        })
    }

    pub fn flush_all(&self) {
        if let Err(e) = self.global.flush() {
            log::error!("flush of kv/global.json failed: {e}");
        }
        if let Err(e) = self.custom.flush() {
            log::error!("flush of kv/custom.json failed: {e}");
        }
    }
}
