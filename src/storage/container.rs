//! Day container registry (spec §4.4, C4): `(date, kind) -> open files`,
//! opened lazily on first access and closed on purge or shutdown.
//!
//! The directory layout in spec §6 pairs every time-series kind with a
//! `.data` file, while §4.2's prose describes only text/profile as routing
//! writes through the data file (xlog/counter/alert/summary write the
//! payload inline in the index). Both files are opened for every kind to
//! match the layout; which write path is used is a property of the kind
//! (see `TimeSeriesContainer::write`). See DESIGN.md for the full writeup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::Result;
use crate::storage::hash_text::HashIndexFile;
use crate::storage::time_index::{IndexTimeFile, RealDataFile};
use crate::wire::TimeType;

/// Identifies a `(date, kind)` storage bundle. `kind` is a caller-built
/// relative path fragment, e.g. `"xlog"`, `"text/service"`,
/// `"summary/app"`, or `"counter/java_cpu_REALTIME"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerKey {
    pub date: String,
    pub kind: String,
}

impl ContainerKey {
    pub fn new(date: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            kind: kind.into(),
        }
    }
}

pub fn counter_kind(obj_type: &str, counter: &str, time_type: TimeType) -> String {
    match time_type {
        TimeType::Realtime => format!("counter/real_{obj_type}_{counter}"),
        TimeType::FiveMin => format!("counter/counter_{obj_type}_{counter}_5M"),
        TimeType::OneHour => format!("counter/counter_{obj_type}_{counter}_1H"),
    }
}

pub fn text_kind(xtype: &str) -> String {
    format!("text/{xtype}")
}

pub fn summary_kind(stype: &str) -> String {
    format!("summary/{stype}")
}

/// A `(index, data)` file pair. Kinds that write inline (spec §4.2) leave
/// `data` unused but present, matching the on-disk layout.
pub struct TimeSeriesContainer {
    pub index: IndexTimeFile,
    pub data: RealDataFile,
    uses_data_offset: bool,
}

impl TimeSeriesContainer {
    fn open(dir: &Path, base: &str, uses_data_offset: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let index = IndexTimeFile::open(dir.join(base))?;
        let data = RealDataFile::open(dir.join(format!("{base}.data")))?;
        Ok(Self {
            index,
            data,
            uses_data_offset,
        })
    }

    /// Write one record. Kinds that store inline (XLog/counter/alert/
    /// summary, per §4.2) write `payload` straight into the index. Kinds
    /// that route through the data file (text/profile) write `payload`
    /// into `.data` and store the 5-byte offset in the index.
    pub fn write(&mut self, time_ms: i64, payload: &[u8]) -> Result<u64> {
        if self.uses_data_offset {
            let offset = self.data.write(payload)?;
            self.index.write_offset(time_ms, offset)
        } else {
            self.index.write(time_ms, payload)
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.index.flush()?;
        self.data.flush()
    }

    /// Scan `[t_lo, t_hi]`, resolving through `.data` when this kind stores
    /// offsets, visiting the decoded payload either way.
    pub fn read_range<F>(&mut self, t_lo: i64, t_hi: i64, mut visit: F) -> Result<()>
    where
        F: FnMut(i64, &[u8]) -> bool,
    {
        if !self.uses_data_offset {
            return self.index.read_range(t_lo, t_hi, visit);
        }
        let mut resolved: Vec<(i64, u64)> = Vec::new();
        self.index.read_range(t_lo, t_hi, |time_ms, payload| {
            if let Some(offset) = IndexTimeFile::decode_offset(payload) {
                resolved.push((time_ms, offset));
            }
            true
        })?;
        for (time_ms, offset) in resolved {
            let blob = self.data.read(offset)?;
            if !visit(time_ms, &blob) {
                break;
            }
        }
        Ok(())
    }
}

pub enum Container {
    Series(TimeSeriesContainer),
    Text(HashIndexFile),
}

impl Container {
    pub fn flush(&mut self) -> Result<()> {
        match self {
            Container::Series(c) => c.flush(),
            Container::Text(c) => c.flush(),
        }
    }
}

/// Process-wide `(date, kind) -> container` map. A `(date, kind)` pair has
/// at most one open container at a time; lookups create on miss under the
/// map's own sharded locking (via `dashmap`), and access to a single
/// container is then serialized by its own mutex (spec invariant 4).
pub struct ContainerRegistry {
    data_dir: PathBuf,
    text_hash_size_mb: u64,
    containers: DashMap<ContainerKey, Arc<Mutex<Container>>>,
}

impl ContainerRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, text_hash_size_mb: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            text_hash_size_mb,
            containers: DashMap::new(),
        }
    }

    fn day_dir(&self, date: &str) -> PathBuf {
        self.data_dir.join(date)
    }

    /// Open (or return the already-open) time-series container for a kind
    /// that is not `text/*`. `uses_data_offset` selects the write variant;
    /// pass `true` only for profile storage.
    pub fn get_series(
        &self,
        date: &str,
        kind: &str,
        uses_data_offset: bool,
    ) -> Result<Arc<Mutex<Container>>> {
        let key = ContainerKey::new(date, kind);
        if let Some(existing) = self.containers.get(&key) {
            return Ok(existing.clone());
        }
        let dir = self.day_dir(date).join(kind_dir(kind));
        let base = kind_base(kind);
        let container = TimeSeriesContainer::open(&dir, &base, uses_data_offset)?;
        let arc = Arc::new(Mutex::new(Container::Series(container)));
        Ok(self.containers.entry(key).or_insert(arc).clone())
    }

    /// Open (or return) a `text/<div>` hash-indexed dictionary.
    pub fn get_text(&self, date: &str, xtype: &str) -> Result<Arc<Mutex<Container>>> {
        let kind = text_kind(xtype);
        let key = ContainerKey::new(date, kind.clone());
        if let Some(existing) = self.containers.get(&key) {
            return Ok(existing.clone());
        }
        let dir = self.day_dir(date).join("text");
        let store = HashIndexFile::open(&dir, xtype, self.text_hash_size_mb)?;
        let arc = Arc::new(Mutex::new(Container::Text(store)));
        Ok(self.containers.entry(key).or_insert(arc).clone())
    }

    /// Open (or return) the profile store, keyed by a folded `txid`.
    pub fn get_profile(&self, date: &str) -> Result<Arc<Mutex<Container>>> {
        let key = ContainerKey::new(date, "xlog_prof".to_string());
        if let Some(existing) = self.containers.get(&key) {
            return Ok(existing.clone());
        }
        let dir = self.day_dir(date).join("xlog");
        let store = HashIndexFile::open(&dir, "xlog_prof", self.text_hash_size_mb)?;
        let arc = Arc::new(Mutex::new(Container::Text(store)));
        Ok(self.containers.entry(key).or_insert(arc).clone())
    }

    /// Flush and drop every container whose date is not in `keep`. Disk
    /// removal of the underlying files is the purge scheduler's job
    /// (spec §4.10); this only closes in-memory handles (spec §4.4).
    pub fn purge_not_in(&self, keep: &HashSet<String>) {
        let stale: Vec<ContainerKey> = self
            .containers
            .iter()
            .filter(|entry| !keep.contains(&entry.key().date))
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            if let Some((_, container)) = self.containers.remove(&key) {
                if let Ok(mut guard) = container.lock() {
                    if let Err(e) = guard.flush() {
                        log::error!("flush on purge failed for {key:?}: {e}");
                    }
                }
            }
        }
    }

    pub fn flush_all(&self) {
        for entry in self.containers.iter() {
            if let Ok(mut guard) = entry.value().lock() {
                if let Err(e) = guard.flush() {
                    log::error!("flush failed for {:?}: {e}", entry.key());
                }
            }
        }
    }
}

/// `"xlog"` -> `"xlog"`, `"summary/app"` -> `"summary"`,
/// `"counter/real_java_cpu"` -> `"counter"`.
fn kind_dir(kind: &str) -> String {
    kind.split('/').next().unwrap_or(kind).to_string()
}

/// `"xlog"` -> `"xlog"`, `"summary/app"` -> `"summary_app"`,
/// `"counter/real_java_cpu"` -> `"real_java_cpu"`.
fn kind_base(kind: &str) -> String {
    match kind.split_once('/') {
        Some((top, rest)) if top == "summary" => format!("summary_{rest}"),
        Some((_, rest)) => rest.to_string(),
        None => kind.to_string(),
    }
}
