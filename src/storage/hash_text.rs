//! Hash-indexed text store (spec §4.3, C3): an on-disk open-addressing
//! `int32 key -> text` dictionary with a separate collision-chain file.
//!
//! Layout:
//! - `<div>.data`: append-only blobs, `[u16 len | bytes]`.
//! - `<div>.hfile`: fixed array of `B` buckets, each `[i32 key | i64
//!   data_offset | i64 next]` (20 bytes). `B = hash_size_mb * 1MiB /
//!   BUCKET_SIZE`.
//! - `<div>.kfile`: append-only collision-chain nodes, same 20-byte layout.
//!
//! A bucket is "empty" when `key == 0 && data_offset == 0` — this mirrors
//! the on-disk format being reimplemented and means a real key hashing to 0
//! whose blob happens to land at data offset 0 is indistinguishable from an
//! empty slot. That's a pre-existing wire/storage quirk, not introduced
//! here; see DESIGN.md.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};

const BUCKET_SIZE: u64 = 20;
const EMPTY_NEXT: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bucket {
    key: i32,
    data_offset: i64,
    next: i64,
}

impl Bucket {
    fn is_empty(&self) -> bool {
        self.key == 0 && self.data_offset == 0
    }

    fn encode(&self) -> [u8; BUCKET_SIZE as usize] {
        let mut buf = [0u8; BUCKET_SIZE as usize];
        buf[0..4].copy_from_slice(&self.key.to_be_bytes());
        buf[4..12].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[12..20].copy_from_slice(&self.next.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Bucket {
        Bucket {
            key: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            data_offset: i64::from_be_bytes(buf[4..12].try_into().unwrap()),
            next: i64::from_be_bytes(buf[12..20].try_into().unwrap()),
        }
    }
}

#[derive(Clone, Copy)]
enum ChainLoc {
    Bucket(u64),
    Node(u64),
}

pub struct HashIndexFile {
    data: File,
    hfile: File,
    kfile: File,
    bucket_count: u64,
}

impl HashIndexFile {
    pub fn open(dir: impl AsRef<Path>, div: &str, hash_size_mb: u64) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let bucket_count = (hash_size_mb * 1024 * 1024) / BUCKET_SIZE;
        let hfile_path = dir.join(format!("{div}.hfile"));
        let hfile = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&hfile_path)?;
        let target_len = bucket_count * BUCKET_SIZE;
        if hfile.metadata()?.len() < target_len {
            hfile.set_len(target_len)?;
        }
        let data = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(format!("{div}.data")))?;
        let kfile = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(format!("{div}.kfile")))?;
        Ok(Self {
            data,
            hfile,
            kfile,
            bucket_count,
        })
    }

    fn bucket_index(&self, key: i32) -> u64 {
        (key as u32 as u64) % self.bucket_count
    }

    fn read_bucket(&mut self, idx: u64) -> Result<Bucket> {
        let mut buf = [0u8; BUCKET_SIZE as usize];
        self.hfile.seek(SeekFrom::Start(idx * BUCKET_SIZE))?;
        self.hfile.read_exact(&mut buf)?;
        Ok(Bucket::decode(&buf))
    }

    fn write_bucket(&mut self, idx: u64, bucket: Bucket) -> Result<()> {
        self.hfile.seek(SeekFrom::Start(idx * BUCKET_SIZE))?;
        self.hfile.write_all(&bucket.encode())?;
        Ok(())
    }

    fn read_node(&mut self, offset: u64) -> Result<Bucket> {
        let mut buf = [0u8; BUCKET_SIZE as usize];
        self.kfile.seek(SeekFrom::Start(offset))?;
        self.kfile.read_exact(&mut buf)?;
        Ok(Bucket::decode(&buf))
    }

    fn append_node(&mut self, bucket: Bucket) -> Result<u64> {
        let offset = self.kfile.seek(SeekFrom::End(0))?;
        self.kfile.write_all(&bucket.encode())?;
        Ok(offset)
    }

    fn set_next(&mut self, loc: ChainLoc, next: i64) -> Result<()> {
        match loc {
            ChainLoc::Bucket(idx) => {
                let mut bucket = self.read_bucket(idx)?;
                bucket.next = next;
                self.write_bucket(idx, bucket)
            }
            ChainLoc::Node(offset) => {
                let mut node = self.read_node(offset)?;
                node.next = next;
                self.kfile.seek(SeekFrom::Start(offset))?;
                self.kfile.write_all(&node.encode())?;
                Ok(())
            }
        }
    }

    fn write_blob(&mut self, text: &[u8]) -> Result<i64> {
        if text.len() > u16::MAX as usize {
            return Err(ServerError::WireFormat(format!(
                "text store blob too large: {} bytes",
                text.len()
            )));
        }
        let offset = self.data.seek(SeekFrom::End(0))?;
        self.data.write_all(&(text.len() as u16).to_be_bytes())?;
        self.data.write_all(text)?;
        Ok(offset as i64)
    }

    fn read_blob(&mut self, offset: i64) -> Result<Vec<u8>> {
        self.data.seek(SeekFrom::Start(offset as u64))?;
        let mut len_buf = [0u8; 2];
        self.data
            .read_exact(&mut len_buf)
            .map_err(|_| ServerError::ShortRead {
                expected: 2,
                got: 0,
            })?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.data
            .read_exact(&mut buf)
            .map_err(|_| ServerError::ShortRead {
                expected: len,
                got: 0,
            })?;
        Ok(buf)
    }

    /// First-writer-wins: a key already present (bucket or chain) is a
    /// no-op, even if `text` differs (spec invariant 1 / §4.3).
    pub fn put(&mut self, key: i32, text: &[u8]) -> Result<()> {
        let idx = self.bucket_index(key);
        let bucket = self.read_bucket(idx)?;

        if bucket.is_empty() {
            let offset = self.write_blob(text)?;
            self.write_bucket(
                idx,
                Bucket {
                    key,
                    data_offset: offset,
                    next: EMPTY_NEXT,
                },
            )?;
            return Ok(());
        }
        if bucket.key == key {
            return Ok(());
        }

        let mut tail = ChainLoc::Bucket(idx);
        let mut next = bucket.next;
        while next != EMPTY_NEXT {
            let node = self.read_node(next as u64)?;
            if node.key == key {
                return Ok(());
            }
            tail = ChainLoc::Node(next as u64);
            next = node.next;
        }

        let offset = self.write_blob(text)?;
        let node_offset = self.append_node(Bucket {
            key,
            data_offset: offset,
            next: EMPTY_NEXT,
        })?;
        self.set_next(tail, node_offset as i64)
    }

    /// Insert a `(key, data_offset)` pair that already points at a blob in
    /// `.data`, without writing a new blob. Used by the rehash tool, which
    /// reorganizes the bucket array but leaves the data file untouched.
    fn insert_raw(&mut self, key: i32, data_offset: i64) -> Result<()> {
        let idx = self.bucket_index(key);
        let bucket = self.read_bucket(idx)?;
        if bucket.is_empty() {
            self.write_bucket(
                idx,
                Bucket {
                    key,
                    data_offset,
                    next: EMPTY_NEXT,
                },
            )?;
            return Ok(());
        }
        let mut tail = ChainLoc::Bucket(idx);
        let mut next = bucket.next;
        while next != EMPTY_NEXT {
            tail = ChainLoc::Node(next as u64);
            next = self.read_node(next as u64)?.next;
        }
        let node_offset = self.append_node(Bucket {
            key,
            data_offset,
            next: EMPTY_NEXT,
        })?;
        self.set_next(tail, node_offset as i64)
    }

    pub fn get(&mut self, key: i32) -> Result<Option<Vec<u8>>> {
        let idx = self.bucket_index(key);
        let bucket = self.read_bucket(idx)?;
        if bucket.is_empty() {
            return Ok(None);
        }
        if bucket.key == key {
            return Ok(Some(self.read_blob(bucket.data_offset)?));
        }
        let mut next = bucket.next;
        while next != EMPTY_NEXT {
            let node = self.read_node(next as u64)?;
            if node.key == key {
                return Ok(Some(self.read_blob(node.data_offset)?));
            }
            next = node.next;
        }
        Ok(None)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.data.sync_all()?;
        self.hfile.sync_all()?;
        self.kfile.sync_all()?;
        Ok(())
    }
}

/// Per-div statistics reported by the offline rehash tool.
#[derive(Debug, Clone)]
pub struct RehashStats {
    pub div: String,
    pub records: u64,
    pub old_chain_avg: f64,
    pub new_chain_avg: f64,
    pub elapsed_ms: u128,
}

/// Rebuild `<div>.hfile`/`.kfile` at a new `hash_size_mb`.
///
/// `<div>.data` stores blobs with no key, only `.hfile`/`.kfile` carry
/// `(key, data_offset)` pairs — so "scanning the data sequentially" (as a
/// literal byte-offset walk) can't recover keys to reinsert. Instead this
/// walks every bucket and collision-chain node of the *old* `.hfile`/
/// `.kfile` to enumerate `(key, data_offset)` pairs, then writes those same
/// pairs into a freshly sized bucket array. The data file itself is never
/// rewritten — only the two index files change size. Old index files are
/// preserved with a `.bak` suffix.
pub fn rehash_div(dir: impl AsRef<Path>, div: &str, new_hash_size_mb: u64) -> Result<RehashStats> {
    let dir = dir.as_ref();
    let started = std::time::Instant::now();

    let old_hash_size_mb = current_hash_size_mb(dir, div)?;
    let mut old = HashIndexFile::open(dir, div, old_hash_size_mb)?;
    let old_chain_avg = chain_avg(&mut old)?;
    let entries = collect_entries(&mut old)?;

    let hfile_path = dir.join(format!("{div}.hfile"));
    let kfile_path = dir.join(format!("{div}.kfile"));
    if hfile_path.exists() {
        std::fs::rename(&hfile_path, dir.join(format!("{div}.hfile.bak")))?;
    }
    if kfile_path.exists() {
        std::fs::rename(&kfile_path, dir.join(format!("{div}.kfile.bak")))?;
    }

    let mut rebuilt = HashIndexFile::open(dir, div, new_hash_size_mb)?;
    for (key, data_offset) in &entries {
        rebuilt.insert_raw(*key, *data_offset)?;
    }
    let new_chain_avg = chain_avg(&mut rebuilt)?;
    rebuilt.flush()?;

    Ok(RehashStats {
        div: div.to_string(),
        records: entries.len() as u64,
        old_chain_avg,
        new_chain_avg,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

/// Best-effort: the bucket count is implied by the existing `.hfile` size,
/// which lets `rehash_div` reopen the old store without the caller having
/// to remember its original `hash_size_mb`.
fn current_hash_size_mb(dir: &Path, div: &str) -> Result<u64> {
    let path = dir.join(format!("{div}.hfile"));
    let len = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(1),
    };
    let mb = (len / BUCKET_SIZE * BUCKET_SIZE) / (1024 * 1024);
    Ok(mb.max(1))
}

fn collect_entries(store: &mut HashIndexFile) -> Result<Vec<(i32, i64)>> {
    let mut entries = Vec::new();
    for idx in 0..store.bucket_count {
        let bucket = store.read_bucket(idx)?;
        if bucket.is_empty() {
            continue;
        }
        entries.push((bucket.key, bucket.data_offset));
        let mut next = bucket.next;
        while next != EMPTY_NEXT {
            let node = store.read_node(next as u64)?;
            entries.push((node.key, node.data_offset));
            next = node.next;
        }
    }
    Ok(entries)
}

fn chain_avg(store: &mut HashIndexFile) -> Result<f64> {
    let mut total_len = 0u64;
    let mut occupied = 0u64;
    for idx in 0..store.bucket_count {
        let bucket = store.read_bucket(idx)?;
        if bucket.is_empty() {
            continue;
        }
        occupied += 1;
        let mut len = 1u64;
        let mut next = bucket.next;
        while next != EMPTY_NEXT {
            len += 1;
            next = store.read_node(next as u64)?.next;
        }
        total_len += len;
    }
    Ok(if occupied == 0 {
        0.0
    } else {
        total_len as f64 / occupied as f64
    })
}

pub fn dir_path(data_dir: &Path, div: &str) -> PathBuf {
    data_dir.join(div)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let mut store = HashIndexFile::open(dir.path(), "service", 1).unwrap();
        store.put(42, b"checkout-service").unwrap();
        assert_eq!(store.get(42).unwrap(), Some(b"checkout-service".to_vec()));
    }

    #[test]
    fn first_writer_wins() {
        let dir = tempdir().unwrap();
        let mut store = HashIndexFile::open(dir.path(), "service", 1).unwrap();
        store.put(42, b"first").unwrap();
        store.put(42, b"second").unwrap();
        assert_eq!(store.get(42).unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn missing_key_is_absent() {
        let dir = tempdir().unwrap();
        let mut store = HashIndexFile::open(dir.path(), "service", 1).unwrap();
        assert_eq!(store.get(999).unwrap(), None);
    }

    #[test]
    fn collisions_chain_correctly() {
        let dir = tempdir().unwrap();
        // A tiny bucket count forces collisions quickly.
        let mut store = HashIndexFile::open(dir.path(), "service", 1).unwrap();
        let bucket_count = store.bucket_count;
        let k1 = 5i32;
        let k2 = (5u64 + bucket_count) as i32;
        let k3 = (5u64 + bucket_count * 2) as i32;
        store.put(k1, b"one").unwrap();
        store.put(k2, b"two").unwrap();
        store.put(k3, b"three").unwrap();
        assert_eq!(store.get(k1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get(k2).unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.get(k3).unwrap(), Some(b"three".to_vec()));
    }
}
