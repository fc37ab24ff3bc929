//! MTU fragment reassembly (spec §4.6, C6): datagrams too large for one MTU
//! arrive as `[magic | i32 obj_hash | i64 pkid | u16 total | u16 num |
//! blob]` fragments, reassembled by `pkid` into the original pack body.

use std::collections::{HashMap, VecDeque};

struct Entry {
    total: u16,
    received_count: u16,
    parts: Vec<Option<Vec<u8>>>,
    expiry_ms: i64,
}

/// Bounded, TTL-expiring table keyed by `pkid`. Bounded two ways: entries
/// past `ttl_ms` are dropped by `sweep_expired`, and insertion beyond
/// `max_entries` evicts the oldest entry outright so a flood of distinct,
/// never-completed `pkid`s can't grow memory unbounded between sweeps.
pub struct ReassemblyTable {
    entries: HashMap<i64, Entry>,
    insertion_order: VecDeque<i64>,
    max_entries: usize,
    ttl_ms: i64,
}

impl ReassemblyTable {
    pub fn new(max_entries: usize, ttl_ms: i64) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_entries,
            ttl_ms,
        }
    }

    /// Add one fragment. Returns the concatenated payload once every part
    /// `0..total` has arrived; duplicates of an already-received `num` are
    /// ignored (first-fragment-wins).
    pub fn add(&mut self, pkid: i64, total: u16, num: u16, blob: Vec<u8>, now_ms: i64) -> Option<Vec<u8>> {
        if !self.entries.contains_key(&pkid) {
            if self.entries.len() >= self.max_entries {
                if let Some(oldest) = self.insertion_order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            self.entries.insert(
                pkid,
                Entry {
                    total,
                    received_count: 0,
                    parts: vec![None; total as usize],
                    expiry_ms: now_ms + self.ttl_ms,
                },
            );
            self.insertion_order.push_back(pkid);
        }

        let entry = self.entries.get_mut(&pkid)?;
        let idx = num as usize;
        if idx >= entry.parts.len() || entry.parts[idx].is_some() {
            return None;
        }
        entry.parts[idx] = Some(blob);
        entry.received_count += 1;

        if entry.received_count == entry.total {
            let entry = self.entries.remove(&pkid).unwrap();
            let mut out = Vec::new();
            for part in entry.parts.into_iter().flatten() {
                out.extend_from_slice(&part);
            }
            Some(out)
        } else {
            None
        }
    }

    /// Drop entries whose TTL has elapsed. Returns the number dropped.
    pub fn sweep_expired(&mut self, now_ms: i64) -> usize {
        let stale: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expiry_ms < now_ms)
            .map(|(pkid, _)| *pkid)
            .collect();
        for pkid in &stale {
            self.entries.remove(pkid);
        }
        self.insertion_order.retain(|pkid| self.entries.contains_key(pkid));
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_fragments_reassemble_correctly() {
        let mut table = ReassemblyTable::new(16, 30_000);
        assert_eq!(table.add(1, 2, 1, b"world".to_vec(), 0), None);
        let complete = table.add(1, 2, 0, b"hello ".to_vec(), 0).unwrap();
        assert_eq!(complete, b"hello world".to_vec());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut table = ReassemblyTable::new(16, 30_000);
        table.add(1, 2, 0, b"a".to_vec(), 0);
        let result = table.add(1, 2, 0, b"b".to_vec(), 0);
        assert_eq!(result, None);
        let complete = table.add(1, 2, 1, b"c".to_vec(), 0).unwrap();
        assert_eq!(complete, b"ac".to_vec());
    }

    #[test]
    fn expired_entry_is_swept() {
        let mut table = ReassemblyTable::new(16, 1_000);
        table.add(1, 2, 0, b"a".to_vec(), 0);
        let dropped = table.sweep_expired(5_000);
        assert_eq!(dropped, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn eviction_on_cap_drops_oldest_incomplete_entry() {
        let mut table = ReassemblyTable::new(1, 30_000);
        table.add(1, 2, 0, b"a".to_vec(), 0);
        table.add(2, 2, 0, b"b".to_vec(), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.add(1, 2, 1, b"z".to_vec(), 0), None);
        assert_eq!(table.add(2, 2, 1, b"z".to_vec(), 0), Some(b"bz".to_vec()));
    }
}
