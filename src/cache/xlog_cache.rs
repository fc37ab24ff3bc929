//! Bounded recent-window ring for completed transactions (spec §4.5, C5).
//!
//! `loop` increments each time the ring wraps and starts overwriting old
//! entries; `index` is a monotonically increasing sequence number assigned
//! to every `put`, starting at 1 (0 is reserved for "nothing consumed yet",
//! so the zero-value default cursor `(0, 0)` is never confused with having
//! already consumed the first entry). A `(loop, index)` cursor lets a
//! dashboard poll incrementally: `since` returns everything newer than the
//! cursor, up to a limit, plus the cursor to resume from. If the cursor's
//! `loop` has fallen behind (the cache wrapped since the client last
//! polled, or the client never polled at all), `since` falls back to the
//! currently resident window.

#[derive(Debug, Clone)]
pub struct XLogEntry {
    pub obj_hash: i32,
    pub elapsed: i32,
    pub error_flag: bool,
    pub bytes: Vec<u8>,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub loop_count: u64,
    pub index: u64,
}

struct Slot {
    entry: XLogEntry,
}

pub struct XLogCache {
    capacity: usize,
    buffer: Vec<Option<Slot>>,
    next_index: u64,
    loop_count: u64,
}

impl XLogCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "XLogCache capacity must be positive");
        Self {
            capacity,
            buffer: (0..capacity).map(|_| None).collect(),
            next_index: 1,
            loop_count: 0,
        }
    }

    pub fn put(&mut self, obj_hash: i32, elapsed: i32, error_flag: bool, bytes: Vec<u8>) -> u64 {
        let index = self.next_index;
        let slot_idx = ((index - 1) as usize) % self.capacity;
        self.buffer[slot_idx] = Some(Slot {
            entry: XLogEntry {
                obj_hash,
                elapsed,
                error_flag,
                bytes,
                index,
            },
        });
        self.next_index += 1;
        if index % self.capacity as u64 == 0 {
            self.loop_count += 1;
        }
        index
    }

    pub fn current_cursor(&self) -> Cursor {
        Cursor {
            loop_count: self.loop_count,
            index: self.next_index.saturating_sub(1),
        }
    }

    /// Entries newer than `cursor`, oldest-first, capped at `limit`, plus
    /// the cursor to resume from.
    pub fn since(&self, cursor: Cursor, limit: usize) -> (Vec<XLogEntry>, Cursor) {
        if cursor.loop_count > self.loop_count {
            return (Vec::new(), cursor);
        }

        let start = if cursor.loop_count == self.loop_count {
            cursor.index + 1
        } else {
            // Stale cursor: caller missed a full wrap (or never polled at
            // all). There's no way to tell which indices are gone, so
            // serve whatever is currently resident; the window clamp below
            // does the rest.
            1
        };

        let oldest_resident = self.next_index.saturating_sub(self.capacity as u64).max(1);
        let mut out = Vec::new();
        let mut idx = start.max(oldest_resident);
        let mut last_emitted = cursor.index;
        while idx < self.next_index && out.len() < limit {
            let slot_idx = ((idx - 1) as usize) % self.capacity;
            if let Some(slot) = &self.buffer[slot_idx] {
                if slot.entry.index == idx {
                    out.push(slot.entry.clone());
                    last_emitted = idx;
                }
            }
            idx += 1;
        }

        let new_cursor = if out.is_empty() {
            Cursor {
                loop_count: self.loop_count,
                index: cursor.index,
            }
        } else {
            Cursor {
                loop_count: self.loop_count,
                index: last_emitted,
            }
        };
        (out, new_cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_zero_returns_most_recent_min_capacity_limit() {
        let mut cache = XLogCache::new(4);
        for i in 0..10 {
            cache.put(1, i, false, vec![i as u8]);
        }
        let (entries, cursor) = cache.since(Cursor::default(), 100);
        // Only the last 4 puts (indices 7..=10) are still resident.
        assert_eq!(entries.len(), 4);
        assert_eq!(entries.first().unwrap().index, 7);
        assert_eq!(entries.last().unwrap().index, 10);
        assert!(cursor.loop_count >= 1);
    }

    #[test]
    fn repeating_query_with_returned_cursor_yields_nothing_new() {
        let mut cache = XLogCache::new(100);
        cache.put(1, 100, false, b"x".to_vec());
        let (first, cursor) = cache.since(Cursor::default(), 10);
        assert_eq!(first.len(), 1);
        let (second, _) = cache.since(cursor, 10);
        assert!(second.is_empty());
    }

    #[test]
    fn limit_is_respected_and_cursor_advances_incrementally() {
        let mut cache = XLogCache::new(100);
        for i in 0..5 {
            cache.put(1, i, false, vec![i as u8]);
        }
        let (first, cursor1) = cache.since(Cursor::default(), 2);
        assert_eq!(first.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
        let (second, _) = cache.since(cursor1, 2);
        assert_eq!(second.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn stale_cursor_after_wrap_falls_back_to_resident_window() {
        let mut cache = XLogCache::new(3);
        cache.put(1, 0, false, vec![0]);
        let (_, stale_cursor) = cache.since(Cursor::default(), 1);
        for i in 1..9 {
            cache.put(1, i, false, vec![i as u8]);
        }
        let (entries, _) = cache.since(stale_cursor, 100);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.first().unwrap().index, 7);
    }
}
