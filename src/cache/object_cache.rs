//! Live agent/object directory (spec §4.5, C5).
//!
//! Each `ObjectPack` received from an agent refreshes a `last_seen` stamp.
//! A background sweeper marks objects dead after `dead_timeout` with no
//! refresh, without removing them — a dashboard still wants to show a
//! recently-dead object, just flagged as no longer alive.

use std::collections::HashMap;
use std::time::Duration;

use crate::wire::ObjectPack;

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub pack: ObjectPack,
    pub last_seen_ms: i64,
    pub alive: bool,
}

#[derive(Default)]
pub struct ObjectCache {
    entries: HashMap<i32, ObjectEntry>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, pack: ObjectPack, now_ms: i64) {
        let obj_hash = pack.obj_hash;
        self.entries.insert(
            obj_hash,
            ObjectEntry {
                pack,
                last_seen_ms: now_ms,
                alive: true,
            },
        );
    }

    pub fn get(&self, obj_hash: i32) -> Option<&ObjectEntry> {
        self.entries.get(&obj_hash)
    }

    pub fn all(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Mark every entry not refreshed within `dead_timeout` as no longer
    /// alive. Returns the number of entries newly marked dead.
    pub fn sweep_dead(&mut self, now_ms: i64, dead_timeout: Duration) -> usize {
        let cutoff = now_ms - dead_timeout.as_millis() as i64;
        let mut newly_dead = 0;
        for entry in self.entries.values_mut() {
            if entry.alive && entry.last_seen_ms < cutoff {
                entry.alive = false;
                newly_dead += 1;
            }
        }
        newly_dead
    }
}
