//! Recent-alerts ring (spec §4.5, C5): the same shape as `XLogCache` but
//! without a cursor, since dashboards subscribing to alerts always want
//! "the last N", not an incremental feed.

use std::collections::VecDeque;

use crate::wire::AlertPack;

pub struct AlertCache {
    capacity: usize,
    ring: VecDeque<AlertPack>,
}

impl AlertCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "AlertCache capacity must be positive");
        Self {
            capacity,
            ring: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, alert: AlertPack) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(alert);
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<&AlertPack> {
        self.ring.iter().rev().take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
