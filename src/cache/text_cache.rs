//! In-memory text dictionary, bounded by total character count rather than
//! entry count (spec §4.5, C5), since entries vary wildly in size (a SQL
//! class name vs. a full SQL statement).
//!
//! Eviction is oldest-insertion-first. `put` is idempotent per `(xtype,
//! hash)` — a repeated observation of the same text does not grow memory or
//! change eviction order.

use std::collections::VecDeque;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TextKey {
    xtype: String,
    hash: i32,
}

pub struct TextCache {
    max_chars: usize,
    current_chars: usize,
    order: VecDeque<TextKey>,
    entries: HashMap<TextKey, String>,
}

impl TextCache {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            current_chars: 0,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn put(&mut self, xtype: &str, hash: i32, text: &str) {
        let key = TextKey {
            xtype: xtype.to_string(),
            hash,
        };
        if self.entries.contains_key(&key) {
            return;
        }
        self.current_chars += text.chars().count();
        self.entries.insert(key.clone(), text.to_string());
        self.order.push_back(key);
        self.evict_to_fit();
    }

    pub fn get(&self, xtype: &str, hash: i32) -> Option<&str> {
        let key = TextKey {
            xtype: xtype.to_string(),
            hash,
        };
        self.entries.get(&key).map(|s| s.as_str())
    }

    pub fn current_chars(&self) -> usize {
        self.current_chars
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_to_fit(&mut self) {
        while self.current_chars > self.max_chars {
            match self.order.pop_front() {
                Some(key) => {
                    if let Some(text) = self.entries.remove(&key) {
                        self.current_chars -= text.chars().count();
                    }
                }
                None => break,
            }
        }
    }
}
