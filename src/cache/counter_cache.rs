//! Last-write-wins performance counter cache (spec §4.5, C5).
//!
//! Keyed by `(obj_hash, counter_name, time_type)`. A real-time agent that
//! polls this cache only ever wants the latest sample for a given counter,
//! so unlike `XLogCache` there is no history or cursor here — `put`
//! overwrites.

use std::collections::HashMap;

use crate::wire::{TimeType, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    obj_hash: i32,
    counter_name: String,
    time_type_byte: u8,
}

fn time_type_byte(t: TimeType) -> u8 {
    match t {
        TimeType::Realtime => 0,
        TimeType::FiveMin => 1,
        TimeType::OneHour => 2,
    }
}

#[derive(Debug, Clone)]
pub struct CounterSample {
    pub time_ms: i64,
    pub value: Value,
}

#[derive(Default)]
pub struct CounterCache {
    entries: HashMap<CounterKey, CounterSample>,
}

impl CounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, obj_hash: i32, counter_name: &str, time_type: TimeType, time_ms: i64, value: Value) {
        let key = CounterKey {
            obj_hash,
            counter_name: counter_name.to_string(),
            time_type_byte: time_type_byte(time_type),
        };
        self.entries.insert(key, CounterSample { time_ms, value });
    }

    pub fn get(&self, obj_hash: i32, counter_name: &str, time_type: TimeType) -> Option<&CounterSample> {
        let key = CounterKey {
            obj_hash,
            counter_name: counter_name.to_string(),
            time_type_byte: time_type_byte(time_type),
        };
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
