//! In-memory ring and lookup caches fed by the dispatcher (spec §4.5, C5).
//! These exist purely for low-latency dashboard reads; durability lives in
//! [`crate::storage`].

pub mod alert_cache;
pub mod counter_cache;
pub mod object_cache;
pub mod text_cache;
pub mod xlog_cache;

pub use alert_cache::AlertCache;
pub use counter_cache::CounterCache;
pub use object_cache::ObjectCache;
pub use text_cache::TextCache;
pub use xlog_cache::{Cursor, XLogCache, XLogEntry};
