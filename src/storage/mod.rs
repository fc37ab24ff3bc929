//! Day-partitioned, append-only storage layer (spec §3-4, C2-C4, C10).

pub mod container;
pub mod hash_text;
pub mod purge;
pub mod time_index;

pub use container::{Container, ContainerRegistry};
pub use hash_text::HashIndexFile;
pub use time_index::{IndexTimeFile, RealDataFile};
