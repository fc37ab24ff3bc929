pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod net;
pub mod storage;
pub mod wire;

pub use config::Config;
pub use context::ServerContext;
pub use error::{Result, ServerError};
pub use metrics::Metrics;
