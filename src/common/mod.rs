//! Common utilities and types shared across fleetkv

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{crc32, format_bytes, timestamp_now_millis, validate_bucket, validate_key};
