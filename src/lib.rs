#![forbid(unsafe_code)]

pub mod areas;
pub mod cache;
pub mod config;
pub mod errors;
pub mod executor;
pub mod fs_ops;
pub mod lock;
pub mod log_channel;
pub mod log_level;
pub mod packages;
pub mod protocol;
pub mod query;
pub mod session;
pub mod transport;
pub mod urgent;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
