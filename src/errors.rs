//! Error types shared across the node.

use std::fmt::{Display, Formatter};

/// Shared node result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Node error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed or out-of-state control message.
    Protocol(String),
    /// Advisory lock could not be obtained or released.
    Lock(String),
    /// Package install, enable or removal failure.
    Package(String),
    /// Query bookkeeping or persistence failure.
    Query(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// The external executor could not be started or driven.
    Executor(String),
    /// Control connection or subordinate link failure.
    Transport(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Lock(msg) => write!(f, "lock: {msg}"),
            Self::Package(msg) => write!(f, "package: {msg}"),
            Self::Query(msg) => write!(f, "query: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Executor(msg) => write!(f, "executor: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}
