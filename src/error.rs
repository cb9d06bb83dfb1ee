//! Error types for the configuration loader and node startup path.
//!
//! Everything past startup (record decoding, transport hiccups, timer races)
//! is expected steady-state behavior, not exceptional, and is handled inline
//! with `if`/`match` rather than `Result`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    MissingFile(PathBuf),

    #[error("malformed configuration line {line}: {content:?}")]
    Parse { line: usize, content: String },

    #[error("{param} must be {constraint} (got {value})")]
    Constraint {
        param: &'static str,
        constraint: &'static str,
        value: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind multicast socket {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
