//! Error types shared across the StreamGate crates.
//!
//! All fallible operations in this crate return `Result<T>` which is
//! aliased to `Result<T, Error>`, so callers can propagate with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
