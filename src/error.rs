//! Errors surfaced by the library.
//!
//! Everything in here is a startup failure: once lines start flowing, I/O
//! trouble is absorbed by the file watchers and never reaches the consumer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot tail {}: it is a directory", path.display())]
    Directory { path: PathBuf },
    #[error("Invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Unknown filter method {0:?}")]
    UnknownMethod(String),
    #[error("Failed to parse filter at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("Unsupported whence {0:?}, expected start, current or end")]
    InvalidWhence(String),
    #[error("Unsupported file style {0:?}, expected none, base or full")]
    InvalidFileStyle(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
