#![forbid(unsafe_code)]
//! Error types for pocketfs.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the workspace.

use pfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all pocketfs operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt structure at block {block}: {detail}")]
    Corruption { block: u16, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(#[from] ParseError),

    #[error("no space left in backing file")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("name too long")]
    NameTooLong,

    #[error("invalid descriptor: {0}")]
    BadDescriptor(usize),

    #[error("descriptor table full")]
    DescriptorTableFull,
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;
