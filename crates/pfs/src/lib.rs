#![forbid(unsafe_code)]
//! pocketfs public API facade.
//!
//! Re-exports the filesystem surface from `pfs-fs` through a stable external
//! interface. This is the crate downstream consumers (CLI, tools) depend on.

pub use pfs_fs::*;
