//! File system helpers shared by the archive builder and restore.

pub mod walker;
