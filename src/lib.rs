//! # dirvault Core Library
//!
//! This crate provides the core functionality for the `dirvault` backup and
//! directory-synchronization tool.
//!
//! It is designed to be used by the `dirvault` command-line application, but
//! its public API can also be used to programmatically back up, restore and
//! mirror directory trees.
//!
//! ## Key Modules
//!
//! - [`index`]: The durable file index mapping relative paths to last-known
//!   metadata and archive location, with per-file change detection.
//! - [`archive`]: Container naming, the per-run archive planner and the
//!   reference counts driving archive garbage collection.
//! - [`safeio`]: Retry-capable filesystem wrappers and the
//!   write-to-temp-then-commit durable file writer.
//! - [`backup`] / [`restore`]: The incremental backup and restore engines.
//! - [`sync`]: The producer/consumer mirrored directory-sync pipeline.

pub mod archive;
pub mod backup;
pub mod clean;
pub mod cli;
pub mod filter;
pub mod index;
pub mod progress;
pub mod restore;
pub mod safeio;
pub mod sync;

pub mod error;
pub use error::VaultError;
