//! Crash-safe on-disk storage for queued messages.
//!
//! A message lives as the triple `<id>.meta` / `<id>.header` / `<id>.body`
//! inside a single directory. [`DiskStore`] owns the write/remove ordering
//! that makes interrupted operations recognizable, and the startup scan that
//! reconciles whatever a crash left behind.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod message;
pub mod store;

pub use error::{Result, SpoolError};
pub use message::QueueMetadata;
pub use store::DiskStore;
