//! Envelope-based message dispatcher.
//!
//! Routes incoming deliveries through a two-level `(sender, recipient)`
//! pattern table to zero or more downstream delivery targets. One upstream
//! message whose recipients route to different targets is split into one
//! downstream delivery per target.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod dispatcher;

pub use dispatcher::{Dispatcher, RcptBlock, SourceBlock};
