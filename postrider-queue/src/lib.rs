//! Durable store-and-forward retry queue.
//!
//! Accepts messages through the staged delivery protocol, persists them as
//! on-disk triples, and keeps attempting delivery to a downstream target
//! with exponential backoff until every recipient has either succeeded or
//! been given up on. Messages the queue gives up on are reported back to the
//! sender as a delivery status notification, which re-enters the queue like
//! any other message.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod config;
mod driver;
pub mod dsn;
pub mod error;
pub mod queue;
pub mod wheel;

pub use config::QueueConfig;
pub use error::QueueError;
pub use queue::{Queue, QueueDelivery};
pub use wheel::TimeWheel;
