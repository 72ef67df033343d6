//! The delivery-target capability set.
//!
//! Anything able to accept mail implements these two traits: the queue, the
//! dispatcher, and concrete transports all expose the same staged
//! `start -> add_rcpt* -> body -> commit | abort` protocol, which is what
//! lets them be stacked behind `Arc<dyn DeliveryTarget>`.
//!
//! The stages of a single delivery are sequential by contract; a
//! [`Delivery`] handle is never used concurrently.

use async_trait::async_trait;

use crate::{body::BodyBuffer, error::Error, header::Header, message::MsgMetadata};

/// A destination that deliveries can be started against.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Begin a delivery for the given envelope sender.
    ///
    /// # Errors
    /// Rejects the sender (e.g. malformed address, policy) with an [`Error`].
    async fn start(&self, msg_meta: &MsgMetadata, mail_from: &str)
    -> Result<Box<dyn Delivery>, Error>;
}

/// One in-progress delivery.
#[async_trait]
pub trait Delivery: Send {
    /// Add a recipient to the delivery.
    ///
    /// # Errors
    /// Rejects the recipient; other recipients of the same delivery are
    /// unaffected.
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Error>;

    /// Provide the message header and body.
    ///
    /// # Errors
    /// May fail for all recipients at once, or return [`Error::Partial`] to
    /// partition them.
    async fn body(&mut self, header: &Header, body: &BodyBuffer) -> Result<(), Error>;

    /// Finalize the delivery.
    ///
    /// # Errors
    /// Same error contract as [`Delivery::body`].
    async fn commit(self: Box<Self>) -> Result<(), Error>;

    /// Discard the delivery, releasing any partial state.
    ///
    /// # Errors
    /// Best-effort; failures are typically only logged by callers.
    async fn abort(self: Box<Self>) -> Result<(), Error>;
}
