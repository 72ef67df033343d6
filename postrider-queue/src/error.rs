//! Error type for queue construction.

use thiserror::Error;

/// Failure while setting up a [`Queue`](crate::Queue).
///
/// Delivery failures never surface here: after commit they are persisted and
/// retried until terminal, with the DSN as the user-visible outcome.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A bounce target was supplied without the domain used to author
    /// notifications.
    #[error("a bounce target requires autogenerated_msg_domain to be set")]
    MissingAutogenDomain,

    /// The on-disk store could not be opened or scanned.
    #[error(transparent)]
    Spool(#[from] postrider_spool::SpoolError),
}
