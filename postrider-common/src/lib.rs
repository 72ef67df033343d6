//! Shared vocabulary for the postrider mail stack: envelope addresses, SMTP
//! status codes, the composite delivery error, message metadata, header and
//! body types, and the delivery-target capability set.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod address;
pub mod body;
pub mod error;
pub mod header;
pub mod logging;
pub mod message;
pub mod smtp;
pub mod target;
pub mod testing;

pub use body::BodyBuffer;
pub use error::{Error, PartialError};
pub use header::Header;
pub use message::{MsgMetadata, SourceAddr};
pub use smtp::{EnhancedCode, SmtpError};
pub use target::{Delivery, DeliveryTarget};
