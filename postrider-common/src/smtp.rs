//! SMTP status codes as they are persisted and reported.
//!
//! Every recipient failure the queue records is eventually stored on disk and
//! possibly quoted verbatim in a bounce message, so the canonical form is the
//! wire-level SMTP reply: numeric code, enhanced status code triple, text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC 3463 enhanced status code (`class.subject.detail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedCode(pub u8, pub u8, pub u8);

impl std::fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// An SMTP reply describing a delivery failure.
///
/// This is the only error shape that survives serialization; anything else is
/// coerced through [`SmtpError::coerce`] before it reaches disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code} {enhanced_code} {message}")]
pub struct SmtpError {
    pub code: u16,
    pub enhanced_code: EnhancedCode,
    pub message: String,
}

impl SmtpError {
    /// Returns `true` for 4xx replies, which are worth retrying.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Rewrite an arbitrary error into a generic SMTP reply.
    ///
    /// Temporary failures become `451 4.0.0`, permanent ones `554 5.0.0`,
    /// with the original error text preserved as the reply message.
    #[must_use]
    pub fn coerce(message: String, temporary: bool) -> Self {
        if temporary {
            Self {
                code: 451,
                enhanced_code: EnhancedCode(4, 0, 0),
                message,
            }
        } else {
            Self {
                code: 554,
                enhanced_code: EnhancedCode(5, 0, 0),
                message,
            }
        }
    }
}
