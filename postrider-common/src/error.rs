//! Delivery-time error handling.
//!
//! Downstream targets report failures in one of a few shapes: a real SMTP
//! reply, a composite [`PartialError`] that already partitions recipients, or
//! a plain I/O / internal failure. The queue classifies all of them through a
//! single temporary-vs-permanent predicate and coerces whatever it persists
//! into an [`SmtpError`].

use std::io;

use ahash::AHashMap;
use thiserror::Error;

use crate::smtp::SmtpError;

/// Error returned by delivery-target operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A concrete SMTP reply from the downstream server.
    #[error(transparent)]
    Smtp(#[from] SmtpError),

    /// Partially successful delivery with per-recipient outcomes.
    #[error(transparent)]
    Partial(PartialError),

    /// Network or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Anything else; treated as permanent.
    #[error("{0}")]
    Failure(String),
}

impl Error {
    /// Returns `true` iff the failure is worth retrying.
    ///
    /// SMTP 4xx replies and transient socket conditions are temporary;
    /// everything else, including composite errors (which are expanded, never
    /// classified as a whole), is not.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Smtp(err) => err.is_temporary(),
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
            Self::Partial(_) | Self::Failure(_) => false,
        }
    }

    /// Canonical serializable form of this error.
    ///
    /// SMTP replies pass through untouched; everything else is rewritten with
    /// the generic `451 4.0.0` / `554 5.0.0` codes.
    #[must_use]
    pub fn to_smtp(&self) -> SmtpError {
        match self {
            Self::Smtp(err) => err.clone(),
            other => SmtpError::coerce(other.to_string(), other.is_temporary()),
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Smtp(err) => Self::Smtp(err.clone()),
            Self::Partial(err) => Self::Partial(err.clone()),
            // io::Error is not Clone; a rebuilt error with the same kind and
            // text is equivalent for classification and reporting.
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
            Self::Failure(msg) => Self::Failure(msg.clone()),
        }
    }
}

/// Outcome of one partially successful delivery attempt.
///
/// `errs` has an entry for every recipient present in `failed` or
/// `temporary_failed`.
#[derive(Debug, Clone, Default, Error)]
#[error(
    "delivery failed for some recipients (permanently: {failed:?}, temporary: {temporary_failed:?})"
)]
pub struct PartialError {
    /// Recipients for which delivery permanently failed.
    pub failed: Vec<String>,
    /// Recipients for which delivery temporarily failed.
    pub temporary_failed: Vec<String>,
    /// Underlying error per recipient.
    pub errs: AHashMap<String, Error>,
}

impl PartialError {
    /// `true` when no recipient failed in any way.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.temporary_failed.is_empty()
    }

    /// Record a single recipient failure, classified by the error.
    pub fn push(&mut self, rcpt: String, err: Error) {
        if err.is_temporary() {
            self.temporary_failed.push(rcpt.clone());
        } else {
            self.failed.push(rcpt.clone());
        }
        self.errs.insert(rcpt, err);
    }

    /// Merge another partial result into this one, keeping its per-recipient
    /// errors.
    pub fn merge(&mut self, other: Self) {
        self.failed.extend(other.failed);
        self.temporary_failed.extend(other.temporary_failed);
        self.errs.extend(other.errs);
    }
}

#[cfg(test)]
mod tests {
    use crate::smtp::EnhancedCode;

    use super::*;

    fn smtp(code: u16) -> Error {
        Error::Smtp(SmtpError {
            code,
            enhanced_code: if code < 500 {
                EnhancedCode(4, 0, 0)
            } else {
                EnhancedCode(5, 0, 0)
            },
            message: "test".to_string(),
        })
    }

    #[test]
    fn smtp_errors_classify_by_code() {
        assert!(smtp(451).is_temporary());
        assert!(!smtp(550).is_temporary());
    }

    #[test]
    fn io_timeouts_are_temporary() {
        let err = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        assert!(err.is_temporary());

        let err = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(!err.is_temporary());
    }

    #[test]
    fn plain_failures_are_permanent() {
        assert!(!Error::Failure("broken".to_string()).is_temporary());
    }

    #[test]
    fn coercion_preserves_smtp_errors() {
        let orig = SmtpError {
            code: 552,
            enhanced_code: EnhancedCode(5, 2, 2),
            message: "mailbox full".to_string(),
        };
        assert_eq!(Error::Smtp(orig.clone()).to_smtp(), orig);
    }

    #[test]
    fn coercion_rewrites_foreign_errors() {
        let err = Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let coerced = err.to_smtp();
        assert_eq!(coerced.code, 451);
        assert_eq!(coerced.enhanced_code, EnhancedCode(4, 0, 0));

        let err = Error::Failure("spawn failed".to_string());
        let coerced = err.to_smtp();
        assert_eq!(coerced.code, 554);
        assert_eq!(coerced.enhanced_code, EnhancedCode(5, 0, 0));
    }

    #[test]
    fn push_classifies_and_records() {
        let mut perr = PartialError::default();
        perr.push("a@example.com".to_string(), smtp(451));
        perr.push("b@example.com".to_string(), smtp(550));

        assert_eq!(perr.temporary_failed, vec!["a@example.com"]);
        assert_eq!(perr.failed, vec!["b@example.com"]);
        assert!(perr.errs.contains_key("a@example.com"));
        assert!(perr.errs.contains_key("b@example.com"));
        assert!(!perr.is_empty());
    }
}
