//! Envelope address validation.
//!
//! The envelope grammar here is deliberately small: either a regular
//! `localpart@domain` mailbox with exactly one `@` and both sides non-empty,
//! or the bare special mailbox `postmaster` (RFC 5321 §4.5.1), matched
//! case-insensitively and carrying no domain.

use thiserror::Error;

/// Validation failure for an envelope address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address does not contain an at sign")]
    MissingAtSign,
    #[error("address contains more than one at sign")]
    MultipleAtSigns,
    #[error("address has an empty local part")]
    EmptyLocalPart,
    #[error("address has an empty domain")]
    EmptyDomain,
}

/// Split an envelope address into `(localpart, domain)`.
///
/// The bare token `postmaster` is returned as `("postmaster", "")`.
///
/// # Errors
/// Returns an [`AddressError`] describing the first grammar violation found.
pub fn split(addr: &str) -> Result<(&str, &str), AddressError> {
    if addr.eq_ignore_ascii_case("postmaster") {
        return Ok((addr, ""));
    }
    match addr.matches('@').count() {
        0 => Err(AddressError::MissingAtSign),
        1 => {
            let Some((local, domain)) = addr.split_once('@') else {
                return Err(AddressError::MissingAtSign);
            };
            if local.is_empty() {
                return Err(AddressError::EmptyLocalPart);
            }
            if domain.is_empty() {
                return Err(AddressError::EmptyDomain);
            }
            Ok((local, domain))
        }
        _ => Err(AddressError::MultipleAtSigns),
    }
}

/// `true` when the address is the special `postmaster` mailbox without a
/// domain, in any case.
#[must_use]
pub fn is_postmaster(addr: &str) -> bool {
    addr.eq_ignore_ascii_case("postmaster")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_regular_addresses() {
        assert_eq!(split("user@example.com"), Ok(("user", "example.com")));
        assert_eq!(split("a.b+tag@Example.ORG"), Ok(("a.b+tag", "Example.ORG")));
    }

    #[test]
    fn postmaster_has_no_domain() {
        assert_eq!(split("postmaster"), Ok(("postmaster", "")));
        assert_eq!(split("POSTMastER"), Ok(("POSTMastER", "")));
        assert!(is_postmaster("Postmaster"));
        assert!(!is_postmaster("postmaster@example.com"));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(
            split("not_postmaster_but_no_at_sign"),
            Err(AddressError::MissingAtSign)
        );
        assert_eq!(split("@no_mailbox"), Err(AddressError::EmptyLocalPart));
        assert_eq!(split("no_domain@"), Err(AddressError::EmptyDomain));
        assert_eq!(
            split("that@is@definiely@broken"),
            Err(AddressError::MultipleAtSigns)
        );
    }
}
