//! RFC 5322-style message header.
//!
//! A header is an ordered list of `Name: value` fields. Values may contain
//! folded continuation lines; folding is preserved verbatim so a parsed
//! header writes back byte-identically.

use thiserror::Error;

/// Header parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header line {0} has no colon")]
    MissingColon(usize),
    #[error("header starts with a continuation line")]
    LeadingContinuation,
    #[error("header is not valid UTF-8")]
    InvalidUtf8,
}

/// Ordered message header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append a field, keeping insertion order.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serialize to `Name: value\r\n` lines.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Parse header lines until a blank line or end of input.
    ///
    /// Lines starting with space or tab continue the previous field's value,
    /// with the fold retained.
    ///
    /// # Errors
    /// Fails on non-UTF-8 input, a field line without a colon, or a
    /// continuation line with nothing to continue.
    pub fn parse(input: &[u8]) -> Result<Self, HeaderError> {
        let text = std::str::from_utf8(input).map_err(|_| HeaderError::InvalidUtf8)?;
        let mut fields: Vec<(String, String)> = Vec::new();

        for (lineno, raw) in text.split("\r\n").enumerate() {
            let line = raw.strip_suffix('\n').unwrap_or(raw);
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let Some((_, value)) = fields.last_mut() else {
                    return Err(HeaderError::LeadingContinuation);
                };
                value.push_str("\r\n");
                value.push_str(line);
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(HeaderError::MissingColon(lineno + 1));
            };
            fields.push((name.to_string(), value.strip_prefix(' ').unwrap_or(value).to_string()));
        }

        Ok(Self { fields })
    }
}
