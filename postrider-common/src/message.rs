//! Upstream message metadata carried alongside every delivery.

use std::net::SocketAddr;

use ahash::AHashMap;
use serde::{Deserialize, Serialize, de};

/// Network address of the client a message was received from.
///
/// Only TCP addresses survive a round trip through disk: the serialized form
/// is the plain `ip:port` string, and anything that does not parse back as a
/// socket address deserializes as [`SourceAddr::Other`]. Stores null-erase
/// non-TCP addresses before saving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAddr {
    Tcp(SocketAddr),
    Other(String),
}

impl SourceAddr {
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }
}

impl std::fmt::Display for SourceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => addr.fmt(f),
            Self::Other(s) => s.fmt(f),
        }
    }
}

impl Serialize for SourceAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SourceAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = SourceAddr;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a network address string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.parse::<SocketAddr>()
                    .map_or_else(|_| SourceAddr::Other(v.to_string()), SourceAddr::Tcp))
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

/// Opaque per-message metadata assigned by the receiving edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgMetadata {
    /// Collision-resistant identifier, stable for the message's lifetime.
    pub id: String,

    /// Protocol the message arrived over (e.g. `smtp`, `lmtp`).
    #[serde(default)]
    pub src_proto: String,

    /// Hostname the sending client identified as.
    #[serde(default)]
    pub src_hostname: String,

    /// Network address of the sending client, if known.
    #[serde(default)]
    pub src_addr: Option<SourceAddr>,

    /// Recipient addresses as originally submitted, keyed by their rewritten
    /// form. Used to report the pre-rewrite address in bounce messages.
    #[serde(default)]
    pub original_rcpts: AHashMap<String, String>,

    /// Suppress sender-identifying trace information in generated
    /// notifications.
    #[serde(default)]
    pub dont_trace_sender: bool,
}

impl MsgMetadata {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_addr_round_trips() {
        let addr = SourceAddr::Tcp("192.0.2.7:2525".parse().expect("addr"));
        let json = serde_json::to_string(&addr).expect("serialize");
        let back: SourceAddr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }

    #[test]
    fn unknown_addr_becomes_other() {
        let back: SourceAddr =
            serde_json::from_str("\"/run/postrider.sock\"").expect("deserialize");
        assert_eq!(back, SourceAddr::Other("/run/postrider.sock".to_string()));
        assert!(!back.is_tcp());
    }

    #[test]
    fn metadata_defaults_fill_missing_fields() {
        let meta: MsgMetadata = serde_json::from_str("{\"id\": \"abc\"}").expect("deserialize");
        assert_eq!(meta.id, "abc");
        assert!(meta.src_addr.is_none());
        assert!(!meta.dont_trace_sender);
        assert!(meta.original_rcpts.is_empty());
    }
}
