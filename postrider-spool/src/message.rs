//! The persisted per-message envelope record.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use postrider_common::{MsgMetadata, SmtpError};
use serde::{Deserialize, Serialize};

/// Everything the queue knows about one message between attempts.
///
/// Serialized as the `<id>.meta` file of the on-disk triple. After each
/// attempt `to` holds exactly the recipients that temporarily failed and are
/// still worth trying; permanently failed recipients accumulate in
/// `failed_rcpts` so they can be reported in a bounce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetadata {
    pub msg_meta: MsgMetadata,

    /// Envelope sender; empty for the null sender.
    pub from: String,

    /// Recipients to try at the next attempt.
    pub to: Vec<String>,

    /// Recipients that permanently failed at any prior attempt.
    #[serde(default)]
    pub failed_rcpts: Vec<String>,

    /// Recipients that temporarily failed at the most recent attempt.
    #[serde(default)]
    pub temporary_failed_rcpts: Vec<String>,

    /// Last recorded error per recipient. Always SMTP-shaped so the record
    /// serializes and can be quoted verbatim in a notification.
    #[serde(default)]
    pub rcpt_errs: AHashMap<String, SmtpError>,

    /// Attempts already performed.
    #[serde(default)]
    pub tries_count: u32,

    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,

    /// `true` for generated delivery status notifications, so their own
    /// failures are never bounced again.
    #[serde(default)]
    pub dsn: bool,
}

impl QueueMetadata {
    /// Fresh metadata for a message entering the queue now.
    #[must_use]
    pub fn new(msg_meta: MsgMetadata, from: impl Into<String>, dsn: bool) -> Self {
        let now = Utc::now();
        Self {
            msg_meta,
            from: from.into(),
            to: Vec::new(),
            failed_rcpts: Vec::new(),
            temporary_failed_rcpts: Vec::new(),
            rcpt_errs: AHashMap::new(),
            tries_count: 0,
            first_attempt: now,
            last_attempt: now,
            dsn,
        }
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::EnhancedCode;

    use super::*;

    #[test]
    fn new_metadata_is_untried() {
        let meta = QueueMetadata::new(MsgMetadata::new("m1"), "sender@example.com", false);
        assert_eq!(meta.tries_count, 0);
        assert!(meta.to.is_empty());
        assert!(!meta.dsn);
        assert_eq!(meta.first_attempt, meta.last_attempt);
    }

    #[test]
    fn round_trips_through_json() {
        let mut meta = QueueMetadata::new(MsgMetadata::new("m2"), "sender@example.com", true);
        meta.to = vec!["rcpt@example.org".to_string()];
        meta.tries_count = 3;
        meta.rcpt_errs.insert(
            "rcpt@example.org".to_string(),
            SmtpError {
                code: 451,
                enhanced_code: EnhancedCode(4, 0, 0),
                message: "busy".to_string(),
            },
        );

        let json = serde_json::to_string(&meta).expect("serialize");
        let back: QueueMetadata = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.msg_meta.id, "m2");
        assert_eq!(back.to, meta.to);
        assert_eq!(back.tries_count, 3);
        assert!(back.dsn);
        assert_eq!(back.rcpt_errs["rcpt@example.org"].code, 451);
        assert_eq!(back.first_attempt, meta.first_attempt);
    }
}
