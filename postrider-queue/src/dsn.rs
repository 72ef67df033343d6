//! Delivery status notification (bounce) synthesis, RFC 3464 style.
//!
//! When the queue gives up on a message it reports the per-recipient
//! outcomes back to the original sender as a `multipart/report` message:
//! a human-readable part, a machine-readable `message/delivery-status` part
//! and the original header as `text/rfc822-headers`.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use postrider_common::{BodyBuffer, EnhancedCode, Header, SmtpError};

/// Envelope of the generated notification.
#[derive(Debug, Clone)]
pub struct DsnEnvelope {
    /// Message id of the notification itself, angle-bracketed.
    pub msg_id: String,
    /// Always the MAILER-DAEMON mailbox of the generating host.
    pub from: String,
    /// The original envelope sender.
    pub to: String,
}

/// Reporting-MTA information for the per-message status group.
#[derive(Debug, Clone)]
pub struct ReportingMtaInfo {
    pub reporting_mta: String,
    /// Hostname the failed message was received from; omitted when the
    /// source asked not to be traced.
    pub received_from_mta: Option<String>,
    pub x_sender: String,
    pub x_message_id: String,
    pub arrival_date: DateTime<Utc>,
    pub last_attempt_date: DateTime<Utc>,
}

/// Per-recipient status group. The action is always `failed`; the queue only
/// reports recipients it has given up on.
#[derive(Debug, Clone)]
pub struct RecipientInfo {
    pub final_recipient: String,
    pub status: EnhancedCode,
    pub diagnostic: SmtpError,
}

/// Build the header and body of a failure notification.
#[must_use]
pub fn generate(
    envelope: &DsnEnvelope,
    mta_info: &ReportingMtaInfo,
    rcpts: &[RecipientInfo],
    original_header: &Header,
) -> (Header, BodyBuffer) {
    let boundary = format!("=_{}", ulid::Ulid::new());

    let mut header = Header::new();
    header.append("Date", Utc::now().to_rfc2822());
    header.append(
        "From",
        format!("Mail Delivery Subsystem <{}>", envelope.from),
    );
    header.append("To", envelope.to.clone());
    header.append("Subject", "Undelivered Mail Returned to Sender");
    header.append("Message-Id", envelope.msg_id.clone());
    header.append("Auto-Submitted", "auto-replied");
    header.append("MIME-Version", "1.0");
    header.append(
        "Content-Type",
        format!("multipart/report; report-type=delivery-status; boundary=\"{boundary}\""),
    );

    let mut body = String::new();
    body.push_str("This is a MIME-encapsulated message.\r\n\r\n");

    let _ = write!(
        body,
        "--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        human_readable_part(mta_info, rcpts)
    );
    let _ = write!(
        body,
        "\r\n--{boundary}\r\nContent-Type: message/delivery-status\r\n\r\n{}",
        delivery_status_part(mta_info, rcpts)
    );
    let _ = write!(
        body,
        "\r\n--{boundary}\r\nContent-Type: text/rfc822-headers\r\n\r\n"
    );
    body.push_str(&String::from_utf8_lossy(&original_header.to_bytes()));
    let _ = write!(body, "\r\n--{boundary}--\r\n");

    (header, BodyBuffer::from(body.into_bytes()))
}

fn human_readable_part(mta_info: &ReportingMtaInfo, rcpts: &[RecipientInfo]) -> String {
    let mut text = format!(
        "This is the mail system at host {}.\r\n\r\n\
         I'm sorry to have to inform you that your message could not\r\n\
         be delivered to one or more recipients.\r\n\r\n",
        mta_info.reporting_mta
    );
    for rcpt in rcpts {
        let _ = write!(
            text,
            "<{}>: {}\r\n",
            rcpt.final_recipient, rcpt.diagnostic.message
        );
    }
    text
}

fn delivery_status_part(mta_info: &ReportingMtaInfo, rcpts: &[RecipientInfo]) -> String {
    let mut status = format!("Reporting-MTA: dns; {}\r\n", mta_info.reporting_mta);
    if let Some(received_from) = &mta_info.received_from_mta {
        let _ = write!(status, "Received-From-MTA: dns; {received_from}\r\n");
    }
    let _ = write!(status, "X-Postrider-Sender: rfc822; {}\r\n", mta_info.x_sender);
    let _ = write!(status, "X-Original-Message-ID: {}\r\n", mta_info.x_message_id);
    let _ = write!(
        status,
        "Arrival-Date: {}\r\n",
        mta_info.arrival_date.to_rfc2822()
    );

    for rcpt in rcpts {
        status.push_str("\r\n");
        let _ = write!(status, "Final-Recipient: rfc822; {}\r\n", rcpt.final_recipient);
        status.push_str("Action: failed\r\n");
        let _ = write!(status, "Status: {}\r\n", rcpt.status);
        let _ = write!(status, "Diagnostic-Code: smtp; {}\r\n", rcpt.diagnostic);
        let _ = write!(
            status,
            "Last-Attempt-Date: {}\r\n",
            mta_info.last_attempt_date.to_rfc2822()
        );
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (DsnEnvelope, ReportingMtaInfo, Vec<RecipientInfo>) {
        let envelope = DsnEnvelope {
            msg_id: "<01JA0000000000000000000000@mx.example.net>".to_string(),
            from: "MAILER-DAEMON@mx.example.net".to_string(),
            to: "sender@example.com".to_string(),
        };
        let mta_info = ReportingMtaInfo {
            reporting_mta: "mx.example.net".to_string(),
            received_from_mta: Some("client.example.com".to_string()),
            x_sender: "sender@example.com".to_string(),
            x_message_id: "orig-id".to_string(),
            arrival_date: Utc::now(),
            last_attempt_date: Utc::now(),
        };
        let rcpts = vec![RecipientInfo {
            final_recipient: "rcpt@example.org".to_string(),
            status: EnhancedCode(5, 1, 1),
            diagnostic: SmtpError {
                code: 550,
                enhanced_code: EnhancedCode(5, 1, 1),
                message: "no such user".to_string(),
            },
        }];
        (envelope, mta_info, rcpts)
    }

    #[tokio::test]
    async fn notification_carries_required_fields() {
        let (envelope, mta_info, rcpts) = fixture();
        let mut original = Header::new();
        original.append("Subject", "the lost message");

        let (header, body) = generate(&envelope, &mta_info, &rcpts, &original);

        assert_eq!(header.get("To"), Some("sender@example.com"));
        assert_eq!(header.get("Auto-Submitted"), Some("auto-replied"));
        assert!(
            header
                .get("Content-Type")
                .expect("content type")
                .starts_with("multipart/report")
        );

        let body = String::from_utf8(body.read_to_vec().await.expect("read")).expect("utf8");
        assert!(body.contains("Reporting-MTA: dns; mx.example.net"));
        assert!(body.contains("Received-From-MTA: dns; client.example.com"));
        assert!(body.contains("Final-Recipient: rfc822; rcpt@example.org"));
        assert!(body.contains("Action: failed"));
        assert!(body.contains("Status: 5.1.1"));
        assert!(body.contains("Diagnostic-Code: smtp; 550 5.1.1 no such user"));
        assert!(body.contains("Subject: the lost message"));
    }

    #[tokio::test]
    async fn untraced_sender_omits_received_from() {
        let (envelope, mut mta_info, rcpts) = fixture();
        mta_info.received_from_mta = None;

        let (_, body) = generate(&envelope, &mta_info, &rcpts, &Header::new());
        let body = String::from_utf8(body.read_to_vec().await.expect("read")).expect("utf8");
        assert!(!body.contains("Received-From-MTA"));
    }
}
