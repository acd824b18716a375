//! Outbound messages and their lifecycle
//!
//! One [`OutboundMessage`] exists per send attempt stream for one recipient.
//! Retries reuse the same row, bumping `retry_count`; the terminal state is
//! exactly one of sent/delivered/failed/exhausted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{MessageId, PhoneNumber, SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Message Status
// ----------------------------------------------------------------------------

/// Lifecycle status of one outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Created, not yet handed to the transport
    Pending,
    /// Waiting in the retry queue for `next_retry_at`
    PendingRetry,
    /// Accepted by the radio, awaiting a delivery report
    Sent,
    /// Network confirmed final delivery
    Delivered,
    /// No delivery report within the timeout; counted delivered, flagged
    DeliveredAssumed,
    /// Permanent failure, no more attempts
    Failed,
    /// Retry budget spent; counted failed
    Exhausted,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::PendingRetry => "PENDING_RETRY",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::DeliveredAssumed => "DELIVERED_ASSUMED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Exhausted => "EXHAUSTED",
        }
    }

    /// Whether no further state changes are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered
                | MessageStatus::DeliveredAssumed
                | MessageStatus::Failed
                | MessageStatus::Exhausted
        )
    }

    /// Whether the message counts as delivered for statistics
    pub fn counts_delivered(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::DeliveredAssumed
        )
    }
}

impl core::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "PENDING_RETRY" => Ok(MessageStatus::PendingRetry),
            "SENT" => Ok(MessageStatus::Sent),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "DELIVERED_ASSUMED" => Ok(MessageStatus::DeliveredAssumed),
            "FAILED" => Ok(MessageStatus::Failed),
            "EXHAUSTED" => Ok(MessageStatus::Exhausted),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

// ----------------------------------------------------------------------------
// Outbound Message
// ----------------------------------------------------------------------------

/// One send attempt stream for one recipient, durable across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub msg_id: MessageId,
    pub session_id: SessionId,
    pub recipient_index: u64,
    pub phone: PhoneNumber,
    pub body: String,
    pub sim_slot: u32,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<Timestamp>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
}

impl OutboundMessage {
    pub fn new(
        session_id: SessionId,
        recipient_index: u64,
        phone: PhoneNumber,
        body: impl Into<String>,
        sim_slot: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            msg_id: MessageId::new(),
            session_id,
            recipient_index,
            phone,
            body: body.into(),
            sim_slot,
            status: MessageStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
        }
    }

    /// Hash of the body used for fallback delivery-report correlation
    pub fn body_hash(&self) -> String {
        body_hash(&self.body)
    }

    pub fn mark_sent(&mut self, now: Timestamp) {
        self.status = MessageStatus::Sent;
        self.sent_at = Some(now);
        self.next_retry_at = None;
    }

    pub fn mark_delivered(&mut self, at: Timestamp) {
        self.status = MessageStatus::Delivered;
        self.delivered_at = Some(at);
    }

    pub fn mark_delivery_assumed(&mut self, at: Timestamp) {
        self.status = MessageStatus::DeliveredAssumed;
        self.delivered_at = Some(at);
    }

    pub fn mark_failed(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.status = MessageStatus::Failed;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.next_retry_at = None;
    }

    pub fn mark_exhausted(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.status = MessageStatus::Exhausted;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.next_retry_at = None;
    }

    /// Move into the retry queue with a computed wake-up time
    pub fn mark_pending_retry(&mut self, next_retry_at: Timestamp, reason: impl Into<String>) {
        self.status = MessageStatus::PendingRetry;
        self.retry_count += 1;
        self.next_retry_at = Some(next_retry_at);
        self.error_message = Some(reason.into());
    }
}

/// SHA-256 of a message body, hex-encoded
pub fn body_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage::new(
            SessionId::new(),
            0,
            PhoneNumber::parse("+254700000001").unwrap(),
            "Hi Wanjiku",
            0,
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn lifecycle_to_delivered() {
        let mut msg = message();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(!msg.status.is_terminal());

        msg.mark_sent(Timestamp::new(1_100));
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.sent_at, Some(Timestamp::new(1_100)));

        msg.mark_delivered(Timestamp::new(2_000));
        assert!(msg.status.is_terminal());
        assert!(msg.status.counts_delivered());
        assert_eq!(msg.delivered_at, Some(Timestamp::new(2_000)));
    }

    #[test]
    fn retry_bumps_count_and_schedule() {
        let mut msg = message();
        msg.mark_pending_retry(Timestamp::new(6_000), "radio busy");
        assert_eq!(msg.status, MessageStatus::PendingRetry);
        assert_eq!(msg.retry_count, 1);
        assert_eq!(msg.next_retry_at, Some(Timestamp::new(6_000)));

        msg.mark_sent(Timestamp::new(6_100));
        assert_eq!(msg.next_retry_at, None);
    }

    #[test]
    fn exhausted_counts_as_failed_not_delivered() {
        let mut msg = message();
        msg.mark_exhausted("E_TRANSPORT_TIMEOUT", "no ack after 5 attempts");
        assert!(msg.status.is_terminal());
        assert!(!msg.status.counts_delivered());
        assert_eq!(msg.error_code.as_deref(), Some("E_TRANSPORT_TIMEOUT"));
    }

    #[test]
    fn body_hash_is_stable() {
        let a = body_hash("Hi Wanjiku");
        let b = body_hash("Hi Wanjiku");
        let c = body_hash("Hi Atieno");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::PendingRetry,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::DeliveredAssumed,
            MessageStatus::Failed,
            MessageStatus::Exhausted,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>(), Ok(status));
        }
    }
}
