//! Transport seam
//!
//! The single porting boundary of the engine: everything platform-specific
//! about actually putting an SMS on the air lives behind [`Transport`].
//! Implementations are provided by the embedding application; the runtime
//! crate ships a scriptable mock and the CLI a console transport.

use tokio::sync::broadcast;

use crate::errors::TransportError;
use crate::types::{MessageId, PhoneNumber, Timestamp};

// ----------------------------------------------------------------------------
// Wire Types
// ----------------------------------------------------------------------------

/// One SMS handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSms {
    pub msg_id: MessageId,
    pub phone: PhoneNumber,
    pub body: String,
    pub sim_slot: u32,
}

/// Synchronous outcome of handing the SMS to the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendAck {
    pub msg_id: MessageId,
    pub accepted_at: Timestamp,
}

/// Asynchronous network report; may never arrive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Echoed message id; `None` when the transport lost it, in which case
    /// the tracker falls back to `(phone, body_hash, time)` correlation
    pub msg_id: Option<MessageId>,
    pub phone: PhoneNumber,
    /// Body hash echoed by transports that support it, for fallback matching
    pub body_hash: Option<String>,
    pub delivered: bool,
    pub at: Timestamp,
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Common interface to the platform SMS primitive
///
/// Each send resolves to a [`SendAck`] or a categorized [`TransportError`];
/// delivery reports are emitted out-of-band on a broadcast channel that
/// every interested task subscribes to.
///
/// Implementations must be safe to call from one executor task at a time per
/// session; the engine never issues concurrent sends for the same session.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Hand one SMS to the radio and await its acknowledgment
    ///
    /// The caller enforces the ack timeout; implementations should simply
    /// await the platform primitive.
    async fn send(&self, sms: &OutboundSms) -> Result<SendAck, TransportError>;

    /// Subscribe to out-of-band delivery reports
    fn delivery_reports(&self) -> broadcast::Receiver<DeliveryReport>;

    /// Human-readable transport name for logs
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that the trait stays object safe; the runtime
    // wires `Arc<dyn Transport>`.
    fn _assert_object_safe(_: &dyn Transport) {}

    #[test]
    fn delivery_report_without_id_supports_fallback() {
        let report = DeliveryReport {
            msg_id: None,
            phone: PhoneNumber::parse("+254700000001").unwrap(),
            body_hash: Some(crate::message::body_hash("Hi")),
            delivered: true,
            at: Timestamp::new(5),
        };
        assert!(report.msg_id.is_none());
        assert!(report.body_hash.is_some());
    }
}
