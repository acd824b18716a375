//! Delivery tracking and statistics
//!
//! Correlates asynchronous send/delivery acknowledgments back to logical
//! messages and computes running statistics. The state machine per message
//! is `Pending -> Sent -> (Delivered | Failed)`, with a timeout path to
//! `DeliveredAssumed` when the network never reports back.
//!
//! The tracker is a plain state machine; the runtime's dispatcher task is
//! its single writer and publishes snapshots to readers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{MessageStatus, OutboundMessage};
use crate::transport::DeliveryReport;
use crate::types::{MessageId, PhoneNumber, SessionId, Timestamp};

/// Tolerance for fallback `(phone, body_hash, send_time)` correlation
const CORRELATION_WINDOW_MS: u64 = 60_000;

// ----------------------------------------------------------------------------
// Send Dispositions
// ----------------------------------------------------------------------------

/// How one transport send attempt concluded, as seen by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDisposition {
    /// The radio accepted the message
    Accepted,
    /// Transient failure; the message is heading for the retry queue
    TransientFailure { reason: String },
    /// Permanent failure; no retry will happen
    PermanentFailure { code: String, reason: String },
}

// ----------------------------------------------------------------------------
// Tracked Message
// ----------------------------------------------------------------------------

/// Tracker-side view of one outbound message
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    pub msg_id: MessageId,
    pub session_id: SessionId,
    pub phone: PhoneNumber,
    pub body_hash: String,
    pub status: MessageStatus,
    pub created_at: Timestamp,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
}

impl TrackedMessage {
    fn of(msg: &OutboundMessage) -> Self {
        Self {
            msg_id: msg.msg_id,
            session_id: msg.session_id,
            phone: msg.phone.clone(),
            body_hash: msg.body_hash(),
            status: MessageStatus::Pending,
            created_at: msg.created_at,
            sent_at: None,
            delivered_at: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Statistics
// ----------------------------------------------------------------------------

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DeliveryStats {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    /// Confirmed by a network delivery report
    pub delivered: u64,
    /// Timed out waiting for a report; counted delivered but flagged
    pub delivered_assumed: u64,
    pub failed: u64,
    /// `(delivered + delivered_assumed) / max(1, ever sent)`
    pub delivery_rate: f64,
    /// Mean report latency over confirmed deliveries only
    pub average_delivery_latency_ms: f64,
}

// ----------------------------------------------------------------------------
// Delivery Tracker
// ----------------------------------------------------------------------------

/// Terminal entries folded out of the live map keep contributing to the
/// cumulative statistics
#[derive(Debug, Clone, Copy, Default)]
struct RetiredCounts {
    total: u64,
    delivered: u64,
    delivered_assumed: u64,
    failed: u64,
    ever_sent: u64,
    latency_sum_ms: u64,
    latency_n: u64,
}

/// Correlates transport callbacks with logical messages
pub struct DeliveryTracker {
    delivery_timeout_ms: u64,
    tracked: HashMap<MessageId, TrackedMessage>,
    retired: RetiredCounts,
}

impl DeliveryTracker {
    pub fn new(delivery_timeout_ms: u64) -> Self {
        Self {
            delivery_timeout_ms,
            tracked: HashMap::new(),
            retired: RetiredCounts::default(),
        }
    }

    /// Begin tracking a message the executor is about to send
    pub fn track(&mut self, msg: &OutboundMessage) {
        self.tracked
            .entry(msg.msg_id)
            .or_insert_with(|| TrackedMessage::of(msg));
    }

    /// Apply the synchronous outcome of a transport send.
    ///
    /// Idempotent per message: a duplicate `Accepted` for an already-sent
    /// message is ignored, which is what makes the at-least-once retry queue
    /// safe.
    pub fn record_send(
        &mut self,
        msg_id: MessageId,
        disposition: &SendDisposition,
        now: Timestamp,
    ) -> bool {
        let Some(tracked) = self.tracked.get_mut(&msg_id) else {
            return false;
        };
        match disposition {
            SendDisposition::Accepted => {
                if tracked.status == MessageStatus::Sent || tracked.status.is_terminal() {
                    return false; // duplicate ack
                }
                tracked.status = MessageStatus::Sent;
                tracked.sent_at = Some(now);
                true
            }
            SendDisposition::TransientFailure { .. } => {
                if tracked.status.is_terminal() {
                    return false;
                }
                tracked.status = MessageStatus::PendingRetry;
                true
            }
            SendDisposition::PermanentFailure { .. } => {
                if tracked.status.is_terminal() {
                    return false;
                }
                tracked.status = MessageStatus::Failed;
                true
            }
        }
    }

    /// The retry budget for a message is spent
    pub fn record_exhausted(&mut self, msg_id: MessageId) {
        if let Some(tracked) = self.tracked.get_mut(&msg_id) {
            if !tracked.status.is_terminal() {
                tracked.status = MessageStatus::Exhausted;
            }
        }
    }

    /// Apply an out-of-band delivery report; returns the affected message.
    ///
    /// Correlation is by echoed id when present, otherwise by
    /// `(phone, body_hash, send_time ± 60 s)`.
    pub fn record_report(&mut self, report: &DeliveryReport) -> Option<MessageId> {
        let msg_id = match report.msg_id {
            Some(id) if self.tracked.contains_key(&id) => id,
            Some(_) => return None,
            None => self.correlate_fallback(report)?,
        };

        let tracked = self.tracked.get_mut(&msg_id)?;
        // only a sent (or already assumed) message can receive a report
        if !matches!(
            tracked.status,
            MessageStatus::Sent | MessageStatus::DeliveredAssumed
        ) {
            return None;
        }
        if report.delivered {
            tracked.status = MessageStatus::Delivered;
            tracked.delivered_at = Some(report.at);
        } else {
            tracked.status = MessageStatus::Failed;
        }
        Some(msg_id)
    }

    /// Messages stuck in `Sent` past the delivery timeout become
    /// `DeliveredAssumed`; returns the messages flipped this sweep.
    pub fn sweep_timeouts(&mut self, now: Timestamp) -> Vec<MessageId> {
        let timeout = self.delivery_timeout_ms;
        let mut flipped = Vec::new();
        for tracked in self.tracked.values_mut() {
            if tracked.status == MessageStatus::Sent {
                if let Some(sent_at) = tracked.sent_at {
                    if now.millis_since(sent_at) >= timeout {
                        tracked.status = MessageStatus::DeliveredAssumed;
                        tracked.delivered_at = Some(now);
                        flipped.push(tracked.msg_id);
                    }
                }
            }
        }
        flipped
    }

    pub fn get(&self, msg_id: &MessageId) -> Option<&TrackedMessage> {
        self.tracked.get(msg_id)
    }

    /// Retire a finished session's terminal entries from the live map.
    ///
    /// Their counts keep contributing to the cumulative statistics.
    pub fn forget_session(&mut self, session_id: SessionId) {
        let retired = &mut self.retired;
        self.tracked.retain(|_, t| {
            if t.session_id != session_id || !t.status.is_terminal() {
                return true;
            }
            retired.total += 1;
            match t.status {
                MessageStatus::Delivered => retired.delivered += 1,
                MessageStatus::DeliveredAssumed => retired.delivered_assumed += 1,
                MessageStatus::Failed | MessageStatus::Exhausted => retired.failed += 1,
                _ => unreachable!("terminal filter"),
            }
            if t.sent_at.is_some() {
                retired.ever_sent += 1;
            }
            if t.status == MessageStatus::Delivered {
                if let (Some(sent_at), Some(delivered_at)) = (t.sent_at, t.delivered_at) {
                    retired.latency_sum_ms += delivered_at.millis_since(sent_at);
                    retired.latency_n += 1;
                }
            }
            false
        });
    }

    /// Compute the current statistics snapshot
    pub fn stats(&self) -> DeliveryStats {
        let mut stats = DeliveryStats {
            total: self.retired.total,
            delivered: self.retired.delivered,
            delivered_assumed: self.retired.delivered_assumed,
            failed: self.retired.failed,
            ..DeliveryStats::default()
        };
        let mut ever_sent = self.retired.ever_sent;
        let mut latency_sum = self.retired.latency_sum_ms;
        let mut latency_n = self.retired.latency_n;

        for tracked in self.tracked.values() {
            stats.total += 1;
            match tracked.status {
                MessageStatus::Pending | MessageStatus::PendingRetry => stats.pending += 1,
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Delivered => stats.delivered += 1,
                MessageStatus::DeliveredAssumed => stats.delivered_assumed += 1,
                MessageStatus::Failed | MessageStatus::Exhausted => stats.failed += 1,
            }
            if tracked.sent_at.is_some() {
                ever_sent += 1;
            }
            if tracked.status == MessageStatus::Delivered {
                if let (Some(sent_at), Some(delivered_at)) = (tracked.sent_at, tracked.delivered_at)
                {
                    latency_sum += delivered_at.millis_since(sent_at);
                    latency_n += 1;
                }
            }
        }

        stats.delivery_rate =
            (stats.delivered + stats.delivered_assumed) as f64 / ever_sent.max(1) as f64;
        stats.average_delivery_latency_ms = if latency_n == 0 {
            0.0
        } else {
            latency_sum as f64 / latency_n as f64
        };
        stats
    }

    fn correlate_fallback(&self, report: &DeliveryReport) -> Option<MessageId> {
        self.tracked
            .values()
            .filter(|t| t.phone == report.phone)
            .filter(|t| {
                report
                    .body_hash
                    .as_ref()
                    .map(|h| *h == t.body_hash)
                    .unwrap_or(true)
            })
            .filter(|t| {
                t.sent_at
                    .map(|sent_at| {
                        let delta = if report.at >= sent_at {
                            report.at.millis_since(sent_at)
                        } else {
                            sent_at.millis_since(report.at)
                        };
                        delta <= CORRELATION_WINDOW_MS
                    })
                    .unwrap_or(false)
            })
            .filter(|t| t.status == MessageStatus::Sent)
            .min_by_key(|t| t.sent_at)
            .map(|t| t.msg_id)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(body: &str, now: u64) -> OutboundMessage {
        OutboundMessage::new(
            SessionId::new(),
            0,
            PhoneNumber::parse("+254700000001").unwrap(),
            body,
            0,
            Timestamp::new(now),
        )
    }

    #[test]
    fn happy_path_to_delivered() {
        let mut tracker = DeliveryTracker::new(900_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);

        assert!(tracker.record_send(msg.msg_id, &SendDisposition::Accepted, Timestamp::new(1_100)));

        let report = DeliveryReport {
            msg_id: Some(msg.msg_id),
            phone: msg.phone.clone(),
            body_hash: None,
            delivered: true,
            at: Timestamp::new(3_100),
        };
        assert_eq!(tracker.record_report(&report), Some(msg.msg_id));

        let stats = tracker.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.delivery_rate, 1.0);
        assert_eq!(stats.average_delivery_latency_ms, 2_000.0);
    }

    #[test]
    fn duplicate_sent_ack_is_ignored() {
        let mut tracker = DeliveryTracker::new(900_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);

        assert!(tracker.record_send(msg.msg_id, &SendDisposition::Accepted, Timestamp::new(1_100)));
        assert!(!tracker.record_send(
            msg.msg_id,
            &SendDisposition::Accepted,
            Timestamp::new(1_200)
        ));
        // sent_at keeps the first ack's time
        assert_eq!(
            tracker.get(&msg.msg_id).unwrap().sent_at,
            Some(Timestamp::new(1_100))
        );
    }

    #[test]
    fn timeout_assumes_delivery() {
        let mut tracker = DeliveryTracker::new(10_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);
        tracker.record_send(msg.msg_id, &SendDisposition::Accepted, Timestamp::new(1_000));

        assert!(tracker.sweep_timeouts(Timestamp::new(5_000)).is_empty());
        let flipped = tracker.sweep_timeouts(Timestamp::new(11_000));
        assert_eq!(flipped, vec![msg.msg_id]);

        let stats = tracker.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.delivered_assumed, 1);
        assert_eq!(stats.delivery_rate, 1.0);
        // assumed deliveries do not contribute to measured latency
        assert_eq!(stats.average_delivery_latency_ms, 0.0);
    }

    #[test]
    fn late_report_upgrades_assumed_delivery() {
        let mut tracker = DeliveryTracker::new(10_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);
        tracker.record_send(msg.msg_id, &SendDisposition::Accepted, Timestamp::new(1_000));
        tracker.sweep_timeouts(Timestamp::new(20_000));

        let report = DeliveryReport {
            msg_id: Some(msg.msg_id),
            phone: msg.phone.clone(),
            body_hash: None,
            delivered: true,
            at: Timestamp::new(25_000),
        };
        assert_eq!(tracker.record_report(&report), Some(msg.msg_id));
        assert_eq!(
            tracker.get(&msg.msg_id).unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn fallback_correlation_by_phone_hash_and_time() {
        let mut tracker = DeliveryTracker::new(900_000);
        let early = outbound("Hi A", 1_000);
        let late = outbound("Hi A", 1_000);
        tracker.track(&early);
        tracker.track(&late);
        tracker.record_send(early.msg_id, &SendDisposition::Accepted, Timestamp::new(2_000));
        tracker.record_send(late.msg_id, &SendDisposition::Accepted, Timestamp::new(50_000));

        // no echoed id: matches the oldest sent message inside the window
        let report = DeliveryReport {
            msg_id: None,
            phone: early.phone.clone(),
            body_hash: Some(early.body_hash()),
            delivered: true,
            at: Timestamp::new(30_000),
        };
        assert_eq!(tracker.record_report(&report), Some(early.msg_id));

        // wrong body hash: no match
        let report = DeliveryReport {
            msg_id: None,
            phone: early.phone.clone(),
            body_hash: Some(crate::message::body_hash("something else")),
            delivered: true,
            at: Timestamp::new(30_000),
        };
        assert_eq!(tracker.record_report(&report), None);

        // outside the 60 s window: no match
        let report = DeliveryReport {
            msg_id: None,
            phone: late.phone.clone(),
            body_hash: None,
            delivered: true,
            at: Timestamp::new(200_000),
        };
        assert_eq!(tracker.record_report(&report), None);
    }

    #[test]
    fn failed_report_counts_failed() {
        let mut tracker = DeliveryTracker::new(900_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);
        tracker.record_send(msg.msg_id, &SendDisposition::Accepted, Timestamp::new(1_100));

        let report = DeliveryReport {
            msg_id: Some(msg.msg_id),
            phone: msg.phone.clone(),
            body_hash: None,
            delivered: false,
            at: Timestamp::new(2_000),
        };
        tracker.record_report(&report);

        let stats = tracker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn exactly_one_terminal_state() {
        let mut tracker = DeliveryTracker::new(900_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);

        tracker.record_send(
            msg.msg_id,
            &SendDisposition::PermanentFailure {
                code: "E_TRANSPORT_INVALID".into(),
                reason: "unroutable".into(),
            },
            Timestamp::new(1_100),
        );
        // terminal; exhaustion and further dispositions are no-ops
        tracker.record_exhausted(msg.msg_id);
        assert!(!tracker.record_send(
            msg.msg_id,
            &SendDisposition::Accepted,
            Timestamp::new(1_200)
        ));
        assert_eq!(
            tracker.get(&msg.msg_id).unwrap().status,
            MessageStatus::Failed
        );
    }

    #[test]
    fn transient_failure_keeps_message_pending() {
        let mut tracker = DeliveryTracker::new(900_000);
        let msg = outbound("Hi", 1_000);
        tracker.track(&msg);

        tracker.record_send(
            msg.msg_id,
            &SendDisposition::TransientFailure {
                reason: "radio busy".into(),
            },
            Timestamp::new(1_100),
        );
        assert_eq!(tracker.stats().pending, 1);

        // retry succeeds later under the same id
        assert!(tracker.record_send(msg.msg_id, &SendDisposition::Accepted, Timestamp::new(7_000)));
        assert_eq!(tracker.stats().sent, 1);
    }

    #[test]
    fn forget_session_drops_only_terminal_entries() {
        let mut tracker = DeliveryTracker::new(900_000);
        let done = outbound("A", 1_000);
        let inflight = OutboundMessage::new(
            done.session_id,
            1,
            PhoneNumber::parse("+254700000002").unwrap(),
            "B",
            0,
            Timestamp::new(1_000),
        );
        tracker.track(&done);
        tracker.track(&inflight);
        tracker.record_send(done.msg_id, &SendDisposition::Accepted, Timestamp::new(1_100));
        tracker.record_report(&DeliveryReport {
            msg_id: Some(done.msg_id),
            phone: done.phone.clone(),
            body_hash: None,
            delivered: true,
            at: Timestamp::new(1_200),
        });
        tracker.record_send(
            inflight.msg_id,
            &SendDisposition::Accepted,
            Timestamp::new(1_100),
        );

        tracker.forget_session(done.session_id);
        assert!(tracker.get(&done.msg_id).is_none());
        assert!(tracker.get(&inflight.msg_id).is_some());

        // retired entries still count in the cumulative statistics
        let stats = tracker.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.average_delivery_latency_ms, 100.0);
    }
}
