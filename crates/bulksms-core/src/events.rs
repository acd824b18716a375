//! Outbound event stream
//!
//! Typed publish-subscribe protocol between the engine and its consumers
//! (UI, logs, tests). Events go over a broadcast channel; the latest
//! statistics snapshot is additionally mirrored into a watch channel so a
//! new subscriber sees current numbers immediately.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::config::ChannelConfig;
use crate::session::ProcessingStatus;
use crate::tracker::DeliveryStats;
use crate::types::SessionId;

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Progress of one sending session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: SessionId,
    pub processed: u64,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub percent: f64,
}

/// Everything the engine tells the outside world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchEvent {
    /// Emitted at a bounded cadence while a session is sending
    Progress(ProgressSnapshot),
    /// Delivery statistics snapshot
    Statistics(DeliveryStats),
    /// A session moved along its lifecycle
    SessionStateChanged {
        session_id: SessionId,
        old_status: ProcessingStatus,
        new_status: ProcessingStatus,
    },
    /// Surfaced error with a stable internal code
    Error {
        session_id: Option<SessionId>,
        code: String,
        message: String,
    },
    /// A template placeholder had no value; reported once per session
    MissingVariable {
        session_id: SessionId,
        variable: String,
    },
}

// ----------------------------------------------------------------------------
// Channel Types
// ----------------------------------------------------------------------------

pub type EventSender = broadcast::Sender<DispatchEvent>;
pub type EventReceiver = broadcast::Receiver<DispatchEvent>;
pub type StatsSender = watch::Sender<DeliveryStats>;
pub type StatsReceiver = watch::Receiver<DeliveryStats>;

/// Create the broadcast event channel
///
/// Receivers come from `sender.subscribe()`; slow consumers lag rather than
/// block the engine.
pub fn create_event_channel(config: &ChannelConfig) -> (EventSender, EventReceiver) {
    broadcast::channel(config.event_buffer_size)
}

/// Create the statistics watch channel seeded with an empty snapshot
pub fn create_stats_channel() -> (StatsSender, StatsReceiver) {
    watch::channel(DeliveryStats::default())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_fans_out_to_all_subscribers() {
        let (tx, mut rx1) = create_event_channel(&ChannelConfig::default());
        let mut rx2 = tx.subscribe();

        let event = DispatchEvent::Error {
            session_id: None,
            code: "E_CONFIG".into(),
            message: "bad".into(),
        };
        tx.send(event.clone()).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn stats_watch_delivers_latest_on_subscribe() {
        let (tx, _rx) = create_stats_channel();
        tx.send(DeliveryStats {
            total: 7,
            ..Default::default()
        })
        .unwrap();

        // a late subscriber still sees the current snapshot
        let rx = tx.subscribe();
        assert_eq!(rx.borrow().total, 7);
    }
}
