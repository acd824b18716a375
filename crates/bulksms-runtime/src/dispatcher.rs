//! Delivery dispatcher task
//!
//! The single writer of the delivery tracker. It consumes send results from
//! executors and delivery reports from the transport, persists message state
//! transitions, sweeps ack timeouts and publishes statistics at a fixed
//! cadence (broadcast event plus watch snapshot for late subscribers).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use bulksms_core::events::{DispatchEvent, EventSender, StatsSender};
use bulksms_core::message::{MessageStatus, OutboundMessage};
use bulksms_core::tracker::{DeliveryTracker, SendDisposition};
use bulksms_core::transport::DeliveryReport;
use bulksms_core::types::{MessageId, SessionId, TimeSource, Timestamp};
use bulksms_store::SessionStore;

// ----------------------------------------------------------------------------
// Tracker Commands
// ----------------------------------------------------------------------------

/// Executor -> dispatcher protocol
#[derive(Debug)]
pub enum TrackerCommand {
    /// Start tracking a message about to be handed to the transport
    Track(Box<OutboundMessage>),
    /// Synchronous outcome of one send attempt
    SendResult {
        msg_id: MessageId,
        disposition: SendDisposition,
    },
    /// Retry budget spent
    Exhausted { msg_id: MessageId },
    /// Session reached a terminal state; drop its finished entries after the
    /// next snapshot
    SessionDone { session_id: SessionId },
}

pub type TrackerSender = mpsc::UnboundedSender<TrackerCommand>;
pub type TrackerReceiver = mpsc::UnboundedReceiver<TrackerCommand>;

// ----------------------------------------------------------------------------
// Dispatcher Task
// ----------------------------------------------------------------------------

/// Owns the [`DeliveryTracker`] and pumps callbacks into it
pub struct DeliveryDispatcher {
    tracker: DeliveryTracker,
    store: Arc<SessionStore>,
    clock: Arc<dyn TimeSource>,
    commands: TrackerReceiver,
    reports: broadcast::Receiver<DeliveryReport>,
    events: EventSender,
    stats: StatsSender,
    stats_interval: Duration,
    done_sessions: Vec<SessionId>,
}

impl DeliveryDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        delivery_timeout_ms: u64,
        stats_interval_ms: u64,
        store: Arc<SessionStore>,
        clock: Arc<dyn TimeSource>,
        commands: TrackerReceiver,
        reports: broadcast::Receiver<DeliveryReport>,
        events: EventSender,
        stats: StatsSender,
    ) -> Self {
        Self {
            tracker: DeliveryTracker::new(delivery_timeout_ms),
            store,
            clock,
            commands,
            reports,
            events,
            stats,
            stats_interval: Duration::from_millis(stats_interval_ms.max(1)),
            done_sessions: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        debug!("delivery dispatcher starting");
        let mut ticker = tokio::time::interval(self.stats_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break, // all executors and the runtime are gone
                    }
                }
                report = self.reports.recv() => {
                    match report {
                        Ok(report) => self.handle_report(report),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "delivery report stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // transport gone; keep serving stats until the
                            // command channel closes too
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_and_publish();
                }
            }
        }

        // final snapshot so consumers see the end state
        self.sweep_and_publish();
        debug!("delivery dispatcher stopped");
    }

    fn handle_command(&mut self, command: TrackerCommand) {
        let now = self.clock.now();
        match command {
            TrackerCommand::Track(msg) => {
                self.tracker.track(&msg);
            }
            TrackerCommand::SendResult {
                msg_id,
                disposition,
            } => {
                if self.tracker.record_send(msg_id, &disposition, now)
                    && disposition == SendDisposition::Accepted
                {
                    // executor persists failure rows itself; the dispatcher
                    // owns the SENT transition
                    self.persist_status(msg_id, MessageStatus::Sent, Some(now), None);
                }
            }
            TrackerCommand::Exhausted { msg_id } => {
                self.tracker.record_exhausted(msg_id);
            }
            TrackerCommand::SessionDone { session_id } => {
                self.done_sessions.push(session_id);
            }
        }
    }

    fn handle_report(&mut self, report: DeliveryReport) {
        let Some(msg_id) = self.tracker.record_report(&report) else {
            debug!(phone = %report.phone, "uncorrelated delivery report dropped");
            return;
        };
        let status = if report.delivered {
            MessageStatus::Delivered
        } else {
            MessageStatus::Failed
        };
        self.persist_status(msg_id, status, None, report.delivered.then_some(report.at));
    }

    fn sweep_and_publish(&mut self) {
        let now = self.clock.now();
        for msg_id in self.tracker.sweep_timeouts(now) {
            self.persist_status(msg_id, MessageStatus::DeliveredAssumed, None, Some(now));
        }

        let snapshot = self.tracker.stats();
        let _ = self.stats.send(snapshot);
        let _ = self.events.send(DispatchEvent::Statistics(snapshot));

        for session_id in self.done_sessions.drain(..) {
            self.tracker.forget_session(session_id);
        }
    }

    fn persist_status(
        &self,
        msg_id: MessageId,
        status: MessageStatus,
        sent_at: Option<Timestamp>,
        delivered_at: Option<Timestamp>,
    ) {
        if let Err(err) = self
            .store
            .update_message_status(msg_id, status, sent_at, delivered_at)
        {
            // delivery bookkeeping must not kill the dispatcher; surface and
            // carry on, the tracker still has the in-memory truth
            warn!(%msg_id, ?status, error = %err, "failed to persist message status");
            let _ = self.events.send(DispatchEvent::Error {
                session_id: None,
                code: "E_STORAGE_WRITE".to_string(),
                message: err.to_string(),
            });
        }
    }
}
