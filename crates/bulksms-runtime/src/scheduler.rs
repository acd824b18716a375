//! Campaign scheduler
//!
//! Durable delayed starts: fire times persist in the store, an in-memory
//! min-heap mirrors them, and a single timer task wakes at the earliest due
//! time. Sessions whose fire time passed while the process was down fire
//! immediately on startup.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bulksms_core::types::{SessionId, TimeSource};
use bulksms_store::SessionStore;

/// Idle wake-up when nothing is scheduled
const IDLE_POLL: Duration = Duration::from_secs(3_600);

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Runtime -> scheduler protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Add (or move) a fire time for a session
    Arm {
        session_id: SessionId,
        fire_at_ms: u64,
    },
    /// Cancel a pending fire
    Disarm { session_id: SessionId },
}

pub type SchedulerSender = mpsc::UnboundedSender<SchedulerCommand>;
pub type SchedulerReceiver = mpsc::UnboundedReceiver<SchedulerCommand>;

// ----------------------------------------------------------------------------
// Scheduler Task
// ----------------------------------------------------------------------------

/// Owns the schedule heap and emits due session ids
pub struct Scheduler {
    store: Arc<SessionStore>,
    clock: Arc<dyn TimeSource>,
    commands: SchedulerReceiver,
    due: mpsc::UnboundedSender<SessionId>,
    heap: BinaryHeap<Reverse<(u64, SessionId)>>,
    disarmed: HashSet<SessionId>,
}

impl Scheduler {
    pub fn new(
        store: Arc<SessionStore>,
        clock: Arc<dyn TimeSource>,
        commands: SchedulerReceiver,
        due: mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        Self {
            store,
            clock,
            commands,
            due,
            heap: BinaryHeap::new(),
            disarmed: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        // startup recovery: reload persisted schedules; anything already due
        // (missed while the process was down) fires on the first sweep
        match self.store.all_schedules() {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(count = entries.len(), "recovered persisted schedules");
                }
                for entry in entries {
                    self.heap
                        .push(Reverse((entry.fire_at.as_millis(), entry.session_id)));
                }
            }
            Err(err) => warn!(error = %err, "could not recover schedules"),
        }

        loop {
            self.fire_due();

            let sleep_for = match self.heap.peek() {
                Some(Reverse((fire_at_ms, _))) => {
                    let now = self.clock.now().as_millis();
                    Duration::from_millis(fire_at_ms.saturating_sub(now).max(10))
                }
                None => IDLE_POLL,
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(SchedulerCommand::Arm { session_id, fire_at_ms }) => {
                            debug!(%session_id, fire_at_ms, "schedule armed");
                            self.disarmed.remove(&session_id);
                            self.heap.push(Reverse((fire_at_ms, session_id)));
                        }
                        Some(SchedulerCommand::Disarm { session_id }) => {
                            debug!(%session_id, "schedule disarmed");
                            self.disarmed.insert(session_id);
                        }
                        None => break, // runtime is shutting down
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        debug!("scheduler stopped");
    }

    /// Pop every entry at or past its fire time
    fn fire_due(&mut self) {
        let now = self.clock.now().as_millis();
        while let Some(Reverse((fire_at_ms, session_id))) = self.heap.peek().copied() {
            if fire_at_ms > now {
                break;
            }
            self.heap.pop();
            if self.disarmed.remove(&session_id) {
                continue;
            }
            if let Err(err) = self.store.remove_schedule(session_id) {
                warn!(%session_id, error = %err, "could not clear fired schedule");
            }
            info!(%session_id, fire_at_ms, "scheduled campaign due");
            if self.due.send(session_id).is_err() {
                return; // nobody is listening anymore
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
