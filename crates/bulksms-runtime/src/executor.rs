//! Campaign executor
//!
//! One executor task owns one session (lease-enforced) and pumps its
//! recipients through compliance, rendering, rate-limit admission and the
//! transport, feeding results to the delivery dispatcher and the retry
//! queue. Progress is checkpointed in batches; pause and stop are observed
//! at every suspension point.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use bulksms_core::compliance::{ComplianceGate, ComplianceVerdict};
use bulksms_core::config::DispatchConfig;
use bulksms_core::errors::{DispatchError, Result, StorageError};
use bulksms_core::events::{DispatchEvent, EventSender, ProgressSnapshot};
use bulksms_core::message::OutboundMessage;
use bulksms_core::rate_limiter::{Admission, RateLimiter};
use bulksms_core::retry;
use bulksms_core::session::{CampaignSession, ProcessingStatus};
use bulksms_core::template::TemplateRenderer;
use bulksms_core::tracker::SendDisposition;
use bulksms_core::transport::{OutboundSms, Transport};
use bulksms_core::types::{PhoneNumber, SessionId, TimeSource, Timestamp};
use bulksms_store::SessionStore;

use crate::control::{self, sleep_cancellable, ControlReceiver, ControlSignal};
use crate::dispatcher::{TrackerCommand, TrackerSender};

// ----------------------------------------------------------------------------
// Loop Bookkeeping
// ----------------------------------------------------------------------------

/// Why the pump loop ended
enum LoopExit {
    Completed,
    Paused,
    Stopped,
}

impl LoopExit {
    fn of(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Pause => LoopExit::Paused,
            _ => LoopExit::Stopped,
        }
    }
}

/// How one transport handoff concluded
enum SendOutcome {
    Accepted,
    Transient(String),
    Permanent { code: &'static str, reason: String },
}

/// Mutable cadence state threaded through the pump loop
struct Cadence {
    dirty: u64,
    last_checkpoint: Instant,
    last_progress: Option<Instant>,
    last_send: Option<Instant>,
}

impl Cadence {
    fn new() -> Self {
        Self {
            dirty: 0,
            last_checkpoint: Instant::now(),
            last_progress: None,
            last_send: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Campaign Executor
// ----------------------------------------------------------------------------

/// Drives one campaign session to a terminal or resumable state
pub struct CampaignExecutor {
    session_id: SessionId,
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    limiter: Arc<Mutex<RateLimiter>>,
    gate: ComplianceGate,
    config: DispatchConfig,
    clock: Arc<dyn TimeSource>,
    events: EventSender,
    tracker: TrackerSender,
    owner_id: String,
    control: ControlReceiver,
}

impl CampaignExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        limiter: Arc<Mutex<RateLimiter>>,
        gate: ComplianceGate,
        config: DispatchConfig,
        clock: Arc<dyn TimeSource>,
        events: EventSender,
        tracker: TrackerSender,
        owner_id: String,
        control: ControlReceiver,
    ) -> Self {
        Self {
            session_id,
            store,
            transport,
            limiter,
            gate,
            config,
            clock,
            events,
            tracker,
            owner_id,
            control,
        }
    }

    /// Run the session to its next terminal or resumable state
    pub async fn run(mut self) -> Result<ProcessingStatus> {
        let mut session = self.store.load(self.session_id)?;
        TemplateRenderer::validate(&session.template)
            .map_err(|err| DispatchError::invalid_input(format!("template: {err}")))?;

        let now = self.clock.now();
        if !self
            .store
            .acquire_lease(self.session_id, &self.owner_id, self.config.lease_ttl_ms, now)?
        {
            return Err(StorageError::LeaseHeld {
                session_id: self.session_id,
            }
            .into());
        }

        let old_status = session.processing_status;
        session.transition_to(ProcessingStatus::Sending)?;
        session.updated_at = now;
        self.store.save(&session)?;
        self.emit_state_change(old_status, ProcessingStatus::Sending);
        info!(session_id = %self.session_id, recipients = session.total_recipients(), "campaign sending");

        let exit = self.pump(&mut session).await;
        match exit {
            Ok(LoopExit::Completed) => self.finish(session, ProcessingStatus::Completed).await,
            Ok(LoopExit::Paused) => self.finish(session, ProcessingStatus::Paused).await,
            Ok(LoopExit::Stopped) => self.finish(session, ProcessingStatus::Stopped).await,
            Err(err) => {
                self.fail(session, &err);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Main Loop
    // ------------------------------------------------------------------

    async fn pump(&mut self, session: &mut CampaignSession) -> Result<LoopExit> {
        let total = session.total_recipients();
        let speed = if session.send_speed > 0 {
            session.send_speed
        } else {
            self.config.send_speed_per_hour
        };
        let send_interval = DispatchConfig::send_interval(speed);
        let mut rng = StdRng::from_entropy();
        let mut missing_reported: HashSet<String> = HashSet::new();
        let mut cadence = Cadence::new();
        let mut grace_deadline: Option<Timestamp> = None;

        loop {
            // (a) cooperative cancellation check
            match control::current(&self.control) {
                ControlSignal::Run => {}
                signal => return Ok(LoopExit::of(signal)),
            }

            // (b) drain due retries; they jump the work stream
            let due = self.store.drain_due(
                session.session_id,
                self.clock.now(),
                self.config.retry_claim_ttl_ms,
            )?;
            for msg in due {
                match control::current(&self.control) {
                    ControlSignal::Run => {}
                    signal => {
                        self.requeue(msg)?;
                        return Ok(LoopExit::of(signal));
                    }
                }
                let signal = self
                    .attempt_retry(session, msg, send_interval, &mut rng, &mut cadence)
                    .await?;
                cadence.dirty += 1;
                self.checkpoint(session, &mut cadence, false)?;
                self.emit_progress(session, &mut cadence, false);
                if signal != ControlSignal::Run {
                    return Ok(LoopExit::of(signal));
                }
            }

            // end of list: keep draining retries inside the grace window
            if session.last_processed_index >= total {
                let pending = self.store.pending_retry_count(session.session_id)?;
                if pending == 0 {
                    return Ok(LoopExit::Completed);
                }
                // progress must be durable before a potentially long wait
                self.flush(session, &mut cadence)?;
                let deadline = *grace_deadline
                    .get_or_insert_with(|| self.clock.now().add_millis(self.config.grace_window_ms));
                if self.clock.now() >= deadline {
                    self.exhaust_remaining(session)?;
                    return Ok(LoopExit::Completed);
                }
                let wake = self
                    .store
                    .next_retry_at(session.session_id)?
                    .unwrap_or(deadline)
                    .min(deadline);
                let wait = Duration::from_millis(wake.millis_since(self.clock.now()).max(10));
                match sleep_cancellable(wait, &mut self.control).await {
                    ControlSignal::Run => continue,
                    signal => return Ok(LoopExit::of(signal)),
                }
            }

            // (c) next fresh recipient
            let index = session.last_processed_index;
            let recipient = session.recipients[index as usize].clone();

            // (d) compliance gate
            let phone = match self.gate.check(&recipient.phone, session.campaign_type) {
                ComplianceVerdict::Compliant(phone) => phone,
                verdict => {
                    debug!(session_id = %self.session_id, index,
                           reason = verdict.skip_reason(), "recipient skipped");
                    session.skipped_count += 1;
                    session.last_processed_index += 1;
                    cadence.dirty += 1;
                    self.checkpoint(session, &mut cadence, false)?;
                    self.emit_progress(session, &mut cadence, false);
                    continue;
                }
            };

            // (e) render the body
            let rendered = TemplateRenderer::render(&session.template, &recipient);
            for variable in &rendered.missing {
                if missing_reported.insert(variable.clone()) {
                    let _ = self.events.send(DispatchEvent::MissingVariable {
                        session_id: self.session_id,
                        variable: variable.clone(),
                    });
                }
            }

            // pacing toward the configured messages-per-hour target
            if let Some(signal) = self.pace(send_interval, &cadence).await {
                return Ok(LoopExit::of(signal));
            }

            // (f) rate-limiter admission
            match self.admit(&phone, session) {
                Admission::Admitted => {}
                Admission::Defer {
                    retry_after,
                    reason,
                } => {
                    debug!(session_id = %self.session_id, ?reason,
                           defer_ms = retry_after.as_millis() as u64, "send deferred");
                    self.flush(session, &mut cadence)?;
                    match sleep_cancellable(retry_after, &mut self.control).await {
                        ControlSignal::Run => continue, // loop back to (a)
                        signal => return Ok(LoopExit::of(signal)),
                    }
                }
                Admission::Reject { reason } => {
                    let mut msg = OutboundMessage::new(
                        session.session_id,
                        index,
                        phone,
                        rendered.body,
                        session.sim_slot,
                        self.clock.now(),
                    );
                    msg.mark_failed("E_RATE_REJECT_PREFIX", &reason);
                    self.store.insert_message(&msg)?;
                    warn!(session_id = %self.session_id, index, %reason, "destination rejected");
                    session.skipped_count += 1;
                    session.last_processed_index += 1;
                    cadence.dirty += 1;
                    self.checkpoint(session, &mut cadence, false)?;
                    self.emit_progress(session, &mut cadence, false);
                    continue;
                }
            }

            // (g) hand off to the transport
            let msg = OutboundMessage::new(
                session.session_id,
                index,
                phone.clone(),
                rendered.body,
                session.sim_slot,
                self.clock.now(),
            );
            self.store.insert_message(&msg)?;
            self.track(TrackerCommand::Track(Box::new(msg.clone())));
            self.record_admitted(&phone, session);
            cadence.last_send = Some(Instant::now());

            // (h) apply the synchronous outcome
            match self.send_via_transport(&msg).await {
                SendOutcome::Accepted => {
                    session.sent_count += 1;
                    self.track(TrackerCommand::SendResult {
                        msg_id: msg.msg_id,
                        disposition: SendDisposition::Accepted,
                    });
                }
                SendOutcome::Transient(reason) => {
                    // counted failed until a retry succeeds, which keeps the
                    // counter invariant intact while the index moves on
                    session.failed_count += 1;
                    self.queue_retry(msg, reason, &mut rng)?;
                }
                SendOutcome::Permanent { code, reason } => {
                    session.failed_count += 1;
                    let mut msg = msg;
                    msg.mark_failed(code, &reason);
                    self.store.update_message(&msg)?;
                    self.track(TrackerCommand::SendResult {
                        msg_id: msg.msg_id,
                        disposition: SendDisposition::PermanentFailure {
                            code: code.to_string(),
                            reason,
                        },
                    });
                }
            }

            session.last_processed_index += 1;
            cadence.dirty += 1;

            // (i) periodic checkpoint and progress
            self.checkpoint(session, &mut cadence, false)?;
            self.emit_progress(session, &mut cadence, false);
        }
    }

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------

    /// Re-attempt one claimed retry; compliance is not re-evaluated, the
    /// limiter still is.
    async fn attempt_retry(
        &mut self,
        session: &mut CampaignSession,
        mut msg: OutboundMessage,
        send_interval: Duration,
        rng: &mut StdRng,
        cadence: &mut Cadence,
    ) -> Result<ControlSignal> {
        if let Some(signal) = self.pace(send_interval, cadence).await {
            self.requeue(msg)?;
            return Ok(signal);
        }

        loop {
            match self.admit(&msg.phone, session) {
                Admission::Admitted => break,
                Admission::Defer { retry_after, .. } => {
                    self.flush(session, cadence)?;
                    match sleep_cancellable(retry_after, &mut self.control).await {
                        ControlSignal::Run => continue,
                        signal => {
                            self.requeue(msg)?;
                            return Ok(signal);
                        }
                    }
                }
                Admission::Reject { reason } => {
                    msg.mark_failed("E_RATE_REJECT_PREFIX", &reason);
                    self.store.update_message(&msg)?;
                    self.track(TrackerCommand::SendResult {
                        msg_id: msg.msg_id,
                        disposition: SendDisposition::PermanentFailure {
                            code: "E_RATE_REJECT_PREFIX".to_string(),
                            reason,
                        },
                    });
                    return Ok(ControlSignal::Run);
                }
            }
        }

        let phone = msg.phone.clone();
        // idempotent re-track: after a restart the dispatcher has no entry
        // for a recovered retry, and an untracked SENT would never persist
        self.track(TrackerCommand::Track(Box::new(msg.clone())));
        self.record_admitted(&phone, session);
        cadence.last_send = Some(Instant::now());

        match self.send_via_transport(&msg).await {
            SendOutcome::Accepted => {
                debug!(session_id = %self.session_id, msg_id = %msg.msg_id,
                       attempt = msg.retry_count + 1, "retry succeeded");
                // the provisional failure becomes a send
                session.sent_count += 1;
                session.failed_count = session.failed_count.saturating_sub(1);
                self.track(TrackerCommand::SendResult {
                    msg_id: msg.msg_id,
                    disposition: SendDisposition::Accepted,
                });
            }
            SendOutcome::Transient(reason) => {
                self.queue_retry(msg, reason, rng)?;
            }
            SendOutcome::Permanent { code, reason } => {
                msg.mark_failed(code, &reason);
                self.store.update_message(&msg)?;
                self.track(TrackerCommand::SendResult {
                    msg_id: msg.msg_id,
                    disposition: SendDisposition::PermanentFailure {
                        code: code.to_string(),
                        reason,
                    },
                });
            }
        }
        Ok(ControlSignal::Run)
    }

    /// Schedule the next retry or exhaust the budget
    fn queue_retry(
        &self,
        mut msg: OutboundMessage,
        reason: String,
        rng: &mut StdRng,
    ) -> Result<()> {
        let now = self.clock.now();
        match retry::next_retry_at(&self.config.retry, msg.retry_count, now, rng) {
            Some(at) => {
                debug!(session_id = %self.session_id, msg_id = %msg.msg_id,
                       retry_count = msg.retry_count + 1,
                       delay_ms = at.millis_since(now), "transient failure queued for retry");
                msg.mark_pending_retry(at, &reason);
                self.store.update_message(&msg)?;
                self.track(TrackerCommand::SendResult {
                    msg_id: msg.msg_id,
                    disposition: SendDisposition::TransientFailure { reason },
                });
            }
            None => {
                warn!(session_id = %self.session_id, msg_id = %msg.msg_id,
                      attempts = self.config.retry.max_attempts, "retry budget exhausted");
                msg.mark_exhausted("E_RETRY_EXHAUSTED", &reason);
                self.store.update_message(&msg)?;
                self.track(TrackerCommand::Exhausted { msg_id: msg.msg_id });
            }
        }
        Ok(())
    }

    /// Put a claimed-but-unprocessed retry back in the queue without
    /// spending budget (pause/stop interrupted the drain)
    fn requeue(&self, mut msg: OutboundMessage) -> Result<()> {
        msg.status = bulksms_core::message::MessageStatus::PendingRetry;
        msg.next_retry_at = Some(self.clock.now());
        Ok(self.store.update_message(&msg)?)
    }

    /// Grace window expired with retries still queued; they are spent
    fn exhaust_remaining(&self, session: &CampaignSession) -> Result<()> {
        // everything still queued (claimed or not) is due from this vantage
        let leftover = self.store.drain_due(
            session.session_id,
            Timestamp::new(u64::MAX),
            self.config.retry_claim_ttl_ms,
        )?;
        for mut msg in leftover {
            warn!(session_id = %self.session_id, msg_id = %msg.msg_id,
                  "retry still queued at grace-window expiry");
            msg.mark_exhausted("E_RETRY_EXHAUSTED", "grace window expired");
            self.store.update_message(&msg)?;
            self.track(TrackerCommand::Exhausted { msg_id: msg.msg_id });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission & Transport
    // ------------------------------------------------------------------

    fn admit(&self, phone: &PhoneNumber, session: &CampaignSession) -> Admission {
        let now = self.clock.now();
        let local_now = chrono::Local::now().time();
        self.limiter
            .lock()
            .expect("limiter lock")
            .admit(phone, session.campaign_type, now, local_now)
    }

    fn record_admitted(&self, phone: &PhoneNumber, session: &CampaignSession) {
        self.limiter
            .lock()
            .expect("limiter lock")
            .record_send(phone, session.campaign_type, self.clock.now());
    }

    /// Space sends toward the configured messages-per-hour target
    async fn pace(&mut self, send_interval: Duration, cadence: &Cadence) -> Option<ControlSignal> {
        let last = cadence.last_send?;
        let elapsed = last.elapsed();
        if elapsed >= send_interval {
            return None;
        }
        match sleep_cancellable(send_interval - elapsed, &mut self.control).await {
            ControlSignal::Run => None,
            signal => Some(signal),
        }
    }

    async fn send_via_transport(&self, msg: &OutboundMessage) -> SendOutcome {
        let sms = OutboundSms {
            msg_id: msg.msg_id,
            phone: msg.phone.clone(),
            body: msg.body.clone(),
            sim_slot: msg.sim_slot,
        };
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        // An in-flight send is allowed to complete; stop is observed at the
        // next suspension point, bounded by the ack timeout.
        match tokio::time::timeout(ack_timeout, self.transport.send(&sms)).await {
            Ok(Ok(_ack)) => SendOutcome::Accepted,
            Ok(Err(err)) if err.is_transient() => SendOutcome::Transient(err.to_string()),
            Ok(Err(err)) => SendOutcome::Permanent {
                code: DispatchError::Transport(err.clone()).error_code(),
                reason: err.to_string(),
            },
            Err(_) => SendOutcome::Transient(format!(
                "no transport ack within {}ms",
                self.config.ack_timeout_ms
            )),
        }
    }

    // ------------------------------------------------------------------
    // Checkpoints, Events, Exit Paths
    // ------------------------------------------------------------------

    /// Write any batched progress out now (called before long sleeps)
    fn flush(&self, session: &mut CampaignSession, cadence: &mut Cadence) -> Result<()> {
        if cadence.dirty > 0 {
            self.checkpoint(session, cadence, true)?;
        }
        Ok(())
    }

    /// Durable progress write, batched by count and wall time
    fn checkpoint(
        &self,
        session: &mut CampaignSession,
        cadence: &mut Cadence,
        force: bool,
    ) -> Result<()> {
        if !force
            && cadence.dirty < self.config.checkpoint_every
            && cadence.last_checkpoint.elapsed()
                < Duration::from_millis(self.config.checkpoint_interval_ms)
        {
            return Ok(());
        }
        if cadence.dirty == 0 && !force {
            return Ok(());
        }

        session.validate_counters()?;
        let now = self.clock.now();
        self.store.checkpoint(
            session.session_id,
            &bulksms_core::session::CheckpointPatch::of(session),
            now,
        )?;
        session.updated_at = now;
        // the lease rides along with the checkpoint cadence
        self.store
            .acquire_lease(session.session_id, &self.owner_id, self.config.lease_ttl_ms, now)?;
        cadence.dirty = 0;
        cadence.last_checkpoint = Instant::now();
        Ok(())
    }

    fn emit_progress(&self, session: &CampaignSession, cadence: &mut Cadence, force: bool) {
        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let due = match cadence.last_progress {
            None => true,
            Some(last) => last.elapsed() >= interval,
        };
        if !force && !due {
            return;
        }
        cadence.last_progress = Some(Instant::now());
        let _ = self.events.send(DispatchEvent::Progress(ProgressSnapshot {
            session_id: session.session_id,
            processed: session.last_processed_index,
            total: session.total_recipients(),
            sent: session.sent_count,
            failed: session.failed_count,
            skipped: session.skipped_count,
            percent: session.percent_processed(),
        }));
    }

    fn emit_state_change(&self, old_status: ProcessingStatus, new_status: ProcessingStatus) {
        let _ = self.events.send(DispatchEvent::SessionStateChanged {
            session_id: self.session_id,
            old_status,
            new_status,
        });
    }

    fn track(&self, command: TrackerCommand) {
        if self.tracker.send(command).is_err() {
            warn!(session_id = %self.session_id, "delivery dispatcher unavailable");
        }
    }

    /// Common exit path for completed / paused / stopped
    async fn finish(
        &mut self,
        mut session: CampaignSession,
        status: ProcessingStatus,
    ) -> Result<ProcessingStatus> {
        if status == ProcessingStatus::Stopped {
            let purged = self.store.purge_pending_retries(session.session_id)?;
            if purged > 0 {
                info!(session_id = %self.session_id, purged, "queued retries purged on stop");
            }
        }

        let old_status = session.processing_status;
        session.transition_to(status)?;
        let mut cadence = Cadence::new();
        self.checkpoint(&mut session, &mut cadence, true)?;
        self.emit_progress(&session, &mut cadence, true);
        self.emit_state_change(old_status, status);

        if status.is_terminal() {
            self.track(TrackerCommand::SessionDone {
                session_id: session.session_id,
            });
        }
        self.store.release_lease(session.session_id, &self.owner_id)?;
        info!(session_id = %self.session_id, status = %status,
              sent = session.sent_count, failed = session.failed_count,
              skipped = session.skipped_count, "campaign executor exiting");
        Ok(status)
    }

    /// Error exit: storage trouble pauses the session, anything else fails it
    fn fail(&self, mut session: CampaignSession, err: &DispatchError) {
        let target = match err {
            DispatchError::Storage(_) => ProcessingStatus::Paused,
            _ => ProcessingStatus::Failed,
        };
        let old_status = session.processing_status;
        if session.transition_to(target).is_ok() {
            session.updated_at = self.clock.now();
            if let Err(save_err) = self.store.save(&session) {
                warn!(session_id = %self.session_id, error = %save_err,
                      "could not persist error state");
            }
            self.emit_state_change(old_status, target);
        }
        let _ = self.events.send(DispatchEvent::Error {
            session_id: Some(self.session_id),
            code: err.error_code().to_string(),
            message: err.to_string(),
        });
        let _ = self.store.release_lease(self.session_id, &self.owner_id);
    }
}
