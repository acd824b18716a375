//! Engine wiring and control surface
//!
//! [`DispatchRuntime`] owns the long-running tasks (delivery dispatcher,
//! scheduler, due-session listener), the process-global rate limiter and the
//! per-session executor handles. All external control — start, schedule,
//! pause, resume, stop, opt-outs, subscriptions — goes through it.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bulksms_core::compliance::{
    is_stop_keyword, ComplianceGate, ConsentView, MemoryConsents, OptOutRecord, OptOutView,
};
use bulksms_core::config::DispatchConfig;
use bulksms_core::errors::{DispatchError, Result, SessionError};
use bulksms_core::events::{
    create_event_channel, create_stats_channel, DispatchEvent, EventReceiver, EventSender,
    StatsReceiver,
};
use bulksms_core::rate_limiter::RateLimiter;
use bulksms_core::session::{CampaignSession, ProcessingStatus};
use bulksms_core::template::TemplateRenderer;
use bulksms_core::transport::Transport;
use bulksms_core::types::{PhoneNumber, SessionId, SystemTimeSource, TimeSource, Timestamp};
use bulksms_store::SessionStore;

use crate::control::{control_channel, ControlSender, ControlSignal};
use crate::dispatcher::{DeliveryDispatcher, TrackerSender};
use crate::executor::CampaignExecutor;
use crate::scheduler::{Scheduler, SchedulerCommand, SchedulerSender};

// ----------------------------------------------------------------------------
// Session Handles
// ----------------------------------------------------------------------------

struct SessionHandle {
    control: ControlSender,
    join: Option<JoinHandle<()>>,
}

// ----------------------------------------------------------------------------
// Runtime Internals
// ----------------------------------------------------------------------------

struct RuntimeInner {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    limiter: Arc<Mutex<RateLimiter>>,
    consents: Arc<dyn ConsentView>,
    config: DispatchConfig,
    clock: Arc<dyn TimeSource>,
    events: EventSender,
    stats: StatsReceiver,
    tracker_tx: TrackerSender,
    owner_id: String,
    sessions: DashMap<SessionId, SessionHandle>,
    session_permits: Arc<Semaphore>,
}

/// Validate and launch one executor task for a session
fn start_session(inner: Arc<RuntimeInner>, session_id: SessionId) -> Result<()> {
    if inner.sessions.contains_key(&session_id) {
        return Err(SessionError::AlreadyRunning(session_id).into());
    }

    // InvalidInput is refused here, synchronously, before any task spawns
    let session = inner.store.load(session_id)?;
    TemplateRenderer::validate(&session.template)
        .map_err(|err| DispatchError::invalid_input(format!("template: {err}")))?;
    match session.processing_status {
        ProcessingStatus::Ready | ProcessingStatus::Scheduled | ProcessingStatus::Paused => {}
        // a crash leaves the durable status at `sending`; the lease arbitrates
        ProcessingStatus::Sending => {}
        other => {
            return Err(DispatchError::invalid_input(format!(
                "cannot start a session in status {other}"
            )))
        }
    }

    let (control_tx, control_rx) = control_channel();
    inner.sessions.insert(
        session_id,
        SessionHandle {
            control: control_tx,
            join: None,
        },
    );

    let task_inner = inner.clone();
    let join = tokio::spawn(async move {
        // the radio is shared; sessions queue on the permit
        let Ok(_permit) = task_inner.session_permits.clone().acquire_owned().await else {
            task_inner.sessions.remove(&session_id);
            return;
        };

        let optouts: Arc<dyn OptOutView> = task_inner.store.clone();
        let gate = ComplianceGate::new(
            optouts,
            task_inner.consents.clone(),
            task_inner.config.consent_required_for_marketing,
        );
        let executor = CampaignExecutor::new(
            session_id,
            task_inner.store.clone(),
            task_inner.transport.clone(),
            task_inner.limiter.clone(),
            gate,
            task_inner.config.clone(),
            task_inner.clock.clone(),
            task_inner.events.clone(),
            task_inner.tracker_tx.clone(),
            task_inner.owner_id.clone(),
            control_rx,
        );

        match std::panic::AssertUnwindSafe(executor.run()).catch_unwind().await {
            Ok(Ok(status)) => {
                debug!(%session_id, %status, "executor finished");
            }
            Ok(Err(err)) => {
                // the executor already persisted and emitted its error state
                warn!(%session_id, error = %err, code = err.error_code(), "executor errored");
            }
            Err(panic) => {
                let diagnostic = panic_message(panic.as_ref());
                warn!(%session_id, %diagnostic, "executor panicked");
                persist_panic(&task_inner, session_id);
                let _ = task_inner.events.send(DispatchEvent::Error {
                    session_id: Some(session_id),
                    code: "E_FATAL_PANIC".to_string(),
                    message: diagnostic,
                });
            }
        }
        task_inner.sessions.remove(&session_id);
    });

    if let Some(mut handle) = inner.sessions.get_mut(&session_id) {
        handle.join = Some(join);
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}

/// Best-effort: park a panicked session in `Failed` with its progress intact
fn persist_panic(inner: &RuntimeInner, session_id: SessionId) {
    let result = inner.store.load(session_id).and_then(|mut session| {
        if session.transition_to(ProcessingStatus::Failed).is_ok() {
            session.updated_at = inner.clock.now();
            inner.store.save(&session)?;
        }
        Ok(())
    });
    if let Err(err) = result {
        warn!(%session_id, error = %err, "could not persist panic state");
    }
    let _ = inner.store.release_lease(session_id, &inner.owner_id);
}

// ----------------------------------------------------------------------------
// Dispatch Runtime
// ----------------------------------------------------------------------------

/// The assembled engine
pub struct DispatchRuntime {
    inner: Arc<RuntimeInner>,
    scheduler_tx: SchedulerSender,
    dispatcher_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
    due_listener_handle: JoinHandle<()>,
}

impl DispatchRuntime {
    /// Wire the engine with default consent view and wall clock
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> Result<Self> {
        Self::with_parts(
            store,
            transport,
            config,
            Arc::new(MemoryConsents::new()),
            Arc::new(SystemTimeSource::new()),
        )
    }

    /// Wire the engine with injected collaborators (tests, embedders)
    pub fn with_parts(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
        consents: Arc<dyn ConsentView>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(DispatchError::config_error)?;

        let (events_tx, _events_rx) = create_event_channel(&config.channels);
        let (stats_tx, stats_rx) = create_stats_channel();
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();

        let limiter = Arc::new(Mutex::new(RateLimiter::new(
            config.limits.clone(),
            config.blocked_prefixes.clone(),
        )));

        let dispatcher = DeliveryDispatcher::new(
            config.delivery_timeout_ms,
            config.stats_interval_ms,
            store.clone(),
            clock.clone(),
            tracker_rx,
            transport.delivery_reports(),
            events_tx.clone(),
            stats_tx,
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (due_tx, mut due_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(store.clone(), clock.clone(), scheduler_rx, due_tx);
        let scheduler_handle = tokio::spawn(scheduler.run());

        let inner = Arc::new(RuntimeInner {
            store,
            transport,
            limiter,
            consents,
            config: config.clone(),
            clock,
            events: events_tx.clone(),
            stats: stats_rx,
            tracker_tx,
            owner_id: format!("executor-{}", Uuid::new_v4()),
            sessions: DashMap::new(),
            session_permits: Arc::new(Semaphore::new(config.max_parallel_sessions)),
        });

        // scheduled sessions come due here
        let due_inner = inner.clone();
        let due_listener_handle = tokio::spawn(async move {
            while let Some(session_id) = due_rx.recv().await {
                if let Err(err) = start_session(due_inner.clone(), session_id) {
                    warn!(%session_id, error = %err, "scheduled start failed");
                    let _ = due_inner.events.send(DispatchEvent::Error {
                        session_id: Some(session_id),
                        code: err.error_code().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        });

        info!(owner_id = %inner.owner_id, "dispatch runtime started");
        Ok(Self {
            inner,
            scheduler_tx,
            dispatcher_handle,
            scheduler_handle,
            due_listener_handle,
        })
    }

    // ------------------------------------------------------------------
    // Control Surface
    // ------------------------------------------------------------------

    /// Start sending a ready, scheduled or paused session now
    pub fn start(&self, session_id: SessionId) -> Result<()> {
        start_session(self.inner.clone(), session_id)
    }

    /// Queue a session for a future UTC fire time.
    ///
    /// `timezone` is recorded for display only; all arithmetic is UTC.
    pub fn schedule(
        &self,
        session_id: SessionId,
        fire_at: Timestamp,
        timezone: Option<&str>,
    ) -> Result<()> {
        let mut session = self.inner.store.load(session_id)?;
        let old_status = session.processing_status;
        session.transition_to(ProcessingStatus::Scheduled)?;
        session.scheduled_at = Some(fire_at);
        session.scheduled_tz = timezone.map(str::to_string);
        let now = self.inner.clock.now();
        session.updated_at = now;
        self.inner.store.save(&session)?;
        self.inner
            .store
            .put_schedule(session_id, fire_at, timezone, now)?;
        self.scheduler_tx
            .send(SchedulerCommand::Arm {
                session_id,
                fire_at_ms: fire_at.as_millis(),
            })
            .map_err(|_| DispatchError::channel_error("scheduler is gone"))?;
        let _ = self.inner.events.send(DispatchEvent::SessionStateChanged {
            session_id,
            old_status,
            new_status: ProcessingStatus::Scheduled,
        });
        info!(%session_id, fire_at_ms = fire_at.as_millis(), "campaign scheduled");
        Ok(())
    }

    /// Pause a running session; observed at its next suspension point
    pub fn pause(&self, session_id: SessionId) -> Result<()> {
        let handle = self
            .inner
            .sessions
            .get(&session_id)
            .ok_or(SessionError::NotRunning(session_id))?;
        handle
            .control
            .send(ControlSignal::Pause)
            .map_err(|_| DispatchError::channel_error("executor is gone"))
    }

    /// Resume a paused (or crash-interrupted) session from its checkpoint
    pub fn resume(&self, session_id: SessionId) -> Result<()> {
        let session = self.inner.store.load(session_id)?;
        if !matches!(
            session.processing_status,
            ProcessingStatus::Paused | ProcessingStatus::Sending
        ) {
            return Err(DispatchError::invalid_input(format!(
                "cannot resume a session in status {}",
                session.processing_status
            )));
        }
        start_session(self.inner.clone(), session_id)
    }

    /// Stop a session: running ones exit at the next suspension point and
    /// purge their queued retries; scheduled ones are disarmed back to ready.
    pub fn stop(&self, session_id: SessionId) -> Result<()> {
        if let Some(handle) = self.inner.sessions.get(&session_id) {
            return handle
                .control
                .send(ControlSignal::Stop)
                .map_err(|_| DispatchError::channel_error("executor is gone"));
        }

        let mut session = self.inner.store.load(session_id)?;
        let old_status = session.processing_status;
        match old_status {
            ProcessingStatus::Paused => {
                self.inner.store.purge_pending_retries(session_id)?;
                session.transition_to(ProcessingStatus::Stopped)?;
                session.updated_at = self.inner.clock.now();
                self.inner.store.save(&session)?;
                let _ = self.inner.events.send(DispatchEvent::SessionStateChanged {
                    session_id,
                    old_status,
                    new_status: ProcessingStatus::Stopped,
                });
                Ok(())
            }
            ProcessingStatus::Scheduled => {
                let _ = self
                    .scheduler_tx
                    .send(SchedulerCommand::Disarm { session_id });
                self.inner.store.remove_schedule(session_id)?;
                session.transition_to(ProcessingStatus::Ready)?;
                session.scheduled_at = None;
                session.scheduled_tz = None;
                session.updated_at = self.inner.clock.now();
                self.inner.store.save(&session)?;
                let _ = self.inner.events.send(DispatchEvent::SessionStateChanged {
                    session_id,
                    old_status,
                    new_status: ProcessingStatus::Ready,
                });
                Ok(())
            }
            _ => Err(SessionError::NotRunning(session_id).into()),
        }
    }

    /// Record an explicit opt-out for a phone
    pub fn add_opt_out(&self, phone: &str, reason: &str) -> Result<()> {
        let phone = PhoneNumber::parse(phone)?;
        self.inner.store.add_opt_out(&OptOutRecord {
            phone,
            reason: reason.to_string(),
            created_at: self.inner.clock.now(),
        })?;
        Ok(())
    }

    /// Feed an inbound message; a STOP-like keyword opts the sender out.
    ///
    /// Returns whether an opt-out was recorded.
    pub fn record_inbound(&self, from: &str, body: &str) -> Result<bool> {
        if !is_stop_keyword(body) {
            return Ok(false);
        }
        self.add_opt_out(from, "STOP keyword reply")?;
        info!(phone = from, "opt-out recorded from inbound keyword");
        Ok(true)
    }

    /// Delete exhausted message rows; returns how many were removed
    pub fn clear_exhausted(&self) -> Result<u64> {
        Ok(self.inner.store.clear_exhausted()?)
    }

    /// Subscribe to the engine event stream
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Watch channel holding the latest delivery statistics snapshot
    pub fn statistics(&self) -> StatsReceiver {
        self.inner.stats.clone()
    }

    /// Load a session's current durable state
    pub fn session(&self, session_id: SessionId) -> Result<CampaignSession> {
        Ok(self.inner.store.load(session_id)?)
    }

    /// The single sending-or-paused session, if any (resume prompt helper)
    pub fn active_session(&self) -> Result<Option<CampaignSession>> {
        Ok(self.inner.store.load_active()?)
    }

    /// Whether an executor task currently owns the session
    pub fn is_running(&self, session_id: SessionId) -> bool {
        self.inner.sessions.contains_key(&session_id)
    }

    /// Wait until the session's executor task has exited
    pub async fn wait_for_session(&self, session_id: SessionId) {
        while self.inner.sessions.contains_key(&session_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop everything; in-flight sessions exit at their next suspension point
    pub async fn shutdown(self) {
        for entry in self.inner.sessions.iter() {
            let _ = entry.value().control.send(ControlSignal::Stop);
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.inner.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for entry in self.inner.sessions.iter() {
            if let Some(join) = &entry.value().join {
                join.abort();
            }
        }
        self.due_listener_handle.abort();
        self.scheduler_handle.abort();
        self.dispatcher_handle.abort();
        info!("dispatch runtime stopped");
    }
}

impl Drop for DispatchRuntime {
    fn drop(&mut self) {
        self.due_listener_handle.abort();
        self.scheduler_handle.abort();
        self.dispatcher_handle.abort();
        for entry in self.inner.sessions.iter() {
            if let Some(join) = &entry.value().join {
                join.abort();
            }
        }
    }
}
