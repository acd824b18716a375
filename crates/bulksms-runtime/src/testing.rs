//! Test transport
//!
//! A scriptable in-memory [`Transport`] for integration tests and demos:
//! per-phone outcome scripts, recorded sends, optional automatic delivery
//! reports and manual report injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;

use bulksms_core::errors::TransportError;
use bulksms_core::transport::{DeliveryReport, OutboundSms, SendAck, Transport};
use bulksms_core::types::Timestamp;

/// One scripted send outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Radio accepts the message
    Ok,
    /// Transient failure (radio busy)
    Transient,
    /// Permanent failure, invalid destination
    PermanentInvalid,
    /// Permanent failure, blocked destination
    PermanentBlocked,
    /// Never acknowledge; the caller's ack timeout fires
    Hang,
}

/// Scriptable in-memory transport
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    sends: Mutex<Vec<OutboundSms>>,
    reports: broadcast::Sender<DeliveryReport>,
    /// Emit a positive delivery report shortly after each accepted send
    auto_deliver: AtomicBool,
    report_delay: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (reports, _) = broadcast::channel(256);
        Self {
            scripts: Mutex::new(HashMap::new()),
            sends: Mutex::new(Vec::new()),
            reports,
            auto_deliver: AtomicBool::new(true),
            report_delay: Duration::from_millis(10),
        }
    }

    /// Queue outcomes for a phone; unscripted sends succeed
    pub fn script(&self, phone: &str, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.scripts
            .lock()
            .expect("script lock")
            .entry(phone.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn set_auto_deliver(&self, enabled: bool) {
        self.auto_deliver.store(enabled, Ordering::SeqCst);
    }

    /// Everything handed to the transport so far, in order
    pub fn sends(&self) -> Vec<OutboundSms> {
        self.sends.lock().expect("sends lock").clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().expect("sends lock").len()
    }

    /// Push a delivery report into the out-of-band stream
    pub fn inject_report(&self, report: DeliveryReport) {
        let _ = self.reports.send(report);
    }

    fn next_outcome(&self, phone: &str) -> ScriptedOutcome {
        self.scripts
            .lock()
            .expect("script lock")
            .get_mut(phone)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Ok)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, sms: &OutboundSms) -> Result<SendAck, TransportError> {
        self.sends.lock().expect("sends lock").push(sms.clone());

        match self.next_outcome(sms.phone.as_str()) {
            ScriptedOutcome::Ok => {
                if self.auto_deliver.load(Ordering::SeqCst) {
                    let reports = self.reports.clone();
                    let report = DeliveryReport {
                        msg_id: Some(sms.msg_id),
                        phone: sms.phone.clone(),
                        body_hash: None,
                        delivered: true,
                        at: Timestamp::now(),
                    };
                    let delay = self.report_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = reports.send(report);
                    });
                }
                Ok(SendAck {
                    msg_id: sms.msg_id,
                    accepted_at: Timestamp::now(),
                })
            }
            ScriptedOutcome::Transient => Err(TransportError::transient("radio busy")),
            ScriptedOutcome::PermanentInvalid => Err(TransportError::PermanentInvalid {
                reason: "destination not obtainable".to_string(),
            }),
            ScriptedOutcome::PermanentBlocked => Err(TransportError::PermanentBlocked {
                reason: "destination blocked by carrier".to_string(),
            }),
            ScriptedOutcome::Hang => {
                futures::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
        }
    }

    fn delivery_reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    fn name(&self) -> &str {
        "mock"
    }
}
