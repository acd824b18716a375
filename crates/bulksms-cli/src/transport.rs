//! Console transport
//!
//! Stand-in transport for demos and dry runs: every send is logged instead
//! of hitting a radio, acknowledged immediately and confirmed delivered a
//! moment later. Swap in a platform transport for real traffic.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use bulksms_core::errors::TransportError;
use bulksms_core::transport::{DeliveryReport, OutboundSms, SendAck, Transport};
use bulksms_core::types::Timestamp;

pub struct ConsoleTransport {
    reports: broadcast::Sender<DeliveryReport>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        let (reports, _) = broadcast::channel(256);
        Self { reports }
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for ConsoleTransport {
    async fn send(&self, sms: &OutboundSms) -> Result<SendAck, TransportError> {
        info!(phone = %sms.phone, sim_slot = sms.sim_slot, body = %sms.body, "SMS out");

        let reports = self.reports.clone();
        let report = DeliveryReport {
            msg_id: Some(sms.msg_id),
            phone: sms.phone.clone(),
            body_hash: None,
            delivered: true,
            at: Timestamp::now(),
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = reports.send(report);
        });

        Ok(SendAck {
            msg_id: sms.msg_id,
            accepted_at: Timestamp::now(),
        })
    }

    fn delivery_reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    fn name(&self) -> &str {
        "console"
    }
}
