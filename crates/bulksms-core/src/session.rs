//! Campaign sessions and their lifecycle
//!
//! A session is one logical campaign: the imported recipient list, the
//! message template, pacing settings and durable progress counters. Status
//! transitions are guarded so an executor can never move a session along an
//! illegal edge.

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::recipient::Recipient;
use crate::types::{SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Campaign Category
// ----------------------------------------------------------------------------

/// Regulatory category of a campaign; drives compliance and pacing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignType {
    Marketing,
    Transactional,
    Service,
}

impl CampaignType {
    pub const ALL: [CampaignType; 3] = [
        CampaignType::Marketing,
        CampaignType::Transactional,
        CampaignType::Service,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignType::Marketing => "MARKETING",
            CampaignType::Transactional => "TRANSACTIONAL",
            CampaignType::Service => "SERVICE",
        }
    }
}

impl core::fmt::Display for CampaignType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for CampaignType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MARKETING" => Ok(CampaignType::Marketing),
            "TRANSACTIONAL" => Ok(CampaignType::Transactional),
            "SERVICE" => Ok(CampaignType::Service),
            other => Err(format!("unknown campaign type: {other}")),
        }
    }
}

// ----------------------------------------------------------------------------
// Processing Status
// ----------------------------------------------------------------------------

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Imported and ready to start
    Ready,
    /// Queued for a future fire time
    Scheduled,
    /// An executor is actively pumping recipients
    Sending,
    /// Paused by the operator; resumable
    Paused,
    /// Stopped by the operator; pending retries purged
    Stopped,
    /// All recipients processed and retry grace window drained
    Completed,
    /// Aborted on storage failure or panic
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Ready => "ready",
            ProcessingStatus::Scheduled => "scheduled",
            ProcessingStatus::Sending => "sending",
            ProcessingStatus::Paused => "paused",
            ProcessingStatus::Stopped => "stopped",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Whether the executor loop may still run for this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Stopped | ProcessingStatus::Completed | ProcessingStatus::Failed
        )
    }

    /// Legal status transitions
    ///
    /// ```text
    /// ready ──start──> sending ──pause──> paused ──resume──> sending
    ///                     │                  │
    ///                     ├──stop──> stopped │
    ///                     ├──done──> completed
    ///                     └──error──> failed
    /// ```
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Ready, Scheduled)
                | (Ready, Sending)
                | (Scheduled, Sending)
                | (Scheduled, Ready)
                | (Sending, Paused)
                | (Sending, Stopped)
                | (Sending, Completed)
                | (Sending, Failed)
                | (Paused, Sending)
                | (Paused, Stopped)
                | (Paused, Failed)
        )
    }
}

impl core::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(ProcessingStatus::Ready),
            "scheduled" => Ok(ProcessingStatus::Scheduled),
            "sending" => Ok(ProcessingStatus::Sending),
            "paused" => Ok(ProcessingStatus::Paused),
            "stopped" => Ok(ProcessingStatus::Stopped),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status: {other}")),
        }
    }
}

// ----------------------------------------------------------------------------
// Campaign Session
// ----------------------------------------------------------------------------

/// One logical campaign with durable progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSession {
    pub session_id: SessionId,
    pub file_name: String,
    pub campaign_name: String,
    pub campaign_type: CampaignType,
    pub recipients: Vec<Recipient>,
    pub template: String,
    /// Target pacing in messages per hour
    pub send_speed: u32,
    pub sim_slot: u32,
    /// Index of the next unprocessed recipient
    pub last_processed_index: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub processing_status: ProcessingStatus,
    /// UTC fire time for scheduled campaigns
    pub scheduled_at: Option<Timestamp>,
    /// Display-only timezone recorded at scheduling time
    pub scheduled_tz: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl CampaignSession {
    pub fn new(
        file_name: impl Into<String>,
        campaign_name: impl Into<String>,
        campaign_type: CampaignType,
        recipients: Vec<Recipient>,
        template: impl Into<String>,
        send_speed: u32,
        sim_slot: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            file_name: file_name.into(),
            campaign_name: campaign_name.into(),
            campaign_type,
            recipients,
            template: template.into(),
            send_speed,
            sim_slot,
            last_processed_index: 0,
            sent_count: 0,
            failed_count: 0,
            skipped_count: 0,
            processing_status: ProcessingStatus::Ready,
            scheduled_at: None,
            scheduled_tz: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_recipients(&self) -> u64 {
        self.recipients.len() as u64
    }

    /// Fraction of the list processed, in [0, 100]
    pub fn percent_processed(&self) -> f64 {
        if self.recipients.is_empty() {
            100.0
        } else {
            (self.last_processed_index as f64 / self.recipients.len() as f64) * 100.0
        }
    }

    /// Move to `next`, enforcing the transition table
    pub fn transition_to(&mut self, next: ProcessingStatus) -> Result<(), SessionError> {
        if self.processing_status == next {
            return Ok(());
        }
        if !self.processing_status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.processing_status.to_string(),
                to: next.to_string(),
            });
        }
        self.processing_status = next;
        Ok(())
    }

    /// Verify `sent + failed + skipped == last_processed_index` and the
    /// index bound; must hold after every checkpoint
    pub fn validate_counters(&self) -> Result<(), SessionError> {
        let processed = self.last_processed_index;
        if processed > self.total_recipients() {
            return Err(SessionError::CounterInvariant {
                sent: self.sent_count,
                failed: self.failed_count,
                skipped: self.skipped_count,
                processed,
            });
        }
        if self.sent_count + self.failed_count + self.skipped_count != processed {
            return Err(SessionError::CounterInvariant {
                sent: self.sent_count,
                failed: self.failed_count,
                skipped: self.skipped_count,
                processed,
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Checkpoint Patch
// ----------------------------------------------------------------------------

/// Partial durable update applied by the executor at checkpoint time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPatch {
    pub last_processed_index: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub processing_status: ProcessingStatus,
}

impl CheckpointPatch {
    pub fn of(session: &CampaignSession) -> Self {
        Self {
            last_processed_index: session.last_processed_index,
            sent_count: session.sent_count,
            failed_count: session.failed_count,
            skipped_count: session.skipped_count,
            processing_status: session.processing_status,
        }
    }

    pub fn apply(&self, session: &mut CampaignSession, now: Timestamp) {
        session.last_processed_index = self.last_processed_index;
        session.sent_count = self.sent_count;
        session.failed_count = self.failed_count;
        session.skipped_count = self.skipped_count;
        session.processing_status = self.processing_status;
        session.updated_at = now;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CampaignSession {
        CampaignSession::new(
            "contacts.csv",
            "august-promo",
            CampaignType::Marketing,
            vec![
                Recipient::new(0, "+254700000001"),
                Recipient::new(1, "+254700000002"),
            ],
            "Hi {{Name}}",
            300,
            0,
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn legal_transitions() {
        let mut s = session();
        s.transition_to(ProcessingStatus::Sending).unwrap();
        s.transition_to(ProcessingStatus::Paused).unwrap();
        s.transition_to(ProcessingStatus::Sending).unwrap();
        s.transition_to(ProcessingStatus::Completed).unwrap();
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut s = session();
        assert!(matches!(
            s.transition_to(ProcessingStatus::Paused),
            Err(SessionError::InvalidTransition { .. })
        ));

        s.transition_to(ProcessingStatus::Sending).unwrap();
        s.transition_to(ProcessingStatus::Completed).unwrap();
        assert!(s
            .transition_to(ProcessingStatus::Sending)
            .is_err());
    }

    #[test]
    fn self_transition_is_noop() {
        let mut s = session();
        s.transition_to(ProcessingStatus::Ready).unwrap();
        assert_eq!(s.processing_status, ProcessingStatus::Ready);
    }

    #[test]
    fn counter_invariant() {
        let mut s = session();
        assert!(s.validate_counters().is_ok());

        s.last_processed_index = 2;
        s.sent_count = 1;
        s.skipped_count = 1;
        assert!(s.validate_counters().is_ok());

        s.failed_count = 1;
        assert!(s.validate_counters().is_err());

        s.failed_count = 0;
        s.last_processed_index = 3; // beyond the list
        assert!(s.validate_counters().is_err());
    }

    #[test]
    fn checkpoint_patch_round_trip() {
        let mut s = session();
        s.transition_to(ProcessingStatus::Sending).unwrap();
        s.last_processed_index = 1;
        s.sent_count = 1;

        let patch = CheckpointPatch::of(&s);
        let mut reloaded = session();
        reloaded.transition_to(ProcessingStatus::Sending).unwrap();
        patch.apply(&mut reloaded, Timestamp::new(2_000));

        assert_eq!(reloaded.last_processed_index, 1);
        assert_eq!(reloaded.sent_count, 1);
        assert_eq!(reloaded.updated_at, Timestamp::new(2_000));
        assert!(reloaded.validate_counters().is_ok());
    }

    #[test]
    fn percent_processed_handles_empty_list() {
        let mut s = session();
        s.recipients.clear();
        assert_eq!(s.percent_processed(), 100.0);
    }
}
