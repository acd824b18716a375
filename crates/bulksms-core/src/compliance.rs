//! Per-recipient compliance checks
//!
//! Pure policy evaluation: given a phone, a campaign category, the opt-out
//! set and the consent set, decide whether a message may be sent right now.
//! Rules short-circuit in a fixed order; the first match wins.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::session::CampaignType;
use crate::types::{PhoneNumber, Timestamp};

// ----------------------------------------------------------------------------
// Opt-Out Records
// ----------------------------------------------------------------------------

/// A phone that must never receive campaign traffic again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptOutRecord {
    pub phone: PhoneNumber,
    pub reason: String,
    pub created_at: Timestamp,
}

/// Keywords that opt a sender out when received inbound
const STOP_KEYWORDS: [&str; 6] = ["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"];

/// Whether an inbound body is a STOP-like opt-out request
pub fn is_stop_keyword(body: &str) -> bool {
    let trimmed = body.trim();
    STOP_KEYWORDS
        .iter()
        .any(|kw| trimmed.eq_ignore_ascii_case(kw))
}

// ----------------------------------------------------------------------------
// Policy Views
// ----------------------------------------------------------------------------

/// Read-only view of the opt-out set
pub trait OptOutView: Send + Sync {
    fn is_opted_out(&self, phone: &PhoneNumber) -> bool;
}

/// Read-only view of consent records for marketing traffic
pub trait ConsentView: Send + Sync {
    fn has_consent(&self, phone: &PhoneNumber) -> bool;
}

/// In-memory opt-out set; the store crate provides the durable one
#[derive(Debug, Default)]
pub struct MemoryOptOuts {
    phones: RwLock<HashSet<PhoneNumber>>,
}

impl MemoryOptOuts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, phone: PhoneNumber) {
        self.phones.write().expect("opt-out lock").insert(phone);
    }

    pub fn remove(&self, phone: &PhoneNumber) {
        self.phones.write().expect("opt-out lock").remove(phone);
    }
}

impl OptOutView for MemoryOptOuts {
    fn is_opted_out(&self, phone: &PhoneNumber) -> bool {
        self.phones.read().expect("opt-out lock").contains(phone)
    }
}

/// In-memory consent set
#[derive(Debug, Default)]
pub struct MemoryConsents {
    phones: RwLock<HashSet<PhoneNumber>>,
}

impl MemoryConsents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, phone: PhoneNumber) {
        self.phones.write().expect("consent lock").insert(phone);
    }
}

impl ConsentView for MemoryConsents {
    fn has_consent(&self, phone: &PhoneNumber) -> bool {
        self.phones.read().expect("consent lock").contains(phone)
    }
}

// ----------------------------------------------------------------------------
// Compliance Gate
// ----------------------------------------------------------------------------

/// Outcome of a compliance check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceVerdict {
    /// May send now; carries the normalized number for downstream use
    Compliant(PhoneNumber),
    /// Recipient opted out
    OptOut,
    /// Hard block, typically an unparseable number
    Blocked { reason: String },
    /// Marketing to a jurisdiction requiring consent, none on record
    RequiresConsent,
}

impl ComplianceVerdict {
    pub fn is_compliant(&self) -> bool {
        matches!(self, ComplianceVerdict::Compliant(_))
    }

    /// Short reason string for skip telemetry
    pub fn skip_reason(&self) -> &str {
        match self {
            ComplianceVerdict::Compliant(_) => "",
            ComplianceVerdict::OptOut => "opt_out",
            ComplianceVerdict::Blocked { reason } => reason,
            ComplianceVerdict::RequiresConsent => "requires_consent",
        }
    }
}

/// Evaluates opt-out, blocklist and consent policy per recipient
pub struct ComplianceGate {
    optouts: Arc<dyn OptOutView>,
    consents: Arc<dyn ConsentView>,
    consent_required_for_marketing: bool,
}

impl ComplianceGate {
    pub fn new(
        optouts: Arc<dyn OptOutView>,
        consents: Arc<dyn ConsentView>,
        consent_required_for_marketing: bool,
    ) -> Self {
        Self {
            optouts,
            consents,
            consent_required_for_marketing,
        }
    }

    /// Evaluate the rules in order; the first failing rule decides
    pub fn check(&self, raw_phone: &str, category: CampaignType) -> ComplianceVerdict {
        let phone = match PhoneNumber::parse(raw_phone) {
            Ok(phone) => phone,
            Err(_) => {
                return ComplianceVerdict::Blocked {
                    reason: "invalid_number".to_string(),
                }
            }
        };

        if self.optouts.is_opted_out(&phone) {
            return ComplianceVerdict::OptOut;
        }

        if category == CampaignType::Marketing
            && self.consent_required_for_marketing
            && !self.consents.has_consent(&phone)
        {
            return ComplianceVerdict::RequiresConsent;
        }

        ComplianceVerdict::Compliant(phone)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(consent_required: bool) -> (ComplianceGate, Arc<MemoryOptOuts>, Arc<MemoryConsents>) {
        let optouts = Arc::new(MemoryOptOuts::new());
        let consents = Arc::new(MemoryConsents::new());
        let gate = ComplianceGate::new(optouts.clone(), consents.clone(), consent_required);
        (gate, optouts, consents)
    }

    #[test]
    fn invalid_number_blocks_first() {
        let (gate, optouts, _) = gate(true);
        // even an opted-out garbage number reports invalid_number
        optouts.insert(PhoneNumber::parse("+254700000001").unwrap());
        let verdict = gate.check("not-a-phone", CampaignType::Marketing);
        assert_eq!(
            verdict,
            ComplianceVerdict::Blocked {
                reason: "invalid_number".to_string()
            }
        );
    }

    #[test]
    fn opt_out_beats_consent() {
        let (gate, optouts, _) = gate(true);
        optouts.insert(PhoneNumber::parse("+254700000001").unwrap());
        let verdict = gate.check("+254 700 000 001", CampaignType::Marketing);
        assert_eq!(verdict, ComplianceVerdict::OptOut);
        assert_eq!(verdict.skip_reason(), "opt_out");
    }

    #[test]
    fn marketing_requires_consent_when_configured() {
        let (gate, _, consents) = gate(true);
        assert_eq!(
            gate.check("+254700000001", CampaignType::Marketing),
            ComplianceVerdict::RequiresConsent
        );
        // transactional traffic is exempt
        assert!(gate
            .check("+254700000001", CampaignType::Transactional)
            .is_compliant());

        consents.insert(PhoneNumber::parse("+254700000001").unwrap());
        assert!(gate
            .check("+254700000001", CampaignType::Marketing)
            .is_compliant());
    }

    #[test]
    fn compliant_carries_normalized_phone() {
        let (gate, _, _) = gate(false);
        match gate.check("00254 700-000-001", CampaignType::Service) {
            ComplianceVerdict::Compliant(phone) => assert_eq!(phone.as_str(), "+254700000001"),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn stop_keywords() {
        for body in ["STOP", "stop", "  Unsubscribe  ", "END", "quit"] {
            assert!(is_stop_keyword(body), "{body}");
        }
        for body in ["STOP PLEASE", "OK", "", "CANCELLED"] {
            assert!(!is_stop_keyword(body), "{body}");
        }
    }
}
