//! Layered send-rate admission
//!
//! Enforces quiet hours, per-number cooldown, sliding-window quotas and the
//! prefix blocklist, in that order; the first failing layer decides the
//! outcome. The limiter is a plain owned struct; the runtime guards the
//! single process-wide instance with one mutex because the radio is a shared
//! resource.

use core::time::Duration;
use std::collections::HashMap;

use chrono::NaiveTime;

use crate::config::{CategoryLimits, CategoryPolicy};
use crate::session::CampaignType;
use crate::types::{PhoneNumber, Timestamp};

// ----------------------------------------------------------------------------
// Admission Verdicts
// ----------------------------------------------------------------------------

/// Quota window dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Second,
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    pub const ALL: [WindowKind; 4] = [
        WindowKind::Second,
        WindowKind::Minute,
        WindowKind::Hour,
        WindowKind::Day,
    ];

    pub fn len_ms(&self) -> u64 {
        match self {
            WindowKind::Second => 1_000,
            WindowKind::Minute => 60_000,
            WindowKind::Hour => 3_600_000,
            WindowKind::Day => 86_400_000,
        }
    }
}

/// Why an admission was deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    QuietHours,
    Cooldown,
    WindowSaturated(WindowKind),
}

/// Outcome of an admission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Send now; caller must follow up with [`RateLimiter::record_send`]
    Admitted,
    /// Come back after `retry_after`
    Defer {
        retry_after: Duration,
        reason: DeferReason,
    },
    /// Never send to this destination
    Reject { reason: String },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

// ----------------------------------------------------------------------------
// Rate Limiter
// ----------------------------------------------------------------------------

/// Process-global send pacing state
///
/// Window state is in-memory and reconstructable; only the opt-out and
/// message tables are durable.
pub struct RateLimiter {
    limits: CategoryLimits,
    blocked_prefixes: Vec<String>,
    /// Send timestamps per category, oldest first, pruned past one day
    sends: HashMap<CampaignType, Vec<Timestamp>>,
    last_send_per_phone: HashMap<PhoneNumber, Timestamp>,
}

impl RateLimiter {
    pub fn new(limits: CategoryLimits, blocked_prefixes: Vec<String>) -> Self {
        Self {
            limits,
            blocked_prefixes,
            sends: HashMap::new(),
            last_send_per_phone: HashMap::new(),
        }
    }

    /// Evaluate all layers for one prospective send.
    ///
    /// `local_now` is the local wall-clock time used for quiet hours; it is
    /// passed in rather than read here so the limiter stays a pure function
    /// of its inputs.
    pub fn admit(
        &mut self,
        phone: &PhoneNumber,
        category: CampaignType,
        now: Timestamp,
        local_now: NaiveTime,
    ) -> Admission {
        self.prune(category, now);
        let policy = self.limits.for_category(category).clone();

        // 1. Quiet hours
        if let Some(quiet) = &policy.quiet_hours {
            if let Some(remaining) = quiet.remaining(local_now) {
                return Admission::Defer {
                    retry_after: remaining,
                    reason: DeferReason::QuietHours,
                };
            }
        }

        // 2. Per-number cooldown
        if policy.cooldown_ms > 0 {
            if let Some(last) = self.last_send_per_phone.get(phone) {
                let elapsed = now.millis_since(*last);
                if elapsed < policy.cooldown_ms {
                    return Admission::Defer {
                        retry_after: Duration::from_millis(policy.cooldown_ms - elapsed),
                        reason: DeferReason::Cooldown,
                    };
                }
            }
        }

        // 3. Sliding windows, smallest first
        if let Some(defer) = self.check_windows(category, &policy, now) {
            return defer;
        }

        // 4. Hard prefix blocks
        if self
            .blocked_prefixes
            .iter()
            .any(|prefix| phone.has_prefix(prefix))
        {
            return Admission::Reject {
                reason: "blocked_prefix".to_string(),
            };
        }

        Admission::Admitted
    }

    /// Record an admitted send across all windows
    pub fn record_send(&mut self, phone: &PhoneNumber, category: CampaignType, now: Timestamp) {
        self.sends.entry(category).or_default().push(now);

        let entry = self
            .last_send_per_phone
            .entry(phone.clone())
            .or_insert(Timestamp::new(0));
        // strictly increasing, even under a same-millisecond burst
        *entry = now.max(entry.add_millis(1));
    }

    /// Timestamp of the last admitted send for a phone
    pub fn last_send(&self, phone: &PhoneNumber) -> Option<Timestamp> {
        self.last_send_per_phone.get(phone).copied()
    }

    fn check_windows(
        &self,
        category: CampaignType,
        policy: &CategoryPolicy,
        now: Timestamp,
    ) -> Option<Admission> {
        let events = self.sends.get(&category)?;

        for kind in WindowKind::ALL {
            let limit = match kind {
                WindowKind::Second => policy.windows.per_second,
                WindowKind::Minute => policy.windows.per_minute,
                WindowKind::Hour => policy.windows.per_hour,
                WindowKind::Day => policy.windows.per_day,
            };
            let cutoff = now.as_millis().saturating_sub(kind.len_ms());
            let in_window: Vec<&Timestamp> = events
                .iter()
                .filter(|ts| ts.as_millis() > cutoff)
                .collect();

            if in_window.len() as u32 >= limit {
                // events are appended in order, so the first is the oldest
                let oldest = in_window.first().expect("non-empty window");
                let exit_at = oldest.as_millis() + kind.len_ms();
                let retry_after = exit_at.saturating_sub(now.as_millis()).max(1);
                return Some(Admission::Defer {
                    retry_after: Duration::from_millis(retry_after),
                    reason: DeferReason::WindowSaturated(kind),
                });
            }
        }
        None
    }

    /// Drop events older than the largest window
    fn prune(&mut self, category: CampaignType, now: Timestamp) {
        if let Some(events) = self.sends.get_mut(&category) {
            let cutoff = now.as_millis().saturating_sub(WindowKind::Day.len_ms());
            events.retain(|ts| ts.as_millis() > cutoff);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
