//! Centralized configuration for the dispatch engine
//!
//! All tunables live here so the runtime, store and CLI share one
//! serializable configuration surface with sane defaults.

use core::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::session::CampaignType;

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Backoff policy for transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per message, including the first
    pub max_attempts: u32,
    /// Base delay before the first retry
    pub base_ms: u64,
    /// Ceiling for the exponential delay
    pub cap_ms: u64,
    /// Symmetric jitter fraction applied to each delay, in [0, 1]
    pub jitter_frac: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 5_000,    // 5 s
            cap_ms: 300_000,   // 5 min
            jitter_frac: 0.2,
        }
    }
}

// ----------------------------------------------------------------------------
// Quiet Hours
// ----------------------------------------------------------------------------

/// Local wall-clock window `[start, end)` in which sends are deferred.
///
/// A window may wrap midnight (`start > end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `now` falls inside the window
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }

    /// Time remaining until the window ends, if `now` is inside it
    pub fn remaining(&self, now: NaiveTime) -> Option<Duration> {
        if !self.contains(now) {
            return None;
        }
        let until = if now < self.end {
            self.end - now
        } else {
            // wrapped window: through midnight, then to `end`
            (NaiveTime::from_hms_opt(23, 59, 59).expect("valid time") - now)
                + chrono::Duration::seconds(1)
                + (self.end - NaiveTime::from_hms_opt(0, 0, 0).expect("valid time"))
        };
        until.to_std().ok()
    }
}

// ----------------------------------------------------------------------------
// Rate Limit Configuration
// ----------------------------------------------------------------------------

/// Sliding-window quotas for one campaign category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

/// Pacing policy for one campaign category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    pub windows: WindowLimits,
    /// Minimum spacing between sends to the same number
    pub cooldown_ms: u64,
    /// Optional local quiet-hours window; `None` means always allowed
    pub quiet_hours: Option<QuietHours>,
}

/// Per-category pacing policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryLimits {
    pub marketing: CategoryPolicy,
    pub transactional: CategoryPolicy,
    pub service: CategoryPolicy,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            // Regulatory defaults; only the marketing numbers are normative
            marketing: CategoryPolicy {
                windows: WindowLimits {
                    per_second: 1,
                    per_minute: 30,
                    per_hour: 500,
                    per_day: 2_000,
                },
                cooldown_ms: 60_000,
                quiet_hours: None,
            },
            transactional: CategoryPolicy {
                windows: WindowLimits {
                    per_second: 5,
                    per_minute: 120,
                    per_hour: 2_000,
                    per_day: 10_000,
                },
                cooldown_ms: 10_000,
                quiet_hours: None,
            },
            service: CategoryPolicy {
                windows: WindowLimits {
                    per_second: 5,
                    per_minute: 120,
                    per_hour: 2_000,
                    per_day: 10_000,
                },
                cooldown_ms: 10_000,
                quiet_hours: None,
            },
        }
    }
}

impl CategoryLimits {
    pub fn for_category(&self, category: CampaignType) -> &CategoryPolicy {
        match category {
            CampaignType::Marketing => &self.marketing,
            CampaignType::Transactional => &self.transactional,
            CampaignType::Service => &self.service,
        }
    }

    pub fn for_category_mut(&mut self, category: CampaignType) -> &mut CategoryPolicy {
        match category {
            CampaignType::Marketing => &mut self.marketing,
            CampaignType::Transactional => &mut self.transactional,
            CampaignType::Service => &mut self.service,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the runtime's channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Broadcast buffer for the external event stream
    pub event_buffer_size: usize,
    /// Buffer for transport delivery reports
    pub report_buffer_size: usize,
    /// Buffer for executor -> tracker messages
    pub tracker_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 256,  // progress can be bursty
            report_buffer_size: 256, // network reports arrive in clumps
            tracker_buffer_size: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Configuration
// ----------------------------------------------------------------------------

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Default pacing in messages per hour (sessions may override)
    pub send_speed_per_hour: u32,
    /// Default SIM slot handed to the transport
    pub sim_slot: u32,
    /// How long to await the radio ack before treating the send as transient
    pub ack_timeout_ms: u64,
    /// How long to wait for a delivery report before assuming delivery
    pub delivery_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub limits: CategoryLimits,
    /// Country/area prefixes that are hard-rejected (with or without `+`)
    pub blocked_prefixes: Vec<String>,
    /// Whether marketing sends require a consent record
    pub consent_required_for_marketing: bool,
    /// Concurrent sessions; the radio is shared, so the default is one
    pub max_parallel_sessions: usize,
    /// Checkpoint after this many processed recipients
    pub checkpoint_every: u64,
    /// ... or after this much time, whichever comes first
    pub checkpoint_interval_ms: u64,
    /// How long a drained retry stays claimed before a crash makes it
    /// drainable again
    pub retry_claim_ttl_ms: u64,
    /// Cadence of statistics snapshots
    pub stats_interval_ms: u64,
    /// Cadence of progress events while sending
    pub progress_interval_ms: u64,
    /// How long to keep draining due retries after the list is exhausted
    pub grace_window_ms: u64,
    /// Lease time-to-live; executors renew at checkpoint time
    pub lease_ttl_ms: u64,
    pub channels: ChannelConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_speed_per_hour: 300,
            sim_slot: 0,
            ack_timeout_ms: 30_000,       // 30 s
            delivery_timeout_ms: 900_000, // 15 min
            retry: RetryPolicy::default(),
            limits: CategoryLimits::default(),
            blocked_prefixes: Vec::new(),
            consent_required_for_marketing: false,
            max_parallel_sessions: 1,
            checkpoint_every: 50,
            checkpoint_interval_ms: 250,
            retry_claim_ttl_ms: 300_000, // 5 min
            stats_interval_ms: 2_000,
            progress_interval_ms: 500,
            grace_window_ms: 300_000, // 5 min
            lease_ttl_ms: 60_000,
            channels: ChannelConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Fast timings for integration tests
    pub fn testing() -> Self {
        Self {
            send_speed_per_hour: 3_600_000, // effectively unpaced
            ack_timeout_ms: 500,
            delivery_timeout_ms: 2_000,
            retry: RetryPolicy {
                max_attempts: 5,
                base_ms: 20,
                cap_ms: 200,
                jitter_frac: 0.0, // predictable for tests
            },
            limits: CategoryLimits {
                marketing: CategoryPolicy {
                    windows: WindowLimits {
                        per_second: 10_000,
                        per_minute: 10_000,
                        per_hour: 100_000,
                        per_day: 100_000,
                    },
                    cooldown_ms: 0,
                    quiet_hours: None,
                },
                transactional: CategoryPolicy {
                    windows: WindowLimits {
                        per_second: 10_000,
                        per_minute: 10_000,
                        per_hour: 100_000,
                        per_day: 100_000,
                    },
                    cooldown_ms: 0,
                    quiet_hours: None,
                },
                service: CategoryPolicy {
                    windows: WindowLimits {
                        per_second: 10_000,
                        per_minute: 10_000,
                        per_hour: 100_000,
                        per_day: 100_000,
                    },
                    cooldown_ms: 0,
                    quiet_hours: None,
                },
            },
            checkpoint_every: 10,
            checkpoint_interval_ms: 50,
            retry_claim_ttl_ms: 200,
            stats_interval_ms: 50,
            progress_interval_ms: 20,
            grace_window_ms: 2_000,
            lease_ttl_ms: 10_000,
            ..Self::default()
        }
    }

    /// Target spacing between sends for a given pacing, before limiter quotas
    pub fn send_interval(send_speed_per_hour: u32) -> Duration {
        if send_speed_per_hour == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(3_600_000 / send_speed_per_hour as u64)
    }

    /// Validate invariants that would otherwise fail deep inside the runtime
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel_sessions == 0 {
            return Err("max_parallel_sessions must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_frac) {
            return Err("retry.jitter_frac must be within [0, 1]".into());
        }
        if self.retry.base_ms > self.retry.cap_ms {
            return Err("retry.base_ms must not exceed retry.cap_ms".into());
        }
        if self.checkpoint_every == 0 {
            return Err("checkpoint_every must be at least 1".into());
        }
        if self.ack_timeout_ms == 0 {
            return Err("ack_timeout_ms must be positive".into());
        }
        if self.retry_claim_ttl_ms == 0 {
            return Err("retry_claim_ttl_ms must be positive".into());
        }
        for prefix in &self.blocked_prefixes {
            let digits = prefix.strip_prefix('+').unwrap_or(prefix);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("blocked prefix {prefix:?} is not numeric"));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn quiet_hours_plain_window() {
        let q = QuietHours::new(t(21, 0), t(8, 0));
        assert!(q.contains(t(23, 30)));
        assert!(q.contains(t(3, 0)));
        assert!(!q.contains(t(12, 0)));
        assert!(!q.contains(t(8, 0))); // end exclusive
    }

    #[test]
    fn quiet_hours_non_wrapping() {
        let q = QuietHours::new(t(9, 0), t(17, 0));
        assert!(q.contains(t(9, 0))); // start inclusive
        assert!(q.contains(t(12, 0)));
        assert!(!q.contains(t(17, 0)));
        assert!(!q.contains(t(20, 0)));
    }

    #[test]
    fn quiet_hours_remaining() {
        let q = QuietHours::new(t(9, 0), t(17, 0));
        assert_eq!(
            q.remaining(t(16, 0)),
            Some(Duration::from_secs(3_600))
        );
        assert_eq!(q.remaining(t(18, 0)), None);

        let wrapped = QuietHours::new(t(22, 0), t(6, 0));
        assert_eq!(
            wrapped.remaining(t(23, 0)),
            Some(Duration::from_secs(7 * 3_600))
        );
    }

    #[test]
    fn defaults_validate() {
        assert!(DispatchConfig::default().validate().is_ok());
        assert!(DispatchConfig::testing().validate().is_ok());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = DispatchConfig::default();
        config.retry.jitter_frac = 1.5;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.blocked_prefixes.push("+25x".into());
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.max_parallel_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn send_interval_mapping() {
        assert_eq!(
            DispatchConfig::send_interval(300),
            Duration::from_millis(12_000)
        );
        assert_eq!(
            DispatchConfig::send_interval(3_600),
            Duration::from_millis(1_000)
        );
        assert_eq!(DispatchConfig::send_interval(0), Duration::ZERO);
    }

    #[test]
    fn marketing_defaults_match_policy() {
        let limits = CategoryLimits::default();
        let m = limits.for_category(CampaignType::Marketing);
        assert_eq!(m.windows.per_second, 1);
        assert_eq!(m.windows.per_minute, 30);
        assert_eq!(m.windows.per_hour, 500);
        assert_eq!(m.windows.per_day, 2_000);
        assert_eq!(m.cooldown_ms, 60_000);

        let t = limits.for_category(CampaignType::Transactional);
        assert_eq!(t.cooldown_ms, 10_000);
    }
}
