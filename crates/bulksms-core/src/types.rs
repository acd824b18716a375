//! Core types for the dispatch engine
//!
//! This module defines the fundamental types used throughout the engine,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Phone Number
// ----------------------------------------------------------------------------

/// An E.164-normalized phone number (`+` followed by 8-15 digits).
///
/// Construction goes through [`PhoneNumber::parse`], which strips common
/// formatting characters and converts the `00` international prefix to `+`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

/// Reasons a raw phone string failed E.164 normalization
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneParseError {
    #[error("empty phone number")]
    Empty,
    #[error("invalid character {0:?} in phone number")]
    InvalidCharacter(char),
    #[error("phone number has {0} digits, expected 8-15")]
    BadLength(usize),
    #[error("phone number may not start with zero after country prefix")]
    LeadingZero,
}

impl PhoneNumber {
    /// E.164 minimum significant digits accepted by the engine.
    pub const MIN_DIGITS: usize = 8;
    /// E.164 maximum digits.
    pub const MAX_DIGITS: usize = 15;

    /// Normalize a raw string into an E.164 phone number.
    ///
    /// Accepts optional `+` or `00` international prefixes and strips
    /// spaces, dots, dashes and parentheses. Everything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, PhoneParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PhoneParseError::Empty);
        }

        let mut digits = String::with_capacity(trimmed.len());
        let mut rest = trimmed;
        if let Some(stripped) = rest.strip_prefix('+') {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("00") {
            rest = stripped;
        }

        for ch in rest.chars() {
            match ch {
                '0'..='9' => digits.push(ch),
                ' ' | '-' | '.' | '(' | ')' => continue,
                other => return Err(PhoneParseError::InvalidCharacter(other)),
            }
        }

        if digits.len() < Self::MIN_DIGITS || digits.len() > Self::MAX_DIGITS {
            return Err(PhoneParseError::BadLength(digits.len()));
        }
        if digits.starts_with('0') {
            return Err(PhoneParseError::LeadingZero);
        }

        Ok(Self(format!("+{digits}")))
    }

    /// The normalized `+<digits>` representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the number starts with a country/area prefix.
    ///
    /// The prefix may be given with or without the leading `+`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.strip_prefix('+').unwrap_or(prefix);
        self.0[1..].starts_with(prefix)
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = PhoneParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

/// Unique identifier of one campaign session
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier of one outbound message attempt
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp from epoch milliseconds
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Add milliseconds to this timestamp
    pub fn add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Milliseconds elapsed since `other` (saturating at zero)
    pub fn millis_since(&self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// Duration elapsed since `other` (saturating at zero)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.millis_since(other))
    }
}

impl core::ops::Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, millis: u64) -> Timestamp {
        self.add_millis(millis)
    }
}

impl core::ops::Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.millis_since(other)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Trait for providing timestamps to time-dependent components
///
/// Keeps the rate limiter, retry policy and delivery tracker testable with
/// a manually advanced clock.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of [`TimeSource`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: std::sync::atomic::AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start.as_millis()),
        }
    }

    /// Advance the clock by `millis`
    pub fn advance(&self, millis: u64) {
        self.now
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }

    /// Jump the clock to an absolute timestamp
    pub fn set(&self, to: Timestamp) {
        self.now
            .store(to.as_millis(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_formatted_numbers() {
        let cases = [
            "+254700000001",
            "254 700 000 001",
            "00254-700-000-001",
            "+254 (700) 000.001",
        ];
        for raw in cases {
            let phone = PhoneNumber::parse(raw).unwrap();
            assert_eq!(phone.as_str(), "+254700000001", "raw: {raw}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(PhoneNumber::parse(""), Err(PhoneParseError::Empty));
        assert_eq!(PhoneNumber::parse("   "), Err(PhoneParseError::Empty));
        assert_eq!(
            PhoneNumber::parse("+2547abc"),
            Err(PhoneParseError::InvalidCharacter('a'))
        );
        assert_eq!(
            PhoneNumber::parse("+1234"),
            Err(PhoneParseError::BadLength(4))
        );
        assert_eq!(
            PhoneNumber::parse("+1234567890123456"),
            Err(PhoneParseError::BadLength(16))
        );
        assert_eq!(
            PhoneNumber::parse("+0254700000001"),
            Err(PhoneParseError::LeadingZero)
        );
    }

    #[test]
    fn prefix_matching_ignores_plus() {
        let phone = PhoneNumber::parse("+254700000001").unwrap();
        assert!(phone.has_prefix("254"));
        assert!(phone.has_prefix("+254"));
        assert!(!phone.has_prefix("255"));
    }

    #[test]
    fn timestamp_arithmetic() {
        let a = Timestamp::new(1_000);
        let b = a + 500;
        assert_eq!(b.as_millis(), 1_500);
        assert_eq!(b - a, 500);
        assert_eq!(a - b, 0); // saturating
        assert_eq!(b.duration_since(a), core::time::Duration::from_millis(500));
    }

    #[test]
    fn manual_time_source_advances() {
        let clock = ManualTimeSource::new(Timestamp::new(10));
        assert_eq!(clock.now().as_millis(), 10);
        clock.advance(90);
        assert_eq!(clock.now().as_millis(), 100);
        clock.set(Timestamp::new(5));
        assert_eq!(clock.now().as_millis(), 5);
    }
}
