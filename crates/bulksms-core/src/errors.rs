//! Error types for the dispatch engine
//!
//! Per-concern error enums unified by [`DispatchError`]. Every variant maps
//! to a stable internal code via [`DispatchError::error_code`]; user-facing
//! text is free to change, the codes are not.

use crate::types::{MessageId, PhoneParseError, SessionId};

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors raised by the durable session store
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage write failed: {reason}")]
    Write { reason: String },
    #[error("storage read failed: {reason}")]
    Read { reason: String },
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("session {session_id} is leased by another executor")]
    LeaseHeld { session_id: SessionId },
    #[error("store corruption: {reason}")]
    Corrupt { reason: String },
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors raised by the SMS transport, categorized for retry policy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Radio busy, congestion, or any condition worth retrying
    #[error("transient transport failure: {reason}")]
    Transient { reason: String },
    /// No acknowledgment within the ack timeout; treated as transient
    #[error("transport timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    /// The destination number is not routable
    #[error("permanent failure, invalid destination: {reason}")]
    PermanentInvalid { reason: String },
    /// The destination or route is blocked by carrier or policy
    #[error("permanent failure, destination blocked: {reason}")]
    PermanentBlocked { reason: String },
    /// Any other non-retriable failure
    #[error("permanent transport failure: {reason}")]
    PermanentOther { reason: String },
}

impl TransportError {
    /// Whether the failure is worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn transient<R: Into<String>>(reason: R) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Template Errors
// ----------------------------------------------------------------------------

/// Errors raised during template validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template is empty")]
    Empty,
    #[error("unclosed placeholder starting at byte {offset}")]
    UnclosedPlaceholder { offset: usize },
    #[error("empty placeholder at byte {offset}")]
    EmptyPlaceholder { offset: usize },
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Errors around session lifecycle and state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("session {0} is not running")]
    NotRunning(SessionId),
    #[error("session {0} is already running")]
    AlreadyRunning(SessionId),
    #[error("counter invariant violated: sent {sent} + failed {failed} + skipped {skipped} != processed {processed}")]
    CounterInvariant {
        sent: u64,
        failed: u64,
        skipped: u64,
        processed: u64,
    },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Top-level error type for the dispatch engine
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("invalid phone number: {0}")]
    Phone(#[from] PhoneParseError),

    /// Bad input refused before any send (empty template, empty recipients, ...)
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Inter-task channel failure
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Bad configuration detected at wiring time
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A worker task panicked; session state was persisted before surfacing
    #[error("fatal: {diagnostic}")]
    Fatal { diagnostic: String },
}

impl DispatchError {
    pub fn invalid_input<R: Into<String>>(reason: R) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn channel_error<M: Into<String>>(message: M) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    pub fn config_error<R: Into<String>>(reason: R) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Stable internal code for telemetry and log correlation
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Storage(StorageError::Write { .. }) => "E_STORAGE_WRITE",
            Self::Storage(StorageError::Read { .. }) => "E_STORAGE_READ",
            Self::Storage(StorageError::SessionNotFound(_)) => "E_SESSION_NOT_FOUND",
            Self::Storage(StorageError::MessageNotFound(_)) => "E_MESSAGE_NOT_FOUND",
            Self::Storage(StorageError::LeaseHeld { .. }) => "E_LEASE_HELD",
            Self::Storage(StorageError::Corrupt { .. }) => "E_STORAGE_CORRUPT",
            Self::Transport(TransportError::Timeout { .. }) => "E_TRANSPORT_TIMEOUT",
            Self::Transport(TransportError::Transient { .. }) => "E_TRANSPORT_TRANSIENT",
            Self::Transport(TransportError::PermanentInvalid { .. }) => "E_TRANSPORT_INVALID",
            Self::Transport(TransportError::PermanentBlocked { .. }) => "E_TRANSPORT_BLOCKED",
            Self::Transport(TransportError::PermanentOther { .. }) => "E_TRANSPORT_OTHER",
            Self::Template(_) => "E_TEMPLATE_INVALID",
            Self::Session(SessionError::InvalidTransition { .. }) => "E_INVALID_TRANSITION",
            Self::Session(SessionError::CounterInvariant { .. }) => "E_COUNTER_INVARIANT",
            Self::Session(_) => "E_SESSION_STATE",
            Self::Phone(_) => "E_INVALID_NUMBER",
            Self::InvalidInput { .. } => "E_INVALID_INPUT",
            Self::Channel { .. } => "E_CHANNEL",
            Self::Configuration { .. } => "E_CONFIG",
            Self::Fatal { .. } => "E_FATAL_PANIC",
        }
    }
}

pub type Result<T> = core::result::Result<T, DispatchError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::transient("radio busy").is_transient());
        assert!(TransportError::Timeout { duration_ms: 30_000 }.is_transient());
        assert!(!TransportError::PermanentInvalid {
            reason: "unroutable".into()
        }
        .is_transient());
    }

    #[test]
    fn error_codes_are_stable() {
        let err = DispatchError::Storage(StorageError::Write {
            reason: "disk full".into(),
        });
        assert_eq!(err.error_code(), "E_STORAGE_WRITE");

        let err = DispatchError::Transport(TransportError::Timeout { duration_ms: 1 });
        assert_eq!(err.error_code(), "E_TRANSPORT_TIMEOUT");

        let err = DispatchError::invalid_input("empty template");
        assert_eq!(err.error_code(), "E_INVALID_INPUT");
    }
}
