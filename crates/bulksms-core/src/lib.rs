//! Core of the bulk SMS dispatch engine
//!
//! This crate provides the domain types and pure components of the engine:
//! sessions and recipients, the layered rate limiter, the compliance gate,
//! the template renderer, retry backoff policy, the delivery-tracking state
//! machine and the typed event protocol. Durable persistence lives in
//! `bulksms-store`; the async orchestration lives in `bulksms-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod compliance;
pub mod config;
pub mod errors;
pub mod events;
pub mod message;
pub mod rate_limiter;
pub mod recipient;
pub mod retry;
pub mod session;
pub mod template;
pub mod tracker;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use compliance::{
    is_stop_keyword, ComplianceGate, ComplianceVerdict, ConsentView, MemoryConsents,
    MemoryOptOuts, OptOutRecord, OptOutView,
};
pub use config::{
    CategoryLimits, CategoryPolicy, ChannelConfig, DispatchConfig, QuietHours, RetryPolicy,
    WindowLimits,
};
pub use errors::{
    DispatchError, Result, SessionError, StorageError, TemplateError, TransportError,
};
pub use events::{
    create_event_channel, create_stats_channel, DispatchEvent, EventReceiver, EventSender,
    ProgressSnapshot, StatsReceiver, StatsSender,
};
pub use message::{body_hash, MessageStatus, OutboundMessage};
pub use rate_limiter::{Admission, DeferReason, RateLimiter, WindowKind};
pub use recipient::Recipient;
pub use session::{CampaignSession, CampaignType, CheckpointPatch, ProcessingStatus};
pub use template::{estimate_segments, RenderedMessage, SegmentEstimate, SmsEncoding, TemplateRenderer};
pub use tracker::{DeliveryStats, DeliveryTracker, SendDisposition, TrackedMessage};
pub use transport::{DeliveryReport, OutboundSms, SendAck, Transport};
pub use types::{
    ManualTimeSource, MessageId, PhoneNumber, PhoneParseError, SessionId, SystemTimeSource,
    TimeSource, Timestamp,
};
