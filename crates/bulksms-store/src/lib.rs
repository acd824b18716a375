//! Durable persistence for the bulk SMS dispatch engine
//!
//! SQLite-backed store for campaign sessions, outbound messages (including
//! the retry queue), opt-out records, schedules and executor leases. Every
//! mutation is transactional; the engine resumes cleanly from any crash
//! point.

pub mod schema;
pub mod store;

pub use store::{ScheduleEntry, SessionStore};
