//! Async orchestration for the bulk SMS dispatch engine
//!
//! Long-running tokio tasks over the core components: the campaign executor
//! (one per session, lease-enforced), the delivery dispatcher (single writer
//! of the tracker), the durable scheduler, and [`DispatchRuntime`] which
//! wires them together and exposes the control surface.

pub mod control;
pub mod dispatcher;
pub mod executor;
pub mod runtime;
pub mod scheduler;
pub mod testing;

pub use control::{ControlReceiver, ControlSender, ControlSignal};
pub use dispatcher::{DeliveryDispatcher, TrackerCommand, TrackerSender};
pub use executor::CampaignExecutor;
pub use runtime::DispatchRuntime;
pub use scheduler::{Scheduler, SchedulerCommand};
pub use testing::{MockTransport, ScriptedOutcome};
