//! The goalpost engine: a durable, PostgreSQL-backed goal scheduler.
//!
//! Work is described as a DAG of goals, each pursued by a named handler.
//! Eligibility is gated on a precondition date, on the states of other
//! goals, and on handler-requested yields. All mutual exclusion is
//! row-level in the store; workers of any flavor can run concurrently.

pub mod dispatch;
pub mod error;
pub mod fsck;
pub mod handler;
pub mod limits;
pub mod notify;
pub mod pickups;
pub mod scheduler;
pub mod settings;
pub mod transitions;
pub mod worker;

pub use dispatch::Dispatcher;
pub use error::EngineError;
pub use handler::{Handler, HandlerContext, HandlerOutcome, HandlerRegistry, RetryMeLater, RetryMeLaterError};
pub use pickups::PickupMonitor;
pub use scheduler::{ScheduleSpec, schedule, schedule_listening};
pub use settings::EngineSettings;
