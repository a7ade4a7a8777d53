//! Job lifecycle and scheduling.
//!
//! - [`state`]: lifecycle states and the transition table
//! - [`protocol`]: the hooks a measurement implements, plus the kind registry
//! - [`job`]: a protocol bound to parameters, data and a worker thread
//! - [`manager`]: the priority-preemptive scheduler

pub mod job;
pub mod manager;
pub mod protocol;
pub mod state;

pub use job::{Job, JobBuilder, DEFAULT_TICK_INTERVAL};
pub use manager::JobManager;
pub use protocol::{ExpContext, ExperimentProtocol, ProtocolFactory, ProtocolRegistry};
pub use state::JobState;
