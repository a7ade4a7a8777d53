//! # DAQ Jobs
//!
//! Scheduling and lifecycle core for lab measurement jobs. A station has one
//! set of instruments (a segmented digitizer, a pulse sequencer, a few
//! continuous sources) and many measurements that want to use them. This
//! crate runs those measurements one at a time, highest priority first, and
//! lets a more urgent job preempt a running one without losing its
//! accumulated data.
//!
//! ## Crate Structure
//!
//! - **`worker`**: `StoppableWorker`, a named thread that repeats a routine
//!   until it finishes, fails, or is asked to stop, with a bounded join.
//! - **`experiment`**: the job lifecycle state machine (`Job`, `JobState`),
//!   the protocol hooks every measurement implements, and the
//!   priority-preemptive `JobManager`.
//! - **`data`**: `StreamAccumulator` (per-slot running sums of digitizer
//!   segments) and the parameter, data and state sets jobs publish.
//! - **`hardware`**: capability traits for the instruments, the shared
//!   `HardwarePool`, and simulated devices.
//! - **`protocols`**: built-in measurements (`dummy`, `pulsed_readout`).
//! - **`control`**: `ControlPanel`, a name-addressed facade for front ends.
//! - **`config`**, **`logging`**, **`error`**: layered configuration,
//!   tracing setup and the crate error type.

pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod protocols;
pub mod worker;

pub use control::{ControlPanel, JobSnapshot};
pub use error::{JobError, JobResult};
pub use experiment::{Job, JobBuilder, JobManager, JobState};
