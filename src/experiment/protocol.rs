//! Experiment protocols and their registry.
//!
//! A protocol is the experiment-specific part of a job: five hooks the
//! lifecycle calls in a fixed order. The lifecycle itself (states, budgets,
//! pause/resume, fault handling) lives in [`crate::experiment::job`] and is
//! shared by every protocol.
//!
//! ```text
//! setup ──▶ { run ──▶ organize }* ──▶ shutdown
//!   │            │
//!   └── fault ───┴──▶ on_error ──▶ shutdown
//! ```
//!
//! `shutdown` is called exactly once per worker session, whatever ended it,
//! and must leave the hardware released and zeroed.

use crate::data::{DataSet, ParameterSet, StreamAccumulator};
use crate::error::{JobError, JobResult};
use crate::hardware::HardwarePool;
use crate::worker::StopToken;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Everything a hook may touch during one call.
///
/// Fields are public so a hook can borrow several of them at once.
pub struct ExpContext<'a> {
    /// Job name (for logging)
    pub job: &'a str,
    /// Parameters as of this session's start
    pub params: &'a ParameterSet,
    /// Shared instruments
    pub hardware: &'a HardwarePool,
    /// The job's slot accumulator
    pub accumulator: &'a mut StreamAccumulator,
    /// Working data set, published after `organize`
    pub data: &'a mut DataSet,
    /// `true` when this session continues kept progress
    pub resumed: bool,
    /// Ticks completed so far
    pub idx_run: u64,
    /// Run time so far
    pub time_run: Duration,
    /// Stop flag of the worker; long waits should use `stop.wait`
    pub stop: &'a StopToken,
}

impl ExpContext<'_> {
    /// Shape the accumulator for this session.
    ///
    /// On a resumed session with an unchanged shape the sums are kept;
    /// otherwise storage is reallocated and zeroed.
    pub fn prepare_accumulator(&mut self, slots: usize, width: usize) -> JobResult<bool> {
        if self.resumed {
            self.accumulator.ensure_shape(slots, width)
        } else {
            self.accumulator.configure(slots, width)?;
            Ok(true)
        }
    }
}

/// The experiment-specific hooks of a job.
pub trait ExperimentProtocol: Send {
    /// Registry key (e.g. "dummy")
    fn kind(&self) -> &'static str;

    /// Parameters the protocol understands, with defaults
    fn default_parameters(&self) -> ParameterSet {
        ParameterSet::new()
    }

    /// Configure hardware and the accumulator. Runs once per session.
    fn setup(&mut self, ctx: &mut ExpContext<'_>) -> Result<()>;

    /// Acquire one chunk and fold it into the accumulator.
    fn run(&mut self, ctx: &mut ExpContext<'_>) -> Result<()>;

    /// Recompute `ctx.data` from the accumulator.
    fn organize(&mut self, ctx: &mut ExpContext<'_>) -> Result<()>;

    /// Release and zero the hardware.
    fn shutdown(&mut self, ctx: &mut ExpContext<'_>) -> Result<()>;

    /// Best-effort recovery after a fault; runs before `shutdown`.
    fn on_error(&mut self, _ctx: &mut ExpContext<'_>, _fault: &JobError) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh protocol instance.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn ExperimentProtocol> + Send + Sync>;

/// Protocol kinds available to descriptors.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    factories: BTreeMap<String, ProtocolFactory>,
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProtocolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in protocols.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::protocols::register_builtin(&mut registry);
        registry
    }

    /// Register (or replace) a kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ExperimentProtocol> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Instantiate a kind.
    pub fn create(&self, kind: &str) -> JobResult<Box<dyn ExperimentProtocol>> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| JobError::UnknownProtocol(kind.to_string()))
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds in order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
