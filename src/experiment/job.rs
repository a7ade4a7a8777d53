//! Jobs: a protocol plus the lifecycle that drives it.
//!
//! A [`Job`] owns its parameters, its published [`DataSet`], its accumulator
//! and one [`StoppableWorker`]. The scheduler moves it through the states in
//! [`JobState`]; the job's own thread runs the protocol hooks:
//!
//! - **begin**: reset progress unless `tokeep`, then `setup`; success moves
//!   `wait -> run`, failure is a setup fault
//! - **tick**: `run`, bump `idx_run`/`time_run`, `organize`, publish data
//! - **finish**: `on_error` (faults only), then `shutdown`, then the final
//!   state: `error` on fault, `done` when the budget is spent, `wait` when
//!   paused with `tokeep`, `idle` otherwise
//!
//! Poll readers ([`Job::state_set`], [`Job::data_set`]) only take a short read
//! lock on the published state and never wait for a hook to return.

use crate::data::{DataSet, ParamValue, ParameterSet, StateSet, StreamAccumulator};
use crate::error::{JobError, JobResult};
use crate::experiment::protocol::{ExpContext, ExperimentProtocol};
use crate::experiment::state::JobState;
use crate::hardware::HardwarePool;
use crate::worker::{
    guarded, Phase, Routine, StopOutcome, StopToken, StoppableWorker, TickFlow, WorkerExit,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Default sleep between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for [`Job`].
pub struct JobBuilder {
    name: String,
    protocol: Box<dyn ExperimentProtocol>,
    params: ParameterSet,
    priority: i32,
    num_run: Option<u64>,
    time_stop: Option<Duration>,
    tick_interval: Duration,
    tokeep: bool,
}

impl JobBuilder {
    /// Start from the protocol's default parameters.
    pub fn new(name: impl Into<String>, protocol: Box<dyn ExperimentProtocol>) -> Self {
        let params = protocol.default_parameters();
        Self {
            name: name.into(),
            protocol,
            params,
            priority: 0,
            num_run: None,
            time_stop: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            tokeep: false,
        }
    }

    /// Scheduling priority (higher first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Stop after `num_run` ticks. Clears any time budget.
    pub fn with_num_run(mut self, num_run: u64) -> Self {
        self.num_run = Some(num_run);
        self.time_stop = None;
        self
    }

    /// Stop after `time_stop` of run time. Clears any tick budget.
    pub fn with_time_stop(mut self, time_stop: Duration) -> Self {
        self.time_stop = Some(time_stop);
        self.num_run = None;
        self
    }

    /// Overlay parameters on the defaults.
    pub fn with_parameters(mut self, params: &ParameterSet) -> Self {
        self.params.merge(params);
        self
    }

    /// Set one parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.set(name, value);
        self
    }

    /// Sleep between ticks.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Initial `tokeep` flag.
    pub fn with_tokeep(mut self, tokeep: bool) -> Self {
        self.tokeep = tokeep;
        self
    }

    /// Build the job around a shared hardware pool.
    pub fn build(self, hardware: Arc<HardwarePool>) -> Arc<Job> {
        let kind = self.protocol.kind().to_string();
        Arc::new(Job {
            worker: StoppableWorker::new(format!("job-{}", self.name), self.tick_interval),
            name: self.name,
            kind,
            hardware,
            core: RwLock::new(JobCore {
                priority: self.priority,
                state: JobState::Idle,
                idx_run: 0,
                num_run: self.num_run,
                time_run: Duration::ZERO,
                time_stop: self.time_stop,
                tokeep: self.tokeep,
                params: self.params,
                data: DataSet::new(),
                run_id: None,
                started_at: None,
                last_error: None,
            }),
            session: Mutex::new(Session {
                protocol: self.protocol,
                accumulator: StreamAccumulator::new(),
                working: DataSet::new(),
            }),
        })
    }
}

/// Published, pollable state.
struct JobCore {
    priority: i32,
    state: JobState,
    idx_run: u64,
    num_run: Option<u64>,
    time_run: Duration,
    time_stop: Option<Duration>,
    tokeep: bool,
    params: ParameterSet,
    data: DataSet,
    run_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl JobCore {
    fn budget_spent(&self) -> bool {
        self.num_run.is_some_and(|n| self.idx_run >= n)
            || self.time_stop.is_some_and(|limit| self.time_run >= limit)
    }

    fn set_state(&mut self, job: &str, next: JobState) {
        if self.state == next {
            return;
        }
        match self.state.transition(next) {
            Ok(next) => {
                debug!(job, from = %self.state, to = %next, "state change");
                self.state = next;
            }
            Err(err) => warn!(job, error = %err, "state change rejected"),
        }
    }
}

/// State only the worker thread touches while a session is active.
struct Session {
    protocol: Box<dyn ExperimentProtocol>,
    accumulator: StreamAccumulator,
    working: DataSet,
}

/// A schedulable measurement.
pub struct Job {
    name: String,
    kind: String,
    hardware: Arc<HardwarePool>,
    core: RwLock<JobCore>,
    session: Mutex<Session>,
    worker: StoppableWorker,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.read();
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &core.priority)
            .field("state", &core.state)
            .field("idx_run", &core.idx_run)
            .finish()
    }
}

impl Job {
    /// Job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Current priority.
    pub fn priority(&self) -> i32 {
        self.core.read().priority
    }

    /// Change the priority. Takes effect at the manager's next poll.
    pub fn set_priority(&self, priority: i32) {
        self.core.write().priority = priority;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.core.read().state
    }

    /// Whether progress survives the next start.
    pub fn tokeep(&self) -> bool {
        self.core.read().tokeep
    }

    /// Set `tokeep`.
    pub fn set_tokeep(&self, tokeep: bool) {
        self.core.write().tokeep = tokeep;
    }

    /// Ticks completed.
    pub fn idx_run(&self) -> u64 {
        self.core.read().idx_run
    }

    /// Run a fixed number of ticks. Clears any time budget.
    pub fn set_num_run(&self, num_run: u64) {
        let mut core = self.core.write();
        core.num_run = Some(num_run);
        core.time_stop = None;
    }

    /// Run for a wall-clock budget. Clears any tick budget.
    pub fn set_time_stop(&self, time_stop: Duration) {
        let mut core = self.core.write();
        core.time_stop = Some(time_stop);
        core.num_run = None;
    }

    /// Copy of the parameters.
    pub fn parameters(&self) -> ParameterSet {
        self.core.read().params.clone()
    }

    /// Set one parameter; a changed value discards kept progress.
    ///
    /// Hooks read parameters at setup, so the change applies from the next start.
    pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<ParamValue>) -> bool {
        let mut core = self.core.write();
        let changed = core.params.set(name, value);
        if changed {
            core.tokeep = false;
        }
        changed
    }

    /// Overlay several parameters; any change discards kept progress.
    pub fn set_parameters(&self, params: &ParameterSet) -> bool {
        let mut core = self.core.write();
        let changed = core.params.merge(params);
        if changed {
            core.tokeep = false;
        }
        changed
    }

    /// Scheduling snapshot.
    pub fn state_set(&self) -> StateSet {
        let core = self.core.read();
        StateSet {
            priority: core.priority,
            state: core.state,
            idx_run: core.idx_run,
            num_run: core.num_run,
            time_run: core.time_run.as_secs_f64(),
            time_stop: core.time_stop.map(|d| d.as_secs_f64()),
            tokeep: core.tokeep,
            run_id: core.run_id,
            started_at: core.started_at,
        }
    }

    /// Last published data.
    pub fn data_set(&self) -> DataSet {
        self.core.read().data.clone()
    }

    /// Message of the last fault, kept until the next start.
    pub fn last_error(&self) -> Option<String> {
        self.core.read().last_error.clone()
    }

    /// Whether the worker thread is alive.
    pub fn is_active(&self) -> bool {
        self.worker.is_running()
    }

    /// Move to `wait` for queueing. Returns `false` if the job is running.
    pub(crate) fn enqueue(&self) -> bool {
        let mut core = self.core.write();
        match core.state {
            JobState::Run => false,
            JobState::Done => {
                core.tokeep = false;
                core.set_state(&self.name, JobState::Wait);
                true
            }
            _ => {
                core.set_state(&self.name, JobState::Wait);
                true
            }
        }
    }

    /// Spawn the worker for a queued job.
    ///
    /// Returns `Ok(false)` if a previous worker thread has not exited yet.
    pub(crate) fn launch(self: &Arc<Self>) -> JobResult<bool> {
        let budget = {
            let core = self.core.read();
            if core.state != JobState::Wait {
                return Err(JobError::IllegalTransition {
                    from: core.state.to_string(),
                    to: JobState::Run.to_string(),
                });
            }
            core.num_run.map(|n| {
                if core.tokeep {
                    n.saturating_sub(core.idx_run)
                } else {
                    n
                }
            })
        };
        self.worker.start(JobRoutine::new(Arc::clone(self)), budget)
    }

    /// Raise the stop flag keeping progress (`tokeep = true`), without waiting.
    ///
    /// Returns `false` if no worker is running.
    pub fn request_pause(&self) -> bool {
        if !self.worker.is_running() {
            return false;
        }
        self.core.write().tokeep = true;
        info!(job = %self.name, "pause requested");
        self.worker.request_stop();
        true
    }

    /// Raise the stop flag discarding progress (`tokeep = false`), without
    /// waiting. A waiting job moves to `idle` immediately.
    ///
    /// Returns `false` if no worker is running.
    pub fn request_stop(&self) -> bool {
        {
            let mut core = self.core.write();
            core.tokeep = false;
            if !self.worker.is_running() {
                if core.state == JobState::Wait {
                    core.set_state(&self.name, JobState::Idle);
                }
                return false;
            }
        }
        info!(job = %self.name, "stop requested");
        self.worker.request_stop();
        true
    }

    /// Wait up to `timeout` for the worker to exit after a pause or stop request.
    pub fn wait_exit(&self, timeout: Duration) -> StopOutcome {
        self.worker.stop(timeout)
    }

    /// Cooperative stop that keeps progress (`tokeep = true`).
    ///
    /// The worker's exit moves the job to `wait`.
    pub fn pause(&self, timeout: Duration) -> StopOutcome {
        if !self.request_pause() {
            return StopOutcome::NotRunning;
        }
        self.wait_exit(timeout)
    }

    /// Cooperative stop that discards progress (`tokeep = false`).
    ///
    /// A running job reaches `idle` when its worker exits; a waiting job
    /// moves to `idle` immediately.
    pub fn stop(&self, timeout: Duration) -> StopOutcome {
        if !self.request_stop() {
            return StopOutcome::NotRunning;
        }
        self.wait_exit(timeout)
    }

    /// Return a finished or failed job to `idle`.
    pub(crate) fn discard(&self) {
        let mut core = self.core.write();
        core.tokeep = false;
        if core.state.is_terminal() {
            core.set_state(&self.name, JobState::Idle);
        }
    }
}

/// The lifecycle, run on the job's worker thread.
struct JobRoutine {
    job: Arc<Job>,
    params: ParameterSet,
    stop: StopToken,
    clock_origin: Instant,
    resumed: bool,
    hook: &'static str,
}

impl JobRoutine {
    fn new(job: Arc<Job>) -> Self {
        Self {
            job,
            params: ParameterSet::new(),
            stop: StopToken::new(),
            clock_origin: Instant::now(),
            resumed: false,
            hook: "setup",
        }
    }

    /// Lend the protocol a context over the session state.
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn ExperimentProtocol>, &mut ExpContext<'_>) -> T,
    ) -> T {
        let (idx_run, time_run) = {
            let core = self.job.core.read();
            (core.idx_run, core.time_run)
        };
        let mut guard = self.job.session.lock();
        let Session {
            protocol,
            accumulator,
            working,
        } = &mut *guard;
        let mut ctx = ExpContext {
            job: &self.job.name,
            params: &self.params,
            hardware: &self.job.hardware,
            accumulator,
            data: working,
            resumed: self.resumed,
            idx_run,
            time_run,
            stop: &self.stop,
        };
        f(protocol, &mut ctx)
    }

    fn fault(&self, phase: Phase, message: &str) -> JobError {
        match phase {
            Phase::Begin => JobError::SetupFailure {
                job: self.job.name.clone(),
                reason: message.to_string(),
            },
            Phase::Tick => JobError::RuntimeFault {
                job: self.job.name.clone(),
                phase: self.hook.to_string(),
                reason: message.to_string(),
            },
        }
    }
}

impl Routine for JobRoutine {
    fn begin(&mut self, stop: &StopToken) -> anyhow::Result<()> {
        self.stop = stop.clone();
        let time_run = {
            let mut core = self.job.core.write();
            self.resumed = core.tokeep;
            if !self.resumed {
                core.idx_run = 0;
                core.time_run = Duration::ZERO;
                core.data.clear();
            }
            core.run_id = Some(Uuid::new_v4());
            core.started_at = Some(Utc::now());
            core.last_error = None;
            self.params = core.params.clone();
            info!(
                job = %self.job.name,
                run_id = ?core.run_id,
                resumed = self.resumed,
                idx_run = core.idx_run,
                "session starting"
            );
            core.time_run
        };

        if !self.resumed {
            let mut session = self.job.session.lock();
            session.accumulator.reset();
            session.working.clear();
        }

        self.hook = "setup";
        self.with_session(|protocol, ctx| protocol.setup(ctx))?;

        self.clock_origin = Instant::now()
            .checked_sub(time_run)
            .unwrap_or_else(Instant::now);
        self.job
            .core
            .write()
            .set_state(&self.job.name, JobState::Run);
        Ok(())
    }

    fn tick(&mut self, _stop: &StopToken) -> anyhow::Result<TickFlow> {
        if self.job.core.read().budget_spent() {
            return Ok(TickFlow::Finished);
        }

        self.hook = "run";
        self.with_session(|protocol, ctx| protocol.run(ctx))?;

        let elapsed = self.clock_origin.elapsed();
        {
            let mut core = self.job.core.write();
            core.idx_run += 1;
            core.time_run = elapsed;
            trace!(job = %self.job.name, idx_run = core.idx_run, "tick");
        }

        self.hook = "organize";
        let job = &self.job;
        self.with_session(|protocol, ctx| {
            protocol.organize(ctx)?;
            job.core.write().data.publish_from(ctx.data);
            anyhow::Ok(())
        })?;

        if self.job.core.read().budget_spent() {
            Ok(TickFlow::Finished)
        } else {
            Ok(TickFlow::Continue)
        }
    }

    fn finish(&mut self, exit: &WorkerExit) {
        let name = self.job.name.clone();
        let fault = match exit {
            WorkerExit::Faulted { phase, message } => Some(self.fault(*phase, message)),
            _ => None,
        };

        if let Some(err) = &fault {
            error!(job = %name, error = %err, "job faulted");
            self.hook = "on_error";
            let handled = guarded(|| self.with_session(|protocol, ctx| protocol.on_error(ctx, err)));
            if let Err(message) = handled {
                warn!(job = %name, error = %message, "error handler failed");
            }
        }

        self.hook = "shutdown";
        let released = guarded(|| self.with_session(|protocol, ctx| protocol.shutdown(ctx)));
        if let Err(message) = released {
            error!(job = %name, error = %message, "shutdown failed");
        }

        let mut core = self.job.core.write();
        let next = if let Some(err) = fault {
            core.tokeep = false;
            core.last_error = Some(err.to_string());
            JobState::Error
        } else if core.budget_spent() {
            core.tokeep = false;
            JobState::Done
        } else if core.tokeep {
            JobState::Wait
        } else {
            JobState::Idle
        };
        core.set_state(&name, next);
        info!(
            job = %name,
            state = %core.state,
            idx_run = core.idx_run,
            time_run_s = core.time_run.as_secs_f64(),
            "session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedLab;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Calls {
        setup: AtomicUsize,
        run: AtomicUsize,
        shutdown: AtomicUsize,
        on_error: AtomicUsize,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Calls>,
        fail_setup: bool,
        fail_at: Option<u64>,
        panic_at: Option<u64>,
    }

    impl ExperimentProtocol for Recorder {
        fn kind(&self) -> &'static str {
            "recorder"
        }

        fn default_parameters(&self) -> ParameterSet {
            ParameterSet::new().with("gain", 1.0)
        }

        fn setup(&mut self, ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            self.calls.setup.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                bail!("no card");
            }
            ctx.prepare_accumulator(1, 1)?;
            Ok(())
        }

        fn run(&mut self, ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            self.calls.run.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(ctx.idx_run) {
                bail!("buffer overrun");
            }
            if self.panic_at == Some(ctx.idx_run) {
                panic!("boom");
            }
            ctx.accumulator.ingest(&[ctx.params.get_f64("gain")?])?;
            Ok(())
        }

        fn organize(&mut self, ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            ctx.data
                .set_scalar("count", ctx.accumulator.counts()[0] as f64);
            Ok(())
        }

        fn shutdown(&mut self, _ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            self.calls.shutdown.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&mut self, _ctx: &mut ExpContext<'_>, _fault: &JobError) -> anyhow::Result<()> {
            self.calls.on_error.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn build(recorder: Recorder, configure: impl FnOnce(JobBuilder) -> JobBuilder) -> Arc<Job> {
        let builder = JobBuilder::new("recorder", Box::new(recorder))
            .with_tick_interval(Duration::from_millis(1));
        configure(builder).build(SimulatedLab::new(0).pool())
    }

    fn start(job: &Arc<Job>) {
        assert!(job.enqueue());
        assert!(job.launch().unwrap());
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_exit(job: &Arc<Job>) {
        wait_until("worker exit", || !job.is_active());
    }

    #[test]
    fn test_runs_to_budget() {
        let recorder = Recorder::default();
        let calls = Arc::clone(&recorder.calls);
        let job = build(recorder, |b| b.with_num_run(5));

        start(&job);
        wait_exit(&job);

        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.idx_run(), 5);
        assert!(!job.tokeep());
        let data = job.data_set();
        assert_eq!(data.revision(), 5);
        assert_eq!(data.scalar("count"), Some(5.0));
        assert_eq!(calls.setup.load(Ordering::SeqCst), 1);
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 1);
        assert_eq!(calls.on_error.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_budget_is_done_without_ticks() {
        let recorder = Recorder::default();
        let calls = Arc::clone(&recorder.calls);
        let job = build(recorder, |b| b.with_num_run(0));

        start(&job);
        wait_exit(&job);

        assert_eq!(job.state(), JobState::Done);
        assert_eq!(calls.run.load(Ordering::SeqCst), 0);
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_time_budget() {
        let job = build(Recorder::default(), |b| {
            b.with_time_stop(Duration::from_millis(30))
        });

        start(&job);
        wait_exit(&job);

        let state = job.state_set();
        assert_eq!(state.state, JobState::Done);
        assert!(state.time_run >= 0.03);
        assert_eq!(state.num_run, None);
    }

    #[test]
    fn test_setup_failure_is_an_error() {
        let recorder = Recorder {
            fail_setup: true,
            ..Default::default()
        };
        let calls = Arc::clone(&recorder.calls);
        let job = build(recorder, |b| b.with_num_run(5));

        start(&job);
        wait_exit(&job);

        assert_eq!(job.state(), JobState::Error);
        assert_eq!(job.idx_run(), 0);
        assert!(job.last_error().unwrap().contains("no card"));
        assert_eq!(calls.run.load(Ordering::SeqCst), 0);
        assert_eq!(calls.on_error.load(Ordering::SeqCst), 1);
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runtime_fault_keeps_published_data() {
        let recorder = Recorder {
            fail_at: Some(2),
            ..Default::default()
        };
        let calls = Arc::clone(&recorder.calls);
        let job = build(recorder, |b| b.with_num_run(10));

        start(&job);
        wait_exit(&job);

        assert_eq!(job.state(), JobState::Error);
        assert_eq!(job.idx_run(), 2);
        assert_eq!(job.data_set().scalar("count"), Some(2.0));
        let message = job.last_error().unwrap();
        assert!(message.contains("run"), "{}", message);
        assert!(message.contains("buffer overrun"), "{}", message);
        assert_eq!(calls.on_error.load(Ordering::SeqCst), 1);
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_is_an_error() {
        let recorder = Recorder {
            panic_at: Some(1),
            ..Default::default()
        };
        let job = build(recorder, |b| b);

        start(&job);
        wait_exit(&job);

        assert_eq!(job.state(), JobState::Error);
        assert!(job.last_error().unwrap().contains("boom"));
    }

    #[test]
    fn test_pause_and_resume_keep_progress() {
        let recorder = Recorder::default();
        let calls = Arc::clone(&recorder.calls);
        let job = build(recorder, |b| b.with_num_run(200));

        start(&job);
        wait_until("three ticks", || job.idx_run() >= 3);
        assert_eq!(job.state(), JobState::Run);
        assert_eq!(job.pause(Duration::from_secs(2)), StopOutcome::Joined);

        let paused_at = job.idx_run();
        let run_id = job.state_set().run_id;
        assert_eq!(job.state(), JobState::Wait);
        assert!(job.tokeep());
        assert!(paused_at < 200);

        assert!(job.launch().unwrap());
        wait_exit(&job);

        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.idx_run(), 200);
        assert_eq!(job.data_set().scalar("count"), Some(200.0));
        assert_ne!(job.state_set().run_id, run_id);
        assert_eq!(calls.run.load(Ordering::SeqCst), 200);
        assert_eq!(calls.setup.load(Ordering::SeqCst), 2);
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_discards_progress_on_next_start() {
        let job = build(Recorder::default(), |b| b);

        start(&job);
        wait_until("two ticks", || job.idx_run() >= 2);
        assert_eq!(job.stop(Duration::from_secs(2)), StopOutcome::Joined);
        assert_eq!(job.state(), JobState::Idle);
        assert!(job.idx_run() >= 2);

        job.set_num_run(1);
        start(&job);
        wait_exit(&job);
        assert_eq!(job.idx_run(), 1);
        assert_eq!(job.data_set().scalar("count"), Some(1.0));
    }

    #[test]
    fn test_stop_of_waiting_job_goes_idle() {
        let job = build(Recorder::default(), |b| b);
        assert!(job.enqueue());
        assert_eq!(job.stop(Duration::from_millis(10)), StopOutcome::NotRunning);
        assert_eq!(job.state(), JobState::Idle);
    }

    #[test]
    fn test_parameter_change_clears_tokeep() {
        let job = build(Recorder::default(), |b| b.with_tokeep(true));
        assert!(!job.set_parameter("gain", 1.0));
        assert!(job.tokeep());

        assert!(job.set_parameter("gain", 2.5));
        assert!(!job.tokeep());
        assert_eq!(job.parameters().get_f64("gain").unwrap(), 2.5);
    }

    #[test]
    fn test_launch_requires_wait() {
        let job = build(Recorder::default(), |b| b);
        assert!(matches!(
            job.launch(),
            Err(JobError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_budget_setters_are_exclusive() {
        let job = build(Recorder::default(), |b| b.with_num_run(3));
        job.set_time_stop(Duration::from_secs(1));
        let state = job.state_set();
        assert_eq!(state.num_run, None);
        assert_eq!(state.time_stop, Some(1.0));

        job.set_num_run(4);
        assert_eq!(job.state_set().time_stop, None);
    }
}
