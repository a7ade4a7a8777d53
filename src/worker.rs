//! Dedicated-thread tick loop with cooperative cancellation.
//!
//! A [`StoppableWorker`] drives a [`Routine`] on its own OS thread:
//!
//! ```text
//! begin() ──> tick() ─┬─> wait(tick_interval) ──> tick() ...
//!                     │
//!       stop flag / budget / Finished / error / panic
//!                     │
//!                     └─> finish(exit)        (always, exactly once)
//! ```
//!
//! Cancellation is a polled flag, never forced termination: the flag is
//! checked before every tick and the inter-tick sleep wakes as soon as a stop
//! is requested, so cancellation latency is bounded by one tick. Errors and
//! panics raised by `begin`/`tick` end the loop with [`WorkerExit::Faulted`];
//! `finish` still runs and the thread exits.
//!
//! `stop(timeout)` is a bounded join. A worker that does not exit in time is
//! reported as [`StopOutcome::TimedOut`] and logged; the caller must treat it
//! as possibly still running.

use crate::error::JobResult;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const JOIN_POLL: Duration = Duration::from_millis(1);

/// Cooperative cancel flag shared between a worker thread and its controllers.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<StopSignal>,
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl StopToken {
    /// A fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Raise the flag and wake any sleeper.
    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    /// Sleep up to `timeout`, returning early once a stop is requested.
    ///
    /// Returns `true` if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stop_requested() || timeout.is_zero() {
            return self.is_stop_requested();
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_stop_requested() {
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_stop_requested()
    }
}

/// What a tick asks the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    /// Keep ticking.
    Continue,
    /// The routine is complete.
    Finished,
}

/// Where a fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Inside `Routine::begin`.
    Begin,
    /// Inside `Routine::tick`.
    Tick,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Begin => write!(f, "begin"),
            Phase::Tick => write!(f, "tick"),
        }
    }
}

/// Why the tick loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The stop flag was raised.
    Stopped,
    /// The iteration budget ran out.
    Exhausted,
    /// A tick returned [`TickFlow::Finished`].
    Finished,
    /// `begin` or `tick` returned an error or panicked.
    Faulted {
        /// Failing phase.
        phase: Phase,
        /// Rendered error or panic message.
        message: String,
    },
}

/// Result of a bounded stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No thread was running.
    NotRunning,
    /// The thread exited and was joined.
    Joined,
    /// The thread did not exit in time and may still be running.
    TimedOut,
    /// Called from the worker's own thread; the flag is raised but not joined.
    SelfStop,
}

/// Work driven by a [`StoppableWorker`].
pub trait Routine: Send + 'static {
    /// Runs once before the first tick.
    fn begin(&mut self, _stop: &StopToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// One iteration. Long operations should poll `stop`.
    fn tick(&mut self, stop: &StopToken) -> anyhow::Result<TickFlow>;

    /// Runs exactly once after the loop ends, whatever the reason.
    fn finish(&mut self, _exit: &WorkerExit) {}
}

/// Runs a [`Routine`] on a dedicated thread until stopped.
pub struct StoppableWorker {
    name: String,
    tick_interval: Duration,
    stop: Mutex<StopToken>,
    alive: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for StoppableWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoppableWorker")
            .field("name", &self.name)
            .field("tick_interval", &self.tick_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clears the alive flag when the thread body unwinds or returns.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl StoppableWorker {
    /// Create an idle worker. The thread is named `name`.
    pub fn new(name: impl Into<String>, tick_interval: Duration) -> Self {
        Self {
            name: name.into(),
            tick_interval,
            stop: Mutex::new(StopToken::new()),
            alive: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread body has not yet returned.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Token of the current (or last) run.
    pub fn stop_token(&self) -> StopToken {
        self.stop.lock().clone()
    }

    /// Spawn the loop. Idempotent: returns `Ok(false)` if already running,
    /// in which case `routine` is dropped unused.
    ///
    /// `budget` caps the number of ticks for this run.
    pub fn start<R: Routine>(&self, routine: R, budget: Option<u64>) -> JobResult<bool> {
        let mut handle = self.handle.lock();
        if self.is_running() {
            debug!(worker = %self.name, "start ignored, worker already running");
            return Ok(false);
        }
        if let Some(previous) = handle.take() {
            if previous.join().is_err() {
                error!(worker = %self.name, "previous worker thread panicked");
            }
        }

        let token = StopToken::new();
        *self.stop.lock() = token.clone();
        self.alive.store(true, Ordering::SeqCst);

        let alive = AliveGuard(Arc::clone(&self.alive));
        let name = self.name.clone();
        let interval = self.tick_interval;
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _alive = alive;
                run_loop(&name, routine, &token, interval, budget);
            });

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                debug!(worker = %self.name, ?budget, "worker started");
                Ok(true)
            }
            Err(err) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Raise the stop flag without waiting.
    pub fn request_stop(&self) {
        self.stop.lock().request_stop();
    }

    /// Raise the stop flag and wait up to `timeout` for the thread to exit.
    pub fn stop(&self, timeout: Duration) -> StopOutcome {
        let was_running = self.is_running();
        self.request_stop();

        let mut handle = self.handle.lock();
        let Some(join) = handle.as_ref() else {
            return StopOutcome::NotRunning;
        };
        if join.thread().id() == thread::current().id() {
            debug!(worker = %self.name, "stop from own thread, not joining");
            return StopOutcome::SelfStop;
        }

        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not exit before timeout, possibly still running"
                );
                return StopOutcome::TimedOut;
            }
            thread::sleep(JOIN_POLL);
        }

        if let Some(join) = handle.take() {
            if join.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
        if was_running {
            StopOutcome::Joined
        } else {
            StopOutcome::NotRunning
        }
    }
}

fn run_loop<R: Routine>(
    name: &str,
    mut routine: R,
    stop: &StopToken,
    interval: Duration,
    budget: Option<u64>,
) {
    let exit = drive(&mut routine, stop, interval, budget);
    debug!(worker = name, ?exit, "worker loop ended");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| routine.finish(&exit))) {
        error!(
            worker = name,
            panic = %panic_message(payload.as_ref()),
            "worker finish panicked"
        );
    }
}

fn drive<R: Routine>(
    routine: &mut R,
    stop: &StopToken,
    interval: Duration,
    budget: Option<u64>,
) -> WorkerExit {
    if let Err(message) = guarded(|| routine.begin(stop)) {
        return WorkerExit::Faulted {
            phase: Phase::Begin,
            message,
        };
    }

    let mut iterations: u64 = 0;
    loop {
        if stop.is_stop_requested() {
            return WorkerExit::Stopped;
        }
        if budget.is_some_and(|limit| iterations >= limit) {
            return WorkerExit::Exhausted;
        }
        match guarded(|| routine.tick(stop)) {
            Ok(TickFlow::Continue) => {}
            Ok(TickFlow::Finished) => return WorkerExit::Finished,
            Err(message) => {
                return WorkerExit::Faulted {
                    phase: Phase::Tick,
                    message,
                }
            }
        }
        iterations += 1;
        stop.wait(interval);
    }
}

/// Run `f`, folding both an `Err` and a panic into a rendered message.
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
