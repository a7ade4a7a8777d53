//! Priority-preemptive job scheduler.
//!
//! [`JobManager`] keeps one waiting queue (descending priority, stable on
//! ties) and at most one running job. Its own [`StoppableWorker`] runs a poll
//! loop; each pass does:
//!
//! 1. If the running job's worker has exited (done, error, stop, pause), free
//!    the slot.
//! 2. If nothing is running, pop the queue head and start it.
//! 3. If the queue head has a **strictly** higher priority than the running
//!    job, pause the running job, put it back at the front of the queue and
//!    start the head.
//!
//! Equal priorities never preempt each other. A new job is started only after
//! the previous job's worker has exited, so its `shutdown` hook has returned
//! before the next `setup` begins.
//!
//! Control calls never wait for a job's worker while holding the schedule
//! lock. `pause` and `remove` raise the job's stop flag and mark the running
//! slot as retiring; the slot is freed on the first pass after the worker has
//! actually exited. A preempting pass waits for the exit itself, but outside
//! the lock, so `submit` and pollers stay responsive while a hook finishes.

use crate::config::SchedulerConfig;
use crate::error::JobResult;
use crate::experiment::job::Job;
use crate::experiment::state::JobState;
use crate::worker::{Routine, StopOutcome, StopToken, StoppableWorker, TickFlow};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happens to the running job once its worker has exited.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum OnExit {
    /// Free the slot.
    #[default]
    Release,
    /// Preempted: back to the front of the queue.
    Requeue,
    /// Removed: return it to `idle`.
    Discard,
}

#[derive(Default)]
struct Schedule {
    queue: Vec<Arc<Job>>,
    running: Option<Arc<Job>>,
    /// The running job was asked to exit but has not yet.
    retiring: bool,
    on_exit: OnExit,
}

impl Schedule {
    fn is_running(&self, job: &Arc<Job>) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(running, job))
    }

    fn queue_position(&self, job: &Arc<Job>) -> Option<usize> {
        self.queue.iter().position(|queued| Arc::ptr_eq(queued, job))
    }

    fn sort(&mut self) {
        self.queue.sort_by_key(|job| Reverse(job.priority()));
    }

    fn requeue_front(&mut self, job: Arc<Job>) {
        if job.state() == JobState::Wait && self.queue_position(&job).is_none() {
            self.queue.insert(0, job);
            self.sort();
        }
    }

    fn retire(&mut self, on_exit: OnExit) {
        self.retiring = true;
        self.on_exit = on_exit;
    }

    /// Free the running slot if its worker has exited.
    fn free_exited(&mut self) {
        let exited = self.running.as_ref().is_some_and(|job| !job.is_active());
        if !exited {
            return;
        }
        if let Some(job) = self.running.take() {
            info!(job = %job.name(), state = %job.state(), idx_run = job.idx_run(), "slot freed");
            match self.on_exit {
                OnExit::Release => {}
                OnExit::Requeue => self.requeue_front(job),
                OnExit::Discard => job.discard(),
            }
        }
        self.retiring = false;
        self.on_exit = OnExit::Release;
    }
}

struct Scheduler {
    schedule: Mutex<Schedule>,
    stop_timeout: Duration,
}

impl Scheduler {
    fn pass(&self) {
        let preempted = {
            let mut schedule = self.schedule.lock();
            schedule.free_exited();
            schedule.sort();

            if schedule.running.is_none() {
                self.start_next(&mut schedule);
                return;
            }
            if schedule.retiring {
                return;
            }

            let (Some(current), Some(head)) = (schedule.running.clone(), schedule.queue.first())
            else {
                return;
            };
            if head.priority() <= current.priority() {
                return;
            }

            info!(
                preempted = %current.name(),
                priority = current.priority(),
                by = %head.name(),
                by_priority = head.priority(),
                "preempting running job"
            );
            current.request_pause();
            schedule.retire(OnExit::Requeue);
            current
        };

        if preempted.wait_exit(self.stop_timeout) == StopOutcome::TimedOut {
            warn!(job = %preempted.name(), "preemption deferred until the job exits");
            return;
        }
        let mut schedule = self.schedule.lock();
        schedule.free_exited();
        if schedule.running.is_none() {
            self.start_next(&mut schedule);
        }
    }

    fn start_next(&self, schedule: &mut Schedule) {
        while !schedule.queue.is_empty() {
            let job = schedule.queue.remove(0);
            match job.launch() {
                Ok(true) => {
                    info!(job = %job.name(), priority = job.priority(), "job started");
                    schedule.running = Some(job);
                    return;
                }
                Ok(false) => {
                    debug!(job = %job.name(), "previous session still exiting, retry next poll");
                    schedule.queue.insert(0, job);
                    return;
                }
                Err(err) => {
                    error!(job = %job.name(), error = %err, "job could not be started, dropped from queue");
                }
            }
        }
    }
}

struct SchedulerLoop {
    scheduler: Arc<Scheduler>,
}

impl Routine for SchedulerLoop {
    fn tick(&mut self, _stop: &StopToken) -> anyhow::Result<TickFlow> {
        self.scheduler.pass();
        Ok(TickFlow::Continue)
    }
}

/// The scheduler service.
///
/// Construct one per hardware station and share it by reference; jobs are
/// identified by `Arc` identity.
pub struct JobManager {
    scheduler: Arc<Scheduler>,
    worker: StoppableWorker,
}

impl JobManager {
    /// Manager polling every `poll_interval`; preemption and shutdown wait up
    /// to `stop_timeout` for a job to exit.
    pub fn new(poll_interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            scheduler: Arc::new(Scheduler {
                schedule: Mutex::new(Schedule::default()),
                stop_timeout,
            }),
            worker: StoppableWorker::new("job-manager", poll_interval),
        }
    }

    /// Manager from the `[scheduler]` config section.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.poll_interval(), config.stop_timeout())
    }

    /// Bounded wait used when preempting or shutting down jobs.
    pub fn stop_timeout(&self) -> Duration {
        self.scheduler.stop_timeout
    }

    /// Start the poll loop. Idempotent.
    pub fn start(&self) -> JobResult<bool> {
        let started = self.worker.start(
            SchedulerLoop {
                scheduler: Arc::clone(&self.scheduler),
            },
            None,
        )?;
        if started {
            info!("job manager started");
        }
        Ok(started)
    }

    /// Stop the poll loop. Jobs keep their current state.
    pub fn stop(&self, timeout: Duration) -> StopOutcome {
        let outcome = self.worker.stop(timeout);
        info!(?outcome, "job manager stopped");
        outcome
    }

    /// Whether the poll loop is alive.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Run one scheduling pass on the caller's thread.
    pub fn poll_once(&self) {
        self.scheduler.pass();
    }

    /// Queue a job. No-op (returns `false`) if it is already queued or running.
    ///
    /// A job still exiting after a `pause` is put back in the queue once its
    /// worker has exited, and resumes with its kept progress.
    pub fn submit(&self, job: &Arc<Job>) -> bool {
        let mut schedule = self.scheduler.schedule.lock();
        schedule.free_exited();
        if schedule.is_running(job) {
            if schedule.retiring && schedule.on_exit == OnExit::Release {
                schedule.on_exit = OnExit::Requeue;
                info!(job = %job.name(), "resubmitted while pausing, requeued on exit");
                return true;
            }
            debug!(job = %job.name(), "already running, submit ignored");
            return false;
        }
        if schedule.queue_position(job).is_some() {
            debug!(job = %job.name(), "already queued, submit ignored");
            return false;
        }
        if !job.enqueue() {
            debug!(job = %job.name(), state = %job.state(), "job not submittable");
            return false;
        }
        schedule.queue.push(Arc::clone(job));
        schedule.sort();
        info!(
            job = %job.name(),
            priority = job.priority(),
            queued = schedule.queue.len(),
            "job submitted"
        );
        true
    }

    /// Stop and discard a job: the running job is asked to stop, a queued
    /// job is dropped from the queue. Either way it ends `idle`; a running
    /// job gets there once its worker exits.
    ///
    /// Unknown jobs are ignored (returns `false`).
    pub fn remove(&self, job: &Arc<Job>) -> bool {
        let mut schedule = self.scheduler.schedule.lock();
        if schedule.is_running(job) {
            job.request_stop();
            schedule.retire(OnExit::Discard);
            schedule.free_exited();
            info!(job = %job.name(), "running job removed");
            return true;
        }
        if let Some(position) = schedule.queue_position(job) {
            let job = schedule.queue.remove(position);
            job.request_stop();
            info!(job = %job.name(), "queued job removed");
            return true;
        }
        debug!(job = %job.name(), "remove of unscheduled job ignored");
        false
    }

    /// Hold a job in `wait` outside the queue, keeping its progress.
    ///
    /// A running job is asked to pause and reaches `wait` once its worker
    /// exits. Resubmitting resumes it. Returns `false` for unscheduled jobs.
    pub fn pause(&self, job: &Arc<Job>) -> bool {
        let mut schedule = self.scheduler.schedule.lock();
        if schedule.is_running(job) {
            job.request_pause();
            schedule.retire(OnExit::Release);
            schedule.free_exited();
            return true;
        }
        if let Some(position) = schedule.queue_position(job) {
            let job = schedule.queue.remove(position);
            job.set_tokeep(true);
            info!(job = %job.name(), "queued job held");
            return true;
        }
        false
    }

    /// Stop the poll loop, stop the running job and return queued jobs to `idle`.
    pub fn shutdown(&self, timeout: Duration) -> StopOutcome {
        let outcome = self.stop(timeout);
        let (running, queued) = {
            let mut schedule = self.scheduler.schedule.lock();
            schedule.retiring = false;
            schedule.on_exit = OnExit::Release;
            (schedule.running.take(), std::mem::take(&mut schedule.queue))
        };
        if let Some(job) = running {
            if job.stop(timeout) == StopOutcome::TimedOut {
                error!(job = %job.name(), "job still running after shutdown");
            }
        }
        for job in queued {
            job.request_stop();
        }
        outcome
    }

    /// The running job.
    pub fn running(&self) -> Option<Arc<Job>> {
        self.scheduler.schedule.lock().running.clone()
    }

    /// Queued jobs, head first.
    pub fn queued(&self) -> Vec<Arc<Job>> {
        self.scheduler.schedule.lock().queue.clone()
    }

    /// Whether the job is running (or still exiting) or queued.
    pub fn is_scheduled(&self, job: &Arc<Job>) -> bool {
        let schedule = self.scheduler.schedule.lock();
        schedule.is_running(job) || schedule.queue_position(job).is_some()
    }

    /// Nothing running and nothing queued.
    pub fn is_idle(&self) -> bool {
        let schedule = self.scheduler.schedule.lock();
        schedule.running.is_none() && schedule.queue.is_empty()
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.worker.request_stop();
    }
}
