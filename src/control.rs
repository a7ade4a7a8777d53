//! Name-addressed control surface over the scheduler.
//!
//! [`ControlPanel`] is what a front end (the CLI, a remote service) talks to.
//! It turns [`JobDescriptor`]s into jobs through the [`ProtocolRegistry`],
//! keeps them by name and forwards lifecycle requests to the [`JobManager`].
//! Requests naming an unknown job are no-ops that return `false` / `None`.

use crate::config::JobDescriptor;
use crate::data::{DataSet, StateSet};
use crate::error::{JobError, JobResult};
use crate::experiment::{Job, JobBuilder, JobManager, ProtocolRegistry, DEFAULT_TICK_INTERVAL};
use crate::hardware::HardwarePool;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Point-in-time view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Job name
    pub name: String,
    /// Protocol kind
    pub protocol: String,
    /// Scheduling state
    pub state: StateSet,
    /// Last published data
    pub data: DataSet,
    /// When the snapshot was taken
    pub polled_at: DateTime<Utc>,
}

impl JobSnapshot {
    fn of(job: &Job) -> Self {
        Self {
            name: job.name().to_string(),
            protocol: job.kind().to_string(),
            state: job.state_set(),
            data: job.data_set(),
            polled_at: Utc::now(),
        }
    }
}

/// Jobs by name, on top of one manager and one hardware pool.
pub struct ControlPanel {
    manager: Arc<JobManager>,
    registry: ProtocolRegistry,
    hardware: Arc<HardwarePool>,
    tick_interval: Duration,
    jobs: RwLock<BTreeMap<String, Arc<Job>>>,
}

impl ControlPanel {
    /// Panel creating jobs from `registry` on `hardware`.
    pub fn new(
        manager: Arc<JobManager>,
        registry: ProtocolRegistry,
        hardware: Arc<HardwarePool>,
    ) -> Self {
        Self {
            manager,
            registry,
            hardware,
            tick_interval: DEFAULT_TICK_INTERVAL,
            jobs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Tick interval for jobs created from now on.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// The underlying manager.
    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// The protocol registry.
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Create or reconfigure the named job and queue it.
    ///
    /// A job that is already queued or running is left unchanged; a job still
    /// exiting after a pause is queued again once it has exited. An idle,
    /// held or finished job takes the descriptor's priority, budget and
    /// parameters before it is queued again; a parameter change discards
    /// kept progress. A descriptor without a budget keeps the job's current
    /// one, and one without `tokeep` keeps the job's flag, so a paused job
    /// resumes.
    ///
    /// The name table is never locked while the manager is called.
    pub fn submit(&self, descriptor: &JobDescriptor) -> JobResult<Arc<Job>> {
        let time_stop = check_budget(descriptor)?;
        let (job, created) = match self.job(&descriptor.name) {
            Some(job) => (job, false),
            None => self.create(descriptor, time_stop)?,
        };

        if !created {
            if job.kind() != descriptor.protocol {
                return Err(JobError::Configuration(format!(
                    "job '{}' already exists with protocol '{}'",
                    descriptor.name,
                    job.kind()
                )));
            }
            if self.manager.is_scheduled(&job) {
                debug!(job = %job.name(), "already scheduled, descriptor ignored");
                self.manager.submit(&job);
                return Ok(job);
            }
            if job.is_active() {
                debug!(job = %job.name(), "worker still exiting, descriptor ignored");
                return Ok(job);
            }
            job.set_priority(descriptor.priority);
            if let Some(num_run) = descriptor.num_run {
                job.set_num_run(num_run);
            }
            if let Some(time_stop) = time_stop {
                job.set_time_stop(time_stop);
            }
            if let Some(tokeep) = descriptor.tokeep {
                job.set_tokeep(tokeep);
            }
            job.set_parameters(&descriptor.params);
        }

        self.manager.submit(&job);
        Ok(job)
    }

    /// Build a job from `descriptor` and register its name. If another caller
    /// registered the name first, that job is returned instead.
    fn create(
        &self,
        descriptor: &JobDescriptor,
        time_stop: Option<Duration>,
    ) -> JobResult<(Arc<Job>, bool)> {
        let protocol = self.registry.create(&descriptor.protocol)?;
        let mut builder = JobBuilder::new(descriptor.name.clone(), protocol)
            .with_priority(descriptor.priority)
            .with_parameters(&descriptor.params)
            .with_tick_interval(self.tick_interval)
            .with_tokeep(descriptor.tokeep.unwrap_or(false));
        if let Some(num_run) = descriptor.num_run {
            builder = builder.with_num_run(num_run);
        }
        if let Some(time_stop) = time_stop {
            builder = builder.with_time_stop(time_stop);
        }
        let job = builder.build(Arc::clone(&self.hardware));

        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(&descriptor.name) {
            return Ok((Arc::clone(existing), false));
        }
        jobs.insert(descriptor.name.clone(), Arc::clone(&job));
        info!(job = %job.name(), protocol = %job.kind(), "job created");
        Ok((job, true))
    }

    /// Stop the job and forget it.
    pub fn remove(&self, name: &str) -> bool {
        let Some(job) = self.jobs.write().remove(name) else {
            return false;
        };
        self.discard(&job);
        info!(job = %name, "job forgotten");
        true
    }

    /// Pause the job, keeping its progress for a later resubmit.
    pub fn pause(&self, name: &str) -> bool {
        self.job(name).is_some_and(|job| self.manager.pause(&job))
    }

    /// Stop the job and discard its progress. The job stays known.
    pub fn stop(&self, name: &str) -> bool {
        let Some(job) = self.job(name) else {
            return false;
        };
        self.discard(&job);
        true
    }

    /// Stop a job without waiting for it and return it to `idle`, whether or
    /// not the manager still tracks it.
    fn discard(&self, job: &Arc<Job>) {
        if !self.manager.remove(job) {
            job.request_stop();
            job.discard();
        }
    }

    /// Snapshot of one job.
    pub fn poll(&self, name: &str) -> Option<JobSnapshot> {
        self.job(name).map(|job| JobSnapshot::of(&job))
    }

    /// Snapshots of every known job, by name.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.jobs
            .read()
            .values()
            .map(|job| JobSnapshot::of(job))
            .collect()
    }

    /// The named job.
    pub fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs.read().get(name).cloned()
    }

    /// Nothing queued, nothing running and no worker still exiting.
    pub fn all_settled(&self) -> bool {
        self.manager.is_idle() && self.jobs.read().values().all(|job| !job.is_active())
    }
}

fn check_budget(descriptor: &JobDescriptor) -> JobResult<Option<Duration>> {
    match (descriptor.num_run, descriptor.time_stop_s) {
        (Some(_), Some(_)) => Err(JobError::Configuration(format!(
            "job '{}' sets both num_run and time_stop_s",
            descriptor.name
        ))),
        (_, Some(seconds)) => Duration::try_from_secs_f64(seconds)
            .map(Some)
            .map_err(|_| {
                JobError::Configuration(format!(
                    "job '{}' has invalid time_stop_s {}",
                    descriptor.name, seconds
                ))
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ParameterSet;
    use crate::experiment::{ExpContext, ExperimentProtocol, JobState};
    use crate::hardware::mock::SimulatedLab;
    use std::thread;
    use std::time::Instant;

    /// A protocol whose `run` blocks without looking at the stop flag.
    struct Sluggish;

    impl ExperimentProtocol for Sluggish {
        fn kind(&self) -> &'static str {
            "sluggish"
        }

        fn setup(&mut self, ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            ctx.prepare_accumulator(1, 1)?;
            Ok(())
        }

        fn run(&mut self, ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(300));
            ctx.accumulator.ingest(&[1.0])?;
            Ok(())
        }

        fn organize(&mut self, ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            ctx.data
                .set_scalar("ticks", ctx.accumulator.total_ingested() as f64);
            Ok(())
        }

        fn shutdown(&mut self, _ctx: &mut ExpContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn panel() -> ControlPanel {
        let manager = Arc::new(JobManager::new(
            Duration::from_millis(5),
            Duration::from_secs(2),
        ));
        ControlPanel::new(
            manager,
            ProtocolRegistry::with_builtin(),
            SimulatedLab::new(1).pool(),
        )
        .with_tick_interval(Duration::from_millis(1))
    }

    fn dummy(name: &str, priority: i32) -> JobDescriptor {
        JobDescriptor::new(name, "dummy")
            .with_priority(priority)
            .with_num_run(3)
            .with_params(ParameterSet::new().with("dwell_ms", 0_i64).with("length", 8_i64))
    }

    #[test]
    fn test_submit_is_idempotent_while_scheduled() {
        let panel = panel();
        let first = panel.submit(&dummy("a", 1)).unwrap();
        let again = panel.submit(&dummy("a", 9)).unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.priority(), 1);
        assert_eq!(first.state(), JobState::Wait);
        assert_eq!(panel.manager().queued().len(), 1);
    }

    #[test]
    fn test_submit_rejects_bad_descriptors() {
        let panel = panel();
        let unknown = JobDescriptor::new("x", "rabi");
        assert!(matches!(
            panel.submit(&unknown),
            Err(JobError::UnknownProtocol(_))
        ));

        let mut both = dummy("y", 0);
        both.time_stop_s = Some(1.0);
        assert!(matches!(
            panel.submit(&both),
            Err(JobError::Configuration(_))
        ));

        panel.submit(&dummy("z", 0)).unwrap();
        let other_kind = JobDescriptor::new("z", "pulsed_readout");
        assert!(panel.submit(&other_kind).is_err());
        assert!(panel.poll("x").is_none());
    }

    #[test]
    fn test_unknown_names_are_noops() {
        let panel = panel();
        assert!(!panel.pause("ghost"));
        assert!(!panel.stop("ghost"));
        assert!(!panel.remove("ghost"));
        assert!(panel.poll("ghost").is_none());
        assert!(panel.list().is_empty());
    }

    #[test]
    fn test_stop_then_resubmit_reconfigures() {
        let panel = panel();
        let job = panel.submit(&dummy("a", 1)).unwrap();
        assert!(panel.stop("a"));
        assert_eq!(job.state(), JobState::Idle);
        assert!(panel.manager().is_idle());

        panel.submit(&dummy("a", 7)).unwrap();
        assert_eq!(job.priority(), 7);
        assert_eq!(job.state(), JobState::Wait);
    }

    #[test]
    fn test_run_to_completion_and_poll() {
        let panel = panel();
        panel.submit(&dummy("a", 1)).unwrap();
        panel.manager().start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while panel.poll("a").unwrap().state.state != JobState::Done {
            assert!(std::time::Instant::now() < deadline, "job did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }

        let snapshot = panel.poll("a").unwrap();
        assert_eq!(snapshot.state.idx_run, 3);
        assert_eq!(snapshot.data.revision(), 3);
        assert_eq!(snapshot.data.get("signal").map(<[f64]>::len), Some(8));
        assert_eq!(panel.list().len(), 1);

        panel.manager().shutdown(Duration::from_secs(1));
        assert!(panel.all_settled());
    }

    #[test]
    fn test_remove_forgets_job() {
        let panel = panel();
        let job = panel.submit(&dummy("a", 1)).unwrap();
        assert!(panel.remove("a"));
        assert!(panel.job("a").is_none());
        assert_eq!(job.state(), JobState::Idle);
        assert!(panel.manager().is_idle());
    }

    #[test]
    fn test_pause_then_resubmit_resumes_progress() {
        let panel = panel();
        let descriptor = JobDescriptor::new("a", "dummy")
            .with_priority(1)
            .with_num_run(500)
            .with_params(ParameterSet::new().with("dwell_ms", 1_i64).with("length", 8_i64));
        let job = panel.submit(&descriptor).unwrap();
        panel.manager().start().unwrap();

        wait_until("twenty ticks", || job.idx_run() >= 20);
        assert!(panel.pause("a"));
        wait_until("pause", || !job.is_active() && job.state() == JobState::Wait);
        assert!(job.tokeep());
        let kept = job.idx_run();

        panel.submit(&descriptor).unwrap();
        assert!(job.tokeep());
        let mut lowest_seen = u64::MAX;
        wait_until("resume", || {
            lowest_seen = lowest_seen.min(job.idx_run());
            job.idx_run() > kept
        });
        panel.manager().shutdown(Duration::from_secs(1));

        assert!(lowest_seen >= kept, "progress discarded: {} < {}", lowest_seen, kept);
    }

    #[test]
    fn test_descriptor_tokeep_only_overrides_when_set() {
        let panel = panel();
        let descriptor = dummy("a", 1);
        let job = panel.submit(&descriptor).unwrap();
        assert!(!job.tokeep());

        assert!(panel.pause("a"));
        assert!(job.tokeep());
        assert!(!panel.manager().is_scheduled(&job));

        panel.submit(&descriptor).unwrap();
        assert!(job.tokeep());
        assert!(panel.manager().is_scheduled(&job));

        assert!(panel.pause("a"));
        panel.submit(&descriptor.clone().with_tokeep(false)).unwrap();
        assert!(!job.tokeep());
        assert_eq!(job.state(), JobState::Wait);
    }

    #[test]
    fn test_poll_and_submit_stay_responsive_during_preemption() {
        let mut registry = ProtocolRegistry::with_builtin();
        registry.register("sluggish", || Box::new(Sluggish));
        let manager = Arc::new(JobManager::new(
            Duration::from_millis(5),
            Duration::from_secs(2),
        ));
        let panel = Arc::new(
            ControlPanel::new(manager, registry, SimulatedLab::new(1).pool())
                .with_tick_interval(Duration::from_millis(1)),
        );

        panel
            .submit(&JobDescriptor::new("low", "sluggish").with_priority(1))
            .unwrap();
        panel.manager().start().unwrap();
        wait_until("low running", || {
            panel.poll("low").unwrap().state.state == JobState::Run
        });
        thread::sleep(Duration::from_millis(20));

        let preempt = {
            let panel = Arc::clone(&panel);
            thread::spawn(move || {
                panel
                    .submit(&dummy("high", 10))
                    .map(|_| ())
                    .map_err(|err| err.to_string())
            })
        };
        // The scheduler is now waiting for the blocked `run` of "low" to return.
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        panel.submit(&dummy("third", 0)).unwrap();
        let submit_took = started.elapsed();
        assert!(
            submit_took < Duration::from_millis(100),
            "submit took {:?}",
            submit_took
        );

        for _ in 0..10 {
            let started = Instant::now();
            assert!(panel.poll("low").is_some());
            assert!(!panel.list().is_empty());
            let poll_took = started.elapsed();
            assert!(
                poll_took < Duration::from_millis(50),
                "poll took {:?}",
                poll_took
            );
            thread::sleep(Duration::from_millis(5));
        }

        preempt.join().unwrap().unwrap();
        wait_until("high done", || {
            panel.poll("high").unwrap().state.state == JobState::Done
        });
        panel.manager().shutdown(Duration::from_secs(2));
        assert_eq!(panel.list().len(), 3);
        assert!(panel.poll("low").unwrap().state.idx_run >= 1);
    }
}
