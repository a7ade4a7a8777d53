//! End-to-end runs through the control panel on simulated hardware.

use daq_jobs::config::JobDescriptor;
use daq_jobs::control::ControlPanel;
use daq_jobs::data::ParameterSet;
use daq_jobs::experiment::{JobManager, JobState, ProtocolRegistry};
use daq_jobs::hardware::mock::{slot_level, SimulatedLab, BASELINE};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(20);

fn panel(lab: &SimulatedLab) -> ControlPanel {
    let manager = Arc::new(JobManager::new(POLL, Duration::from_secs(2)));
    ControlPanel::new(manager, ProtocolRegistry::with_builtin(), lab.pool())
        .with_tick_interval(Duration::from_millis(1))
}

fn dummy(name: &str, priority: i32, num_run: u64, dwell_ms: i64) -> JobDescriptor {
    JobDescriptor::new(name, "dummy")
        .with_priority(priority)
        .with_num_run(num_run)
        .with_params(
            ParameterSet::new()
                .with("dwell_ms", dwell_ms)
                .with("length", 32_i64)
                .with("seed", 3_i64),
        )
}

fn pulsed(name: &str, priority: i32, num_run: u64) -> JobDescriptor {
    JobDescriptor::new(name, "pulsed_readout")
        .with_priority(priority)
        .with_num_run(num_run)
        .with_params(
            ParameterSet::new()
                .with("points", 4_i64)
                .with("rate_refresh", 500.0),
        )
}

fn wait_for(panel: &ControlPanel, name: &str, state: JobState) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let snapshot = panel.poll(name).unwrap();
        let job = panel.job(name).unwrap();
        if snapshot.state.state == state && !job.is_active() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} stuck in {} waiting for {}",
            name,
            snapshot.state.state,
            state
        );
        thread::sleep(Duration::from_millis(1));
    }
}

fn expected_contrast(point: usize) -> f64 {
    (slot_level(2 * point) - BASELINE) / (slot_level(2 * point + 1) - BASELINE)
}

#[test]
fn test_dummy_job_publishes_every_tick() {
    let lab = SimulatedLab::new(1);
    let panel = panel(&lab);
    panel.submit(&dummy("scan", 5, 10, 2)).unwrap();
    panel.manager().start().unwrap();

    let mut revisions = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = panel.poll("scan").unwrap();
        let revision = snapshot.data.revision();
        if revisions.last() != Some(&revision) {
            revisions.push(revision);
        }
        if snapshot.state.state == JobState::Done {
            break;
        }
        assert!(Instant::now() < deadline, "dummy job did not finish");
        thread::sleep(Duration::from_micros(200));
    }
    panel.manager().shutdown(Duration::from_secs(1));

    assert!(revisions.windows(2).all(|w| w[0] < w[1]));
    let snapshot = panel.poll("scan").unwrap();
    assert_eq!(snapshot.state.idx_run, 10);
    assert_eq!(snapshot.state.state, JobState::Done);
    assert_eq!(snapshot.state.progress(), Some(1.0));
    assert_eq!(snapshot.data.revision(), 10);
    assert_eq!(revisions.last(), Some(&10));
    assert_eq!(snapshot.data.scalar("iteration"), Some(10.0));
    assert_eq!(snapshot.data.get("average").map(<[f64]>::len), Some(32));
}

#[test]
fn test_preempted_job_resumes_with_progress() {
    let lab = SimulatedLab::new(1);
    let panel = panel(&lab);
    panel.submit(&dummy("low", 1, 60, 2)).unwrap();
    panel.manager().start().unwrap();

    let low = panel.job("low").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while low.idx_run() < 5 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }

    let submitted = Instant::now();
    panel.submit(&dummy("high", 10, 5, 2)).unwrap();
    let high = panel.job("high").unwrap();
    while high.state() != JobState::Run && high.state() != JobState::Done {
        assert!(
            submitted.elapsed() < POLL + Duration::from_millis(100),
            "high priority job did not start in time"
        );
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(low.state(), JobState::Wait);
    let kept = low.idx_run();
    assert!(kept >= 5);

    wait_for(&panel, "high", JobState::Done);
    let mut lowest_seen = u64::MAX;
    while low.state() != JobState::Done {
        lowest_seen = lowest_seen.min(low.idx_run());
        assert!(Instant::now() < deadline, "low job did not finish");
        thread::sleep(Duration::from_millis(1));
    }
    panel.manager().shutdown(Duration::from_secs(1));

    assert!(lowest_seen >= kept, "progress was reset");
    assert_eq!(low.idx_run(), 60);
    assert_eq!(low.data_set().revision(), 60);
}

#[test]
fn test_pulsed_readout_contrast() {
    let lab = SimulatedLab::new(11);
    let panel = panel(&lab);
    panel.submit(&pulsed("rabi", 1, 20)).unwrap();
    panel.manager().start().unwrap();
    wait_for(&panel, "rabi", JobState::Done);
    panel.manager().shutdown(Duration::from_secs(1));

    let data = panel.poll("rabi").unwrap().data;
    assert_eq!(data.get("tau_ns").unwrap(), &[20.0, 40.0, 60.0, 80.0]);
    let contrast = data.get("contrast").unwrap();
    assert_eq!(contrast.len(), 4);
    for (point, value) in contrast.iter().enumerate() {
        assert!(
            (value - expected_contrast(point)).abs() < 1e-9,
            "point {}: {} != {}",
            point,
            value,
            expected_contrast(point)
        );
    }
    assert!(data.scalar("num_repeat").unwrap() >= 1.0);
    assert_eq!(
        data.scalar("segments").unwrap() as u64,
        lab.digitizer.stats().segments_delivered
    );

    assert!(!lab.laser.is_enabled());
    assert!(!lab.mw.is_enabled());
    assert!(!lab.sequencer.is_running());
    assert!(!lab.digitizer.is_buffering());
    assert_eq!(lab.sequencer.halt_count(), 1);
    assert_eq!(lab.mw.frequency(), 2.87e9);
}

#[test]
fn test_pulsed_readout_survives_preemption() {
    let lab = SimulatedLab::new(5);
    let panel = panel(&lab);
    panel.submit(&pulsed("rabi", 1, 40)).unwrap();
    panel.manager().start().unwrap();

    let rabi = panel.job("rabi").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while rabi.idx_run() < 5 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    panel.submit(&dummy("interrupt", 9, 3, 1)).unwrap();

    wait_for(&panel, "interrupt", JobState::Done);
    wait_for(&panel, "rabi", JobState::Done);
    panel.manager().shutdown(Duration::from_secs(1));

    assert_eq!(lab.sequencer.halt_count(), 2);
    assert_eq!(lab.digitizer.stats().start_calls, 2);
    let contrast = rabi.data_set().get("contrast").unwrap().to_vec();
    for (point, value) in contrast.iter().enumerate() {
        assert!((value - expected_contrast(point)).abs() < 1e-9);
    }
}

#[test]
fn test_pulsed_setup_failure_releases_hardware() {
    let lab = SimulatedLab::new(2);
    lab.digitizer.reject_configuration(true);
    let panel = panel(&lab);
    panel.submit(&pulsed("rabi", 1, 5)).unwrap();
    panel.submit(&dummy("after", 0, 2, 0)).unwrap();
    panel.manager().start().unwrap();

    wait_for(&panel, "rabi", JobState::Error);
    wait_for(&panel, "after", JobState::Done);
    panel.manager().shutdown(Duration::from_secs(1));

    let job = panel.job("rabi").unwrap();
    assert_eq!(job.idx_run(), 0);
    assert!(job.last_error().unwrap().contains("configuring digitizer"));
    assert!(!lab.laser.is_enabled());
    assert!(!lab.mw.is_enabled());
    assert!(lab.sequencer.halt_count() >= 1);
}

#[test]
fn test_pulsed_runtime_fault_keeps_data() {
    let lab = SimulatedLab::new(3);
    let panel = panel(&lab);
    panel.submit(&pulsed("rabi", 1, 1_000)).unwrap();
    panel.manager().start().unwrap();

    let rabi = panel.job("rabi").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while rabi.idx_run() < 3 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    lab.digitizer.fail_after(2);
    wait_for(&panel, "rabi", JobState::Error);
    panel.manager().shutdown(Duration::from_secs(1));

    let snapshot = panel.poll("rabi").unwrap();
    assert!(snapshot.state.idx_run >= 3);
    assert!(snapshot.data.get("contrast").is_some());
    assert!(rabi.last_error().unwrap().contains("buffer overrun"));
    assert!(!lab.digitizer.is_buffering());
    assert!(!lab.sequencer.is_running());
}
