//! Configuration loading from files and the environment.

use daq_jobs::config::Settings;
use daq_jobs::data::ParamValue;
use daq_jobs::error::JobError;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
#[serial]
fn test_load_jobs_from_file() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"

        [scheduler]
        poll_interval_ms = 25

        [[jobs]]
        name = "sine"
        protocol = "dummy"
        priority = 3
        num_run = 50

        [jobs.params]
        length = 64
        freq = 2.5

        [[jobs]]
        name = "rabi"
        protocol = "pulsed_readout"
        time_stop_s = 1.5
        tokeep = true

        [jobs.params]
        weights = [1.0, 2.0]
        "#,
    );

    let settings = Settings::load_from(file.path()).expect("Failed to load config");
    assert_eq!(settings.application.log_level, "debug");
    assert_eq!(settings.application.log_format, "pretty");
    assert_eq!(settings.scheduler.poll_interval(), Duration::from_millis(25));
    assert_eq!(settings.scheduler.stop_timeout(), Duration::from_millis(5000));

    assert_eq!(settings.jobs.len(), 2);
    let sine = &settings.jobs[0];
    assert_eq!(sine.priority, 3);
    assert_eq!(sine.num_run, Some(50));
    assert_eq!(sine.params.get("length"), Some(&ParamValue::Int(64)));
    assert_eq!(sine.params.get_f64("freq").unwrap(), 2.5);

    let rabi = &settings.jobs[1];
    assert_eq!(rabi.priority, 0);
    assert_eq!(rabi.time_stop_s, Some(1.5));
    assert_eq!(rabi.tokeep, Some(true));
    assert_eq!(sine.tokeep, None);
    assert_eq!(rabi.params.get_array("weights").unwrap(), &[1.0, 2.0]);
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let settings = Settings::load_from("does/not/exist.toml").expect("defaults should load");
    assert!(settings.jobs.is_empty());
    assert_eq!(settings.scheduler.job_tick_interval(), Duration::from_millis(10));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(
        r#"
        [scheduler]
        poll_interval_ms = 25
        "#,
    );

    std::env::set_var("DAQ_JOBS_SCHEDULER__POLL_INTERVAL_MS", "7");
    let result = Settings::load_from(file.path());
    std::env::remove_var("DAQ_JOBS_SCHEDULER__POLL_INTERVAL_MS");

    let settings = result.expect("Failed to load config");
    assert_eq!(settings.scheduler.poll_interval(), Duration::from_millis(7));
}

#[test]
#[serial]
fn test_invalid_config_is_rejected() {
    let file = write_config(
        r#"
        [[jobs]]
        name = "twice"
        protocol = "dummy"

        [[jobs]]
        name = "twice"
        protocol = "dummy"
        "#,
    );
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(err, JobError::Configuration(ref msg) if msg.contains("Duplicate job name")));

    let file = write_config(
        r#"
        [application]
        log_format = "xml"
        "#,
    );
    assert!(Settings::load_from(file.path()).is_err());

    let file = write_config(
        r#"
        [scheduler]
        poll_interval_ms = "soon"
        "#,
    );
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(JobError::Config(_))
    ));
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/daq_jobs.toml");
    let settings = Settings::load_from(path).expect("shipped config should load");
    assert_eq!(settings.jobs.len(), 2);
    assert!(settings.jobs.iter().any(|job| job.protocol == "pulsed_readout"));
}
