//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. `config/daq_jobs.toml` (or an explicit path)
//! 3. Environment variables (prefixed with `DAQ_JOBS_`, `__` between levels)
//!
//! # Example
//! ```no_run
//! use daq_jobs::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Polling every {:?}", settings.scheduler.poll_interval());
//! # Ok::<(), daq_jobs::error::JobError>(())
//! ```

use crate::data::ParameterSet;
use crate::error::{JobError, JobResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_jobs.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scheduler timing
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Jobs submitted at startup by the `run` command
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Scheduler and job timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Manager poll loop period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long a pause/stop waits for a job thread to exit
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// Sleep between job ticks in milliseconds
    #[serde(default = "default_job_tick_interval")]
    pub job_tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stop_timeout_ms: default_stop_timeout(),
            job_tick_interval_ms: default_job_tick_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Manager poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bounded join used by pause/stop.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Job tick period.
    pub fn job_tick_interval(&self) -> Duration {
        Duration::from_millis(self.job_tick_interval_ms)
    }
}

/// A job to create and submit, as found in config files and control requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Unique job name
    pub name: String,
    /// Registered protocol kind (e.g. "dummy", "pulsed_readout")
    pub protocol: String,
    /// Scheduling priority, higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Number of ticks to run (mutually exclusive with `time_stop_s`)
    #[serde(default)]
    pub num_run: Option<u64>,
    /// Wall-clock run budget in seconds
    #[serde(default)]
    pub time_stop_s: Option<f64>,
    /// Keep accumulated progress on the next start. Unset leaves an
    /// existing job's flag alone, so a paused job resumes when resubmitted.
    #[serde(default)]
    pub tokeep: Option<bool>,
    /// Protocol parameters, merged over the protocol defaults
    #[serde(default)]
    pub params: ParameterSet,
}

impl JobDescriptor {
    /// Descriptor with default priority and budget.
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            priority: 0,
            num_run: None,
            time_stop_s: None,
            tokeep: None,
            params: ParameterSet::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the tick budget.
    pub fn with_num_run(mut self, num_run: u64) -> Self {
        self.num_run = Some(num_run);
        self.time_stop_s = None;
        self
    }

    /// Set the wall-clock budget.
    pub fn with_time_stop(mut self, seconds: f64) -> Self {
        self.time_stop_s = Some(seconds);
        self.num_run = None;
        self
    }

    /// Set `tokeep` explicitly.
    pub fn with_tokeep(mut self, tokeep: bool) -> Self {
        self.tokeep = Some(tokeep);
        self
    }

    /// Set the parameters.
    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }
}

// Default value functions
fn default_name() -> String {
    "daq-jobs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval() -> u64 {
    100
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_job_tick_interval() -> u64 {
    10
}

impl Settings {
    /// Load configuration from `config/daq_jobs.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_JOBS_`.
    /// Example: `DAQ_JOBS_SCHEDULER__POLL_INTERVAL_MS=50`
    pub fn load() -> JobResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> JobResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_JOBS_").split("__"))
            .extract()?;
        settings.validate().map_err(JobError::Configuration)?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.scheduler.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }
        if self.scheduler.stop_timeout_ms == 0 {
            return Err("stop_timeout_ms must be greater than 0".to_string());
        }

        let mut names = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(format!("Duplicate job name: {}", job.name));
            }
            if job.num_run.is_some() && job.time_stop_s.is_some() {
                return Err(format!(
                    "Job '{}' sets both num_run and time_stop_s",
                    job.name
                ));
            }
            if let Some(seconds) = job.time_stop_s {
                if !(seconds.is_finite() && seconds > 0.0) {
                    return Err(format!(
                        "Job '{}' has invalid time_stop_s {}",
                        job.name, seconds
                    ));
                }
            }
        }

        Ok(())
    }
}
