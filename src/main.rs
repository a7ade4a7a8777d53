//! CLI Entry Point for daq-jobs
//!
//! Drives the job scheduler against simulated hardware:
//! - `run` submits the jobs listed in the config file and streams JSON
//!   snapshots until every job has settled (or Ctrl-C)
//! - `demo` runs five dummy jobs of mixed priority and prints the order in
//!   which they complete
//! - `protocols` lists the registered protocol kinds
//! - `config` prints the effective configuration as TOML
//!
//! # Usage
//!
//! ```bash
//! daq-jobs run --config config/daq_jobs.toml
//! DAQ_JOBS_SCHEDULER__POLL_INTERVAL_MS=20 daq-jobs demo
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use daq_jobs::config::{JobDescriptor, Settings};
use daq_jobs::control::ControlPanel;
use daq_jobs::data::ParameterSet;
use daq_jobs::experiment::{JobManager, JobState, ProtocolRegistry};
use daq_jobs::hardware::mock::SimulatedLab;
use daq_jobs::logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-jobs")]
#[command(about = "Priority-preemptive measurement job scheduler", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/daq_jobs.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the jobs listed in the configuration
    Run {
        /// Seed of the simulated digitizer
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Five dummy jobs with priorities 4, 1, 2, 10, 5
    Demo {
        /// Ticks per job
        #[arg(long, default_value = "20")]
        num_run: u64,
    },

    /// List registered protocol kinds
    Protocols,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    match cli.command {
        Commands::Run { seed } => {
            logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            run_jobs(settings, seed).await
        }
        Commands::Demo { num_run } => {
            logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            run_demo(settings, num_run).await
        }
        Commands::Protocols => {
            for kind in ProtocolRegistry::with_builtin().kinds() {
                println!("{}", kind);
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn station(settings: &Settings, seed: u64) -> Arc<ControlPanel> {
    let lab = SimulatedLab::new(seed);
    let manager = Arc::new(JobManager::from_config(&settings.scheduler));
    Arc::new(
        ControlPanel::new(manager, ProtocolRegistry::with_builtin(), lab.pool())
            .with_tick_interval(settings.scheduler.job_tick_interval()),
    )
}

async fn run_jobs(settings: Settings, seed: u64) -> Result<()> {
    if settings.jobs.is_empty() {
        warn!("no jobs configured, nothing to run");
        return Ok(());
    }

    let panel = station(&settings, seed);
    for descriptor in &settings.jobs {
        panel.submit(descriptor)?;
    }

    supervise(&panel, settings.scheduler.poll_interval() * 5, |panel| {
        for snapshot in panel.list() {
            println!("{}", serde_json::to_string(&snapshot)?);
        }
        Ok(())
    })
    .await?;

    for snapshot in panel.list() {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

async fn run_demo(settings: Settings, num_run: u64) -> Result<()> {
    let panel = station(&settings, 1);
    for (i, priority) in [4, 1, 2, 10, 5].into_iter().enumerate() {
        let params = ParameterSet::new()
            .with("dwell_ms", 20_i64)
            .with("length", 64_i64);
        panel.submit(
            &JobDescriptor::new(format!("dummy-{}", i), "dummy")
                .with_priority(priority)
                .with_num_run(num_run)
                .with_params(params),
        )?;
    }

    let mut finished: Vec<String> = Vec::new();
    supervise(&panel, settings.scheduler.poll_interval(), |panel| {
        for snapshot in panel.list() {
            if snapshot.state.state == JobState::Done && !finished.contains(&snapshot.name) {
                println!(
                    "✅ {} (priority {}) done after {} ticks, {:.2}s",
                    snapshot.name,
                    snapshot.state.priority,
                    snapshot.state.idx_run,
                    snapshot.state.time_run
                );
                finished.push(snapshot.name);
            }
        }
        Ok(())
    })
    .await?;

    println!("Completion order: {}", finished.join(", "));
    Ok(())
}

/// Start the manager, call `report` on every interval tick until all jobs
/// have settled or Ctrl-C arrives, then shut the manager down.
async fn supervise<F>(panel: &Arc<ControlPanel>, period: Duration, mut report: F) -> Result<()>
where
    F: FnMut(&ControlPanel) -> Result<()>,
{
    panel.manager().start()?;
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report(panel)?;
                if panel.all_settled() {
                    info!("all jobs settled");
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                warn!("interrupted, shutting down");
                break;
            }
        }
    }

    let manager = Arc::clone(panel.manager());
    let timeout = manager.stop_timeout();
    tokio::task::spawn_blocking(move || manager.shutdown(timeout)).await?;
    Ok(())
}
