//! Hardware-free protocol producing a noisy sine trace every tick.
//!
//! Useful for exercising the scheduler and for UI work without an
//! experiment station. Each trace is folded into a one-slot accumulator, so
//! `average` converges to the clean sine as ticks accumulate.

use crate::data::ParameterSet;
use crate::experiment::{ExpContext, ExperimentProtocol};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::debug;

/// Simulated sine acquisition.
pub struct DummyMeasurement {
    rng: StdRng,
    amplitude: f64,
    freq: f64,
    noise: f64,
    dwell: Duration,
    trace: Vec<f64>,
    timestamps: Vec<f64>,
}

impl DummyMeasurement {
    /// Registry key.
    pub const KIND: &'static str = "dummy";

    /// New instance with an entropy-seeded noise source.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            amplitude: 1.0,
            freq: 20.0,
            noise: 0.05,
            dwell: Duration::from_millis(100),
            trace: Vec::new(),
            timestamps: Vec::new(),
        }
    }
}

impl Default for DummyMeasurement {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentProtocol for DummyMeasurement {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn default_parameters(&self) -> ParameterSet {
        ParameterSet::new()
            .with("length", 100_i64)
            .with("volt_amp", 1.0)
            .with("freq", 20.0)
            .with("noise", 0.05)
            .with("dwell_ms", 100_i64)
    }

    fn setup(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        let length = ctx.params.get_usize("length")?;
        self.amplitude = ctx.params.get_f64("volt_amp")?;
        self.freq = ctx.params.get_f64("freq")?;
        self.noise = ctx.params.get_f64("noise")?.abs();
        self.dwell = Duration::from_millis(ctx.params.get_usize("dwell_ms")? as u64);
        if let Ok(seed) = ctx.params.get_usize("seed") {
            self.rng = StdRng::seed_from_u64(seed as u64);
        }

        ctx.prepare_accumulator(1, length)?;
        self.trace.resize(length, 0.0);
        self.timestamps = (0..length).map(|i| i as f64 / length as f64).collect();
        debug!(job = ctx.job, length, "dummy setup");
        Ok(())
    }

    fn run(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        ctx.stop.wait(self.dwell);
        let phase = ctx.idx_run as f64 * 0.1;
        for (value, t) in self.trace.iter_mut().zip(&self.timestamps) {
            let jitter = if self.noise > 0.0 {
                self.rng.gen_range(-self.noise..=self.noise)
            } else {
                0.0
            };
            *value = self.amplitude * (TAU * self.freq * t + phase).sin() + jitter;
        }
        ctx.accumulator.ingest(&self.trace)?;
        Ok(())
    }

    fn organize(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        let average = ctx.accumulator.mean_segment(0)?;
        ctx.data.insert("signal", self.trace.clone());
        ctx.data.insert("timestamp", self.timestamps.clone());
        ctx.data.insert("average", average);
        ctx.data.set_scalar("iteration", ctx.idx_run as f64);
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        debug!(job = ctx.job, "dummy shutdown");
        Ok(())
    }
}
