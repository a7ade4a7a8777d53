//! Pulsed readout: a sweep of microwave pulse lengths read out optically.
//!
//! One sequence cycle visits `points` sweep values. Each point produces two
//! digitizer triggers: a **signal** readout after a microwave pulse of
//! `tau_start_ns + i * tau_step_ns`, and a **reference** readout after an
//! equally long idle gap. The accumulator therefore has `2 * points` slots,
//! with even slots holding signal and odd slots reference segments.
//!
//! ```text
//! point i:  [mw  tau_i][laser+dtrig readout][idle wait]   <- slot 2i
//!           [idle tau_i][laser+dtrig readout][idle wait]  <- slot 2i+1
//! ```
//!
//! The sequencer restarts its cycle when the session restarts, so a resumed
//! session realigns the accumulator cursor to slot 0 while keeping the sums.

use crate::data::{ParameterSet, StreamAccumulator, NO_DATA};
use crate::error::JobError;
use crate::experiment::{ExpContext, ExperimentProtocol};
use crate::hardware::{
    DigitizerConfig, Pulse, Repeats, TriggerRearm, TriggerStart, DIGITIZER_TRIGGER, LASER_GATE,
    MW_GATE,
};
use anyhow::{anyhow, bail, Context, Result};
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Segments per digitizer transfer are rounded down to this multiple.
const SEGMENT_BLOCK: usize = 32;

/// Settings resolved from the parameter set at setup.
#[derive(Debug, Clone)]
struct ReadoutPlan {
    points: usize,
    tau_start_ns: u64,
    tau_step_ns: u64,
    laser_ns: u64,
    wait_ns: u64,
    pretrig: usize,
    posttrig: usize,
    signal: Range<usize>,
    background: Range<usize>,
    rate_refresh: f64,
    refresh: Duration,
    sample_rate: f64,
    amp_range_mv: u32,
    channel: u32,
    laser_power: f64,
    mw_frequency: f64,
    mw_power: f64,
    weights: Option<Vec<f64>>,
}

impl ReadoutPlan {
    fn from_params(params: &ParameterSet) -> Result<Self> {
        let rate_refresh = params.get_f64("rate_refresh")?;
        let plan = Self {
            points: params.get_usize("points")?,
            tau_start_ns: params.get_usize("tau_start_ns")? as u64,
            tau_step_ns: params.get_usize("tau_step_ns")? as u64,
            laser_ns: params.get_usize("laser_ns")? as u64,
            wait_ns: params.get_usize("wait_ns")? as u64,
            pretrig: params.get_usize("pretrig")?,
            posttrig: params.get_usize("posttrig")?,
            signal: params.get_usize("signal_start")?..params.get_usize("signal_stop")?,
            background: params.get_usize("background_start")?
                ..params.get_usize("background_stop")?,
            rate_refresh,
            refresh: refresh_period_for(rate_refresh)?,
            sample_rate: params.get_f64("sample_rate")?,
            amp_range_mv: params.get_usize("amp_range_mv")? as u32,
            channel: params.get_usize("channel")? as u32,
            laser_power: params.get_f64("laser_power")?,
            mw_frequency: params.get_f64("mw_frequency")?,
            mw_power: params.get_f64("mw_power")?,
            weights: match params.get("weights") {
                Some(_) => Some(params.get_array("weights")?.to_vec()),
                None => None,
            },
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.points == 0 {
            bail!("points must be at least 1");
        }
        if self.tau_start_ns == 0 && self.tau_step_ns == 0 {
            bail!("tau_start_ns and tau_step_ns cannot both be 0");
        }
        if self.laser_ns == 0 || self.wait_ns == 0 {
            bail!("laser_ns and wait_ns must be positive");
        }
        let width = self.segment_size();
        for (name, window) in [("signal", &self.signal), ("background", &self.background)] {
            if window.start >= window.end || window.end > width {
                bail!(
                    "{} window {}..{} outside a segment of {} samples",
                    name,
                    window.start,
                    window.end,
                    width
                );
            }
        }
        if let Some(weights) = &self.weights {
            if weights.len() != self.points {
                return Err(JobError::InvalidWeights(format!(
                    "{} weights for {} points",
                    weights.len(),
                    self.points
                ))
                .into());
            }
        }
        Ok(())
    }

    fn segment_size(&self) -> usize {
        self.pretrig + self.posttrig
    }

    fn slots(&self) -> usize {
        2 * self.points
    }

    fn taus(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.points as u64).map(|i| self.tau_start_ns + i * self.tau_step_ns)
    }

    fn refresh_period(&self) -> Duration {
        self.refresh
    }

    fn sequence(&self) -> Vec<Pulse> {
        let mut pulses = Vec::with_capacity(6 * self.points);
        for tau in self.taus() {
            for channel in [Some(MW_GATE), None] {
                if tau > 0 {
                    pulses.push(match channel {
                        Some(gate) => Pulse::new([gate], tau),
                        None => Pulse::idle(tau),
                    });
                }
                pulses.push(Pulse::new([LASER_GATE, DIGITIZER_TRIGGER], self.laser_ns));
                pulses.push(Pulse::idle(self.wait_ns));
            }
        }
        pulses
    }

    /// Segments per transfer: one refresh period's worth, in whole blocks.
    fn num_segments(&self, cycle_ns: u64) -> usize {
        let cycles_per_refresh = 1e9 / (cycle_ns.max(1) as f64 * self.rate_refresh);
        let segments = (self.slots() as f64 * cycles_per_refresh) as usize;
        (segments / SEGMENT_BLOCK * SEGMENT_BLOCK).max(SEGMENT_BLOCK)
    }

    fn digitizer_config(&self, cycle_ns: u64) -> DigitizerConfig {
        DigitizerConfig {
            segment_size: self.segment_size(),
            pretrig: self.pretrig,
            posttrig: self.posttrig,
            num_segments: self.num_segments(cycle_ns),
            sample_rate: self.sample_rate,
            channel: self.channel,
            amp_range_mv: self.amp_range_mv,
        }
    }
}

/// Contrast of a signal over its reference; [`NO_DATA`] where undefined.
fn contrast(signal: f64, reference: f64) -> f64 {
    if signal.is_finite() && reference.is_finite() && reference != 0.0 {
        signal / reference
    } else {
        NO_DATA
    }
}

/// Pulse-length sweep with signal/reference readout.
#[derive(Default)]
pub struct PulsedReadout {
    plan: Option<ReadoutPlan>,
}

impl PulsedReadout {
    /// Registry key.
    pub const KIND: &'static str = "pulsed_readout";

    /// New, unconfigured instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn plan(&self) -> Result<&ReadoutPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| anyhow!("pulsed readout used before setup"))
    }
}

impl ExperimentProtocol for PulsedReadout {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn default_parameters(&self) -> ParameterSet {
        ParameterSet::new()
            .with("points", 8_i64)
            .with("tau_start_ns", 20_i64)
            .with("tau_step_ns", 20_i64)
            .with("laser_ns", 3000_i64)
            .with("wait_ns", 1000_i64)
            .with("pretrig", 32_i64)
            .with("posttrig", 224_i64)
            .with("signal_start", 32_i64)
            .with("signal_stop", 96_i64)
            .with("background_start", 0_i64)
            .with("background_stop", 32_i64)
            .with("rate_refresh", 20.0)
            .with("sample_rate", 500e6)
            .with("amp_range_mv", 1000_i64)
            .with("channel", 0_i64)
            .with("laser_power", 0.8)
            .with("mw_frequency", 2.87e9)
            .with("mw_power", -10.0)
    }

    fn setup(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        let plan = ReadoutPlan::from_params(ctx.params)?;
        let hw = ctx.hardware;

        let laser = hw.source("laser")?;
        laser.set_power(plan.laser_power).context("setting laser power")?;
        laser.set_output(true).context("enabling laser")?;

        let mw = hw.source("mw")?;
        mw.set_frequency(plan.mw_frequency)
            .context("setting MW frequency")?;
        mw.set_power(plan.mw_power).context("setting MW power")?;
        mw.set_output(true).context("enabling MW")?;

        let sequencer = hw.sequencer();
        let cycle_ns = sequencer
            .set_sequence(&plan.sequence())
            .context("uploading pulse sequence")?;
        sequencer
            .set_trigger(TriggerStart::Software, TriggerRearm::Manual)
            .context("configuring sequencer trigger")?;

        let digitizer = hw.digitizer();
        let config = plan.digitizer_config(cycle_ns);
        digitizer
            .configure(&config)
            .context("configuring digitizer")?;
        digitizer
            .start_buffering()
            .context("starting digitizer buffering")?;

        let fresh = ctx.prepare_accumulator(plan.slots(), plan.segment_size())?;
        if ctx.resumed && !fresh {
            ctx.accumulator.realign();
        }

        sequencer
            .stream(Repeats::Infinite)
            .context("streaming sequence")?;
        sequencer.start_now().context("starting sequence")?;

        info!(
            job = ctx.job,
            points = plan.points,
            cycle_ns,
            num_segments = config.num_segments,
            resumed = ctx.resumed,
            "pulsed readout armed"
        );
        self.plan = Some(plan);
        Ok(())
    }

    fn run(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        let period = self.plan()?.refresh_period();
        ctx.stop.wait(period);

        match ctx
            .hardware
            .digitizer()
            .stream()
            .context("reading digitizer buffer")?
        {
            Some(chunk) => {
                let ingested = ctx.accumulator.ingest_chunk(&chunk)?;
                trace!(job = ctx.job, ingested, cursor = ctx.accumulator.cursor(), "chunk");
            }
            None => trace!(job = ctx.job, "no new segments"),
        }
        Ok(())
    }

    fn organize(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        let plan = self.plan()?;
        let series = ctx
            .accumulator
            .subtract_background(plan.signal.clone(), plan.background.clone())?;

        let signal: Vec<f64> = series.iter().copied().step_by(2).collect();
        let reference: Vec<f64> = series.iter().copied().skip(1).step_by(2).collect();
        let contrast: Vec<f64> = signal
            .iter()
            .zip(&reference)
            .map(|(s, r)| contrast(*s, *r))
            .collect();

        if let Some(weights) = &plan.weights {
            ctx.data
                .insert("weighted", StreamAccumulator::weight(&contrast, weights)?);
        }
        let num_repeat = ctx.accumulator.counts().iter().copied().min().unwrap_or(0);

        ctx.data
            .insert("tau_ns", plan.taus().map(|tau| tau as f64).collect());
        ctx.data.insert("signal", signal);
        ctx.data.insert("reference", reference);
        ctx.data.insert("contrast", contrast);
        ctx.data.set_scalar("num_repeat", num_repeat as f64);
        ctx.data
            .set_scalar("segments", ctx.accumulator.total_ingested() as f64);
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut ExpContext<'_>) -> Result<()> {
        let hw = ctx.hardware;
        // Every step is attempted; the first failure is reported.
        let steps = [
            hw.sequencer().halt().context("halting sequencer"),
            hw.digitizer().stop().context("stopping digitizer"),
            hw.source("laser")
                .and_then(|laser| laser.set_output(false))
                .context("disabling laser"),
            hw.source("mw")
                .and_then(|mw| mw.set_output(false))
                .context("disabling MW"),
        ];
        debug!(job = ctx.job, "pulsed readout released");
        steps.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    fn on_error(&mut self, ctx: &mut ExpContext<'_>, fault: &JobError) -> Result<()> {
        warn!(job = ctx.job, %fault, "halting sequence after fault");
        ctx.hardware.sequencer().halt()
    }
}

/// One refresh period, rejecting rates whose period a `Duration` cannot hold.
fn refresh_period_for(rate_refresh: f64) -> Result<Duration> {
    if !(rate_refresh.is_finite() && rate_refresh > 0.0) {
        bail!("rate_refresh must be positive, got {}", rate_refresh);
    }
    Duration::try_from_secs_f64(1.0 / rate_refresh)
        .map_err(|_| anyhow!("rate_refresh {} is too small for a refresh period", rate_refresh))
}
