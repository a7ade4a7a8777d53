//! Simulated hardware
//!
//! Devices that behave enough like a real experiment station for the CLI
//! demo and the test-suite:
//!
//! - `SimulatedDigitizer` - delivers bursts of segments whose content depends
//!   on the slot (trigger index within the cycle) they belong to
//! - `SimulatedSequencer` - records the uploaded sequence and tells a linked
//!   digitizer how many digitizer triggers one cycle contains
//! - `SimulatedSource` - records output/power/frequency/phase setters
//!
//! Segment shape: the first `pretrig` samples sit at [`BASELINE`], the rest
//! at `slot_level(slot) = 1 + slot`. Chunk sizes are drawn from a seeded RNG
//! so runs are reproducible.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::debug;

use crate::hardware::capabilities::{
    Digitizer, DigitizerConfig, Pulse, PulseSequencer, Repeats, SegmentChunk, Source,
    TriggerRearm, TriggerStart, DIGITIZER_TRIGGER,
};
use crate::hardware::HardwarePool;

/// Level of pre-trigger samples.
pub const BASELINE: f64 = 0.1;

/// Signal level the simulated digitizer produces for a slot.
pub fn slot_level(slot: usize) -> f64 {
    1.0 + slot as f64
}

// =============================================================================
// SimulatedDigitizer
// =============================================================================

/// Call counters of a [`SimulatedDigitizer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigitizerStats {
    /// `configure` calls
    pub configure_calls: u64,
    /// `start_buffering` calls
    pub start_calls: u64,
    /// `stop` calls
    pub stop_calls: u64,
    /// Segments handed out by `stream`
    pub segments_delivered: u64,
}

struct DigitizerState {
    config: Option<DigitizerConfig>,
    buffering: bool,
    cycle_len: usize,
    position: u64,
    rng: StdRng,
    max_segments_per_poll: usize,
    noise: f64,
    reject_configuration: bool,
    fail_after_polls: Option<u64>,
    polls: u64,
    stats: DigitizerStats,
}

/// Simulated segmented digitizer.
pub struct SimulatedDigitizer {
    state: Mutex<DigitizerState>,
}

impl SimulatedDigitizer {
    /// Digitizer with a fixed default seed.
    pub fn new() -> Self {
        Self::with_seed(0x5EED)
    }

    /// Digitizer with a given RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(DigitizerState {
                config: None,
                buffering: false,
                cycle_len: 1,
                position: 0,
                rng: StdRng::seed_from_u64(seed),
                max_segments_per_poll: 32,
                noise: 0.0,
                reject_configuration: false,
                fail_after_polls: None,
                polls: 0,
                stats: DigitizerStats::default(),
            }),
        }
    }

    /// Upper bound on segments per `stream` call (0 means every poll is a gap).
    pub fn with_max_segments_per_poll(self, max: usize) -> Self {
        self.state.lock().max_segments_per_poll = max;
        self
    }

    /// Add uniform noise of the given amplitude to every sample.
    pub fn with_noise(self, amplitude: f64) -> Self {
        self.state.lock().noise = amplitude.abs();
        self
    }

    /// Make `configure` fail (setup failure injection).
    pub fn reject_configuration(&self, reject: bool) {
        self.state.lock().reject_configuration = reject;
    }

    /// Make `stream` fail once it has been polled `polls` more times.
    pub fn fail_after(&self, polls: u64) {
        let mut state = self.state.lock();
        state.fail_after_polls = Some(state.polls + polls);
    }

    /// Clear a pending `fail_after`.
    pub fn clear_failure(&self) {
        self.state.lock().fail_after_polls = None;
    }

    /// Number of slots per cycle.
    pub fn set_cycle_len(&self, cycle_len: usize) {
        let mut state = self.state.lock();
        state.cycle_len = cycle_len.max(1);
        state.position = 0;
    }

    /// Slots per cycle.
    pub fn cycle_len(&self) -> usize {
        self.state.lock().cycle_len
    }

    /// Whether buffering is active.
    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    /// Last accepted configuration.
    pub fn config(&self) -> Option<DigitizerConfig> {
        self.state.lock().config.clone()
    }

    /// Call counters.
    pub fn stats(&self) -> DigitizerStats {
        self.state.lock().stats
    }
}

impl Default for SimulatedDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Digitizer for SimulatedDigitizer {
    fn configure(&self, config: &DigitizerConfig) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.configure_calls += 1;
        if state.reject_configuration {
            bail!("Simulated digitizer rejected configuration");
        }
        if config.segment_size == 0 || config.pretrig + config.posttrig != config.segment_size {
            bail!(
                "Segment size {} does not equal pretrig {} + posttrig {}",
                config.segment_size,
                config.pretrig,
                config.posttrig
            );
        }
        state.config = Some(config.clone());
        Ok(())
    }

    fn start_buffering(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.is_none() {
            bail!("Digitizer started before configure");
        }
        state.stats.start_calls += 1;
        state.buffering = true;
        state.position = 0;
        Ok(())
    }

    fn stream(&self) -> Result<Option<SegmentChunk>> {
        let mut state = self.state.lock();
        let Some(config) = state.config.clone() else {
            return Ok(None);
        };
        if !state.buffering {
            return Ok(None);
        }

        state.polls += 1;
        if state.fail_after_polls.is_some_and(|limit| state.polls > limit) {
            bail!("Simulated digitizer buffer overrun");
        }

        let max = state.max_segments_per_poll;
        let count = state.rng.gen_range(0..=max);
        if count == 0 {
            return Ok(None);
        }

        let width = config.segment_size;
        let mut samples = Vec::with_capacity(count * width);
        for _ in 0..count {
            let slot = (state.position % state.cycle_len as u64) as usize;
            state.position += 1;
            for j in 0..width {
                let level = if j < config.pretrig {
                    BASELINE
                } else {
                    slot_level(slot)
                };
                let noise = if state.noise > 0.0 {
                    let amplitude = state.noise;
                    state.rng.gen_range(-amplitude..=amplitude)
                } else {
                    0.0
                };
                samples.push(level + noise);
            }
        }
        state.stats.segments_delivered += count as u64;
        Ok(Some(SegmentChunk::new(width, samples)))
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.stop_calls += 1;
        state.buffering = false;
        Ok(())
    }
}

// =============================================================================
// SimulatedSequencer
// =============================================================================

#[derive(Default)]
struct SequencerState {
    pulses: Vec<Pulse>,
    trigger: Option<(TriggerStart, TriggerRearm)>,
    repeats: Option<Repeats>,
    running: bool,
    halts: u64,
}

/// Simulated pulse sequencer.
pub struct SimulatedSequencer {
    state: Mutex<SequencerState>,
    digitizer: Option<Arc<SimulatedDigitizer>>,
}

impl SimulatedSequencer {
    /// Stand-alone sequencer.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SequencerState::default()),
            digitizer: None,
        }
    }

    /// Sequencer whose [`DIGITIZER_TRIGGER`] channel drives `digitizer`.
    pub fn linked(digitizer: Arc<SimulatedDigitizer>) -> Self {
        Self {
            state: Mutex::new(SequencerState::default()),
            digitizer: Some(digitizer),
        }
    }

    /// Whether the sequence is playing.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Number of `halt` calls.
    pub fn halt_count(&self) -> u64 {
        self.state.lock().halts
    }

    /// The uploaded sequence.
    pub fn sequence(&self) -> Vec<Pulse> {
        self.state.lock().pulses.clone()
    }

    /// Configured repetitions.
    pub fn repeats(&self) -> Option<Repeats> {
        self.state.lock().repeats
    }
}

impl Default for SimulatedSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl PulseSequencer for SimulatedSequencer {
    fn set_sequence(&self, pulses: &[Pulse]) -> Result<u64> {
        if pulses.is_empty() {
            bail!("Empty pulse sequence");
        }
        if let Some(step) = pulses.iter().position(|p| p.duration_ns == 0) {
            bail!("Pulse {} has zero duration", step);
        }

        let total: u64 = pulses.iter().map(|p| p.duration_ns).sum();
        let triggers = pulses
            .iter()
            .filter(|p| p.channels.iter().any(|c| c == DIGITIZER_TRIGGER))
            .count();
        if let Some(digitizer) = &self.digitizer {
            digitizer.set_cycle_len(triggers);
        }
        debug!(steps = pulses.len(), total_ns = total, triggers, "sequence uploaded");

        let mut state = self.state.lock();
        state.pulses = pulses.to_vec();
        state.running = false;
        Ok(total)
    }

    fn set_trigger(&self, start: TriggerStart, rearm: TriggerRearm) -> Result<()> {
        self.state.lock().trigger = Some((start, rearm));
        Ok(())
    }

    fn stream(&self, repeats: Repeats) -> Result<()> {
        let mut state = self.state.lock();
        if state.pulses.is_empty() {
            bail!("No sequence uploaded");
        }
        state.repeats = Some(repeats);
        if matches!(state.trigger, Some((TriggerStart::Immediate, _))) {
            state.running = true;
        }
        Ok(())
    }

    fn start_now(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.repeats.is_none() {
            bail!("start_now before stream");
        }
        state.running = true;
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.repeats = None;
        state.halts += 1;
        Ok(())
    }
}

// =============================================================================
// SimulatedSource
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SourceState {
    enabled: bool,
    power: f64,
    frequency: f64,
    phase: f64,
}

/// Simulated laser or MW/RF generator.
pub struct SimulatedSource {
    name: String,
    tunable: bool,
    state: Mutex<SourceState>,
}

impl SimulatedSource {
    /// A source with power control only (laser).
    pub fn laser(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tunable: false,
            state: Mutex::new(SourceState::default()),
        }
    }

    /// A source with frequency and phase control (MW/RF generator).
    pub fn generator(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tunable: true,
            state: Mutex::new(SourceState::default()),
        }
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the output is on.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Last power setting.
    pub fn power(&self) -> f64 {
        self.state.lock().power
    }

    /// Last frequency setting.
    pub fn frequency(&self) -> f64 {
        self.state.lock().frequency
    }
}

impl Source for SimulatedSource {
    fn set_output(&self, enabled: bool) -> Result<()> {
        self.state.lock().enabled = enabled;
        debug!(source = %self.name, enabled, "output switched");
        Ok(())
    }

    fn set_power(&self, power: f64) -> Result<()> {
        if !power.is_finite() {
            bail!("{}: power must be finite", self.name);
        }
        self.state.lock().power = power;
        Ok(())
    }

    fn set_frequency(&self, hz: f64) -> Result<()> {
        if !self.tunable {
            bail!("{}: frequency control not supported", self.name);
        }
        if !(hz.is_finite() && hz > 0.0) {
            bail!("{}: invalid frequency {}", self.name, hz);
        }
        self.state.lock().frequency = hz;
        Ok(())
    }

    fn set_phase(&self, degrees: f64) -> Result<()> {
        if !self.tunable {
            bail!("{}: phase control not supported", self.name);
        }
        self.state.lock().phase = degrees.rem_euclid(360.0);
        Ok(())
    }
}

// =============================================================================
// SimulatedLab
// =============================================================================

/// A wired-up set of simulated devices, keeping typed handles for inspection.
pub struct SimulatedLab {
    /// Digitizer
    pub digitizer: Arc<SimulatedDigitizer>,
    /// Sequencer linked to the digitizer
    pub sequencer: Arc<SimulatedSequencer>,
    /// Laser, registered as "laser"
    pub laser: Arc<SimulatedSource>,
    /// Microwave generator, registered as "mw"
    pub mw: Arc<SimulatedSource>,
}

impl SimulatedLab {
    /// Build the lab with a seeded digitizer.
    pub fn new(seed: u64) -> Self {
        Self::with_digitizer(SimulatedDigitizer::with_seed(seed))
    }

    /// Build the lab around a pre-configured digitizer.
    pub fn with_digitizer(digitizer: SimulatedDigitizer) -> Self {
        let digitizer = Arc::new(digitizer);
        Self {
            sequencer: Arc::new(SimulatedSequencer::linked(Arc::clone(&digitizer))),
            digitizer,
            laser: Arc::new(SimulatedSource::laser("laser")),
            mw: Arc::new(SimulatedSource::generator("mw")),
        }
    }

    /// A hardware pool over these devices.
    pub fn pool(&self) -> Arc<HardwarePool> {
        Arc::new(
            HardwarePool::new(self.digitizer.clone(), self.sequencer.clone())
                .with_source("laser", self.laser.clone())
                .with_source("mw", self.mw.clone()),
        )
    }
}
