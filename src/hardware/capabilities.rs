//! Hardware capability traits consumed by experiment protocols.
//!
//! Protocols touch hardware only from their setup/run/shutdown hooks, and the
//! scheduler lets exactly one job run at a time, so implementations need no
//! cross-job locking. Each trait is small, `Send + Sync`, takes `&self`
//! (implementations use interior mutability) and reports failures through
//! `anyhow::Result`.
//!
//! # Example
//!
//! ```rust,ignore
//! fn arm(seq: &dyn PulseSequencer, dig: &dyn Digitizer, cfg: &DigitizerConfig) -> Result<()> {
//!     seq.set_trigger(TriggerStart::Software, TriggerRearm::Manual)?;
//!     dig.configure(cfg)?;
//!     dig.start_buffering()?;
//!     seq.stream(Repeats::Infinite)?;
//!     seq.start_now()
//! }
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Acquisition settings for a triggered, segmented digitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizerConfig {
    /// Samples per segment (pretrig + posttrig)
    pub segment_size: usize,
    /// Samples recorded before the trigger
    pub pretrig: usize,
    /// Samples recorded after the trigger
    pub posttrig: usize,
    /// Segments per hardware buffer transfer
    pub num_segments: usize,
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Input channel index
    pub channel: u32,
    /// Input range in mV
    pub amp_range_mv: u32,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            segment_size: 256,
            pretrig: 32,
            posttrig: 224,
            num_segments: 32,
            sample_rate: 500e6,
            channel: 0,
            amp_range_mv: 1000,
        }
    }
}

/// `K` consecutive segments of `segment_size` samples each, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentChunk {
    /// Samples per segment
    pub segment_size: usize,
    /// Flattened samples, `K * segment_size` long
    pub samples: Vec<f64>,
}

impl SegmentChunk {
    /// Wrap flattened samples.
    pub fn new(segment_size: usize, samples: Vec<f64>) -> Self {
        Self {
            segment_size,
            samples,
        }
    }

    /// Number of whole segments.
    pub fn num_segments(&self) -> usize {
        if self.segment_size == 0 {
            0
        } else {
            self.samples.len() / self.segment_size
        }
    }

    /// Whether the chunk holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Capability: segmented waveform acquisition
///
/// # Contract
/// - `configure` may reject settings; protocols call it from setup
/// - `stream` is a non-blocking poll: `Ok(None)` means nothing new yet
/// - `stop` must be safe to call when not buffering
pub trait Digitizer: Send + Sync {
    /// Apply acquisition settings
    fn configure(&self, config: &DigitizerConfig) -> Result<()>;

    /// Arm the card and start filling its buffer
    fn start_buffering(&self) -> Result<()>;

    /// Fetch all segments acquired since the last call
    fn stream(&self) -> Result<Option<SegmentChunk>>;

    /// Stop acquisition
    fn stop(&self) -> Result<()>;
}

/// Sequencer channel wired to the digitizer trigger input.
pub const DIGITIZER_TRIGGER: &str = "dtrig";
/// Sequencer channel gating the laser.
pub const LASER_GATE: &str = "laser";
/// Sequencer channel gating the microwave switch.
pub const MW_GATE: &str = "mw";

/// One step of a pulse sequence: channels held high for `duration_ns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pulse {
    /// Active channel names
    pub channels: Vec<String>,
    /// Step length in nanoseconds
    pub duration_ns: u64,
}

impl Pulse {
    /// Step with the given active channels.
    pub fn new<I, S>(channels: I, duration_ns: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            duration_ns,
        }
    }

    /// All channels low.
    pub fn idle(duration_ns: u64) -> Self {
        Self {
            channels: Vec::new(),
            duration_ns,
        }
    }
}

/// How a sequence run is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStart {
    /// Starts as soon as `stream` is called
    Immediate,
    /// Waits for `start_now`
    Software,
    /// External trigger, rising edge
    HardwareRising,
}

/// Whether the start trigger re-arms after each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerRearm {
    /// Re-arm automatically
    Auto,
    /// Single shot
    Manual,
}

/// Number of sequence repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Repeats {
    /// Repeat until halted
    Infinite,
    /// Repeat a fixed number of times
    Count(u64),
}

/// Capability: programmable pulse generation
pub trait PulseSequencer: Send + Sync {
    /// Upload a sequence; returns its total duration in nanoseconds
    fn set_sequence(&self, pulses: &[Pulse]) -> Result<u64>;

    /// Configure the start trigger
    fn set_trigger(&self, start: TriggerStart, rearm: TriggerRearm) -> Result<()>;

    /// Queue the uploaded sequence for `repeats` repetitions
    fn stream(&self, repeats: Repeats) -> Result<()>;

    /// Software start
    fn start_now(&self) -> Result<()>;

    /// Stop output and drive every channel low
    fn halt(&self) -> Result<()>;
}

/// Capability: continuous source (laser, MW/RF generator)
///
/// Only `set_output` and `set_power` are universal; frequency and phase
/// default to "not supported".
pub trait Source: Send + Sync {
    /// Switch the output on or off
    fn set_output(&self, enabled: bool) -> Result<()>;

    /// Output power (device units: fraction for lasers, dBm for generators)
    fn set_power(&self, power: f64) -> Result<()>;

    /// Carrier frequency in Hz
    fn set_frequency(&self, _hz: f64) -> Result<()> {
        anyhow::bail!("Frequency control not supported by this source")
    }

    /// Carrier phase in degrees
    fn set_phase(&self, _degrees: f64) -> Result<()> {
        anyhow::bail!("Phase control not supported by this source")
    }
}
