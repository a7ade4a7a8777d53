//! Streaming slot accumulator.
//!
//! The digitizer delivers fixed-width segments (one per trigger) in chunks of
//! arbitrary size. An experiment cycle fires `N` triggers, so segment `i` of
//! the overall stream belongs to slot `i mod N`. [`StreamAccumulator`] folds
//! that stream into `N` running sums plus counts:
//!
//! ```text
//! stream:  s0 s1 s2 | s3 s4 | | s5 s6 s7 s8 s9 ...   (chunks of 3, 2, 0, 5)
//! slots:   0  1  2    3  0      1  2  3  0  1        (N = 4)
//! ```
//!
//! The cursor (next slot to fill) persists between calls, so the result is
//! identical for every way of partitioning the same stream into chunks.
//! Storage is allocated once by [`StreamAccumulator::configure`] and reused;
//! `ingest` never allocates.

use crate::error::{JobError, JobResult};
use crate::hardware::SegmentChunk;
use std::ops::Range;

/// Value reported for a slot that has not received any segment yet.
pub const NO_DATA: f64 = f64::NAN;

/// Fixed-capacity per-slot sums and counts with wraparound addressing.
#[derive(Debug, Clone, Default)]
pub struct StreamAccumulator {
    slots: usize,
    width: usize,
    /// Row-major `slots x width`.
    sums: Vec<f64>,
    counts: Vec<u64>,
    cursor: usize,
    ingested: u64,
}

impl StreamAccumulator {
    /// An unconfigured accumulator. `ingest` and `snapshot` fail until
    /// [`configure`](Self::configure) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configured accumulator.
    pub fn with_shape(slots: usize, width: usize) -> JobResult<Self> {
        let mut acc = Self::new();
        acc.configure(slots, width)?;
        Ok(acc)
    }

    /// Allocate zeroed storage for `slots` slots of `width` samples.
    pub fn configure(&mut self, slots: usize, width: usize) -> JobResult<()> {
        if slots == 0 || width == 0 {
            return Err(JobError::InvalidShape { slots, width });
        }
        self.slots = slots;
        self.width = width;
        self.sums.clear();
        self.sums.resize(slots * width, 0.0);
        self.counts.clear();
        self.counts.resize(slots, 0);
        self.cursor = 0;
        self.ingested = 0;
        Ok(())
    }

    /// Configure unless already configured with this exact shape.
    ///
    /// Returns `true` when storage was (re)allocated, `false` when the existing
    /// sums were kept.
    pub fn ensure_shape(&mut self, slots: usize, width: usize) -> JobResult<bool> {
        if self.is_configured() && self.slots == slots && self.width == width {
            return Ok(false);
        }
        self.configure(slots, width)?;
        Ok(true)
    }

    /// Zero all sums and counts and rewind the cursor, keeping the shape.
    pub fn reset(&mut self) {
        self.sums.fill(0.0);
        self.counts.fill(0);
        self.cursor = 0;
        self.ingested = 0;
    }

    /// Point the cursor back at slot 0 without touching sums or counts.
    ///
    /// Used when the hardware restarts its cycle from the first trigger.
    pub fn realign(&mut self) {
        self.cursor = 0;
    }

    /// Whether `configure` has been called.
    pub fn is_configured(&self) -> bool {
        self.slots > 0
    }

    /// Number of slots (`N`).
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Samples per segment (`W`).
    pub fn width(&self) -> usize {
        self.width
    }

    /// Slot the next ingested segment goes to.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Segments ingested since the last configure/reset.
    pub fn total_ingested(&self) -> u64 {
        self.ingested
    }

    /// Per-slot segment counts.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Running sum vector of one slot.
    pub fn slot_sum(&self, slot: usize) -> Option<&[f64]> {
        (slot < self.slots).then(|| self.row(slot))
    }

    /// Fold `K = samples.len() / width` consecutive segments into the slots.
    ///
    /// `samples` must hold a whole number of segments; `K` may be zero or
    /// larger than the slot count. Returns `K`.
    pub fn ingest(&mut self, samples: &[f64]) -> JobResult<usize> {
        self.require_configured()?;
        if samples.len() % self.width != 0 {
            return Err(JobError::MisalignedChunk {
                len: samples.len(),
                width: self.width,
            });
        }

        let start = self.cursor;
        let mut segments = 0;
        for (i, segment) in samples.chunks_exact(self.width).enumerate() {
            self.put(start + i, segment);
            segments += 1;
        }
        self.cursor = (start + segments) % self.slots;
        self.ingested += segments as u64;

        debug_assert_eq!(self.counts.iter().sum::<u64>(), self.ingested);
        Ok(segments)
    }

    /// Ingest a digitizer chunk, checking its segment width first.
    pub fn ingest_chunk(&mut self, chunk: &SegmentChunk) -> JobResult<usize> {
        self.require_configured()?;
        if chunk.segment_size != self.width {
            return Err(JobError::SegmentWidthMismatch {
                expected: self.width,
                actual: chunk.segment_size,
            });
        }
        self.ingest(&chunk.samples)
    }

    /// The only place slot indices are reduced modulo the capacity.
    fn put(&mut self, slot_index: usize, segment: &[f64]) {
        let slot = slot_index % self.slots;
        let offset = slot * self.width;
        for (acc, sample) in self.sums[offset..offset + self.width]
            .iter_mut()
            .zip(segment)
        {
            *acc += sample;
        }
        self.counts[slot] += 1;
    }

    fn row(&self, slot: usize) -> &[f64] {
        let offset = slot * self.width;
        &self.sums[offset..offset + self.width]
    }

    fn require_configured(&self) -> JobResult<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(JobError::AccumulatorNotConfigured)
        }
    }

    fn check_range(&self, range: &Range<usize>) -> JobResult<()> {
        self.require_configured()?;
        if range.start >= range.end || range.end > self.width {
            return Err(JobError::InvalidRange {
                start: range.start,
                end: range.end,
                width: self.width,
            });
        }
        Ok(())
    }

    /// Per-slot average over the sample window `range`:
    /// `mean(sum[range]) / count`, or [`NO_DATA`] for empty slots.
    pub fn snapshot(&self, range: Range<usize>) -> JobResult<Vec<f64>> {
        self.check_range(&range)?;
        let span = (range.end - range.start) as f64;
        Ok((0..self.slots)
            .map(|slot| match self.counts[slot] {
                0 => NO_DATA,
                count => self.row(slot)[range.clone()].iter().sum::<f64>() / span / count as f64,
            })
            .collect())
    }

    /// `snapshot(signal) - snapshot(background)`, slot by slot.
    pub fn subtract_background(
        &self,
        signal: Range<usize>,
        background: Range<usize>,
    ) -> JobResult<Vec<f64>> {
        let signal = self.snapshot(signal)?;
        let background = self.snapshot(background)?;
        Ok(signal
            .iter()
            .zip(&background)
            .map(|(s, b)| s - b)
            .collect())
    }

    /// Per-sample mean waveform of one slot; all [`NO_DATA`] when empty.
    pub fn mean_segment(&self, slot: usize) -> JobResult<Vec<f64>> {
        self.require_configured()?;
        if slot >= self.slots {
            return Err(JobError::InvalidRange {
                start: slot,
                end: slot + 1,
                width: self.slots,
            });
        }
        Ok(match self.counts[slot] {
            0 => vec![NO_DATA; self.width],
            count => self
                .row(slot)
                .iter()
                .map(|sum| sum / count as f64)
                .collect(),
        })
    }

    /// Scale a per-slot series by `weights` normalized to a unit sum of
    /// absolute values. Empty slots stay [`NO_DATA`].
    pub fn weight(series: &[f64], weights: &[f64]) -> JobResult<Vec<f64>> {
        if series.len() != weights.len() {
            return Err(JobError::InvalidWeights(format!(
                "{} weights for a series of {} slots",
                weights.len(),
                series.len()
            )));
        }
        let total: f64 = weights.iter().map(|w| w.abs()).sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(JobError::InvalidWeights(
                "weights must have a finite, non-zero sum".to_string(),
            ));
        }
        Ok(series
            .iter()
            .zip(weights)
            .map(|(value, w)| value * (w.abs() / total))
            .collect())
    }
}
