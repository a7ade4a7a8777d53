//! Custom error types for the job scheduler.
//!
//! `JobError` is the single error enum of the crate. It is built with
//! `thiserror` so every variant carries a readable message and lower-level
//! errors convert through `#[from]`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parse failures from `figment` and
//!   semantic validation failures of an otherwise well-formed file.
//! - **`SetupFailure`**: a protocol's setup hook (usually hardware rejecting a
//!   configuration) failed; the job goes to `error` without reaching `run`.
//! - **`RuntimeFault`**: a run/organize hook returned an error or panicked.
//! - **Accumulator errors**: shape, alignment and range problems detected by
//!   `StreamAccumulator` before any slot is touched.
//!
//! Lifecycle hooks and hardware drivers return `anyhow::Result`; the job
//! lifecycle folds those into `SetupFailure`/`RuntimeFault` with the full
//! context chain rendered into `reason`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Errors produced by the scheduler, the job lifecycle and the accumulator.
#[derive(Error, Debug)]
pub enum JobError {
    /// Configuration source could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The protocol's setup hook failed.
    #[error("Setup failed for job '{job}': {reason}")]
    SetupFailure {
        /// Job name.
        job: String,
        /// Rendered cause.
        reason: String,
    },

    /// A hook failed or panicked after setup.
    #[error("Runtime fault in job '{job}' during {phase}: {reason}")]
    RuntimeFault {
        /// Job name.
        job: String,
        /// Lifecycle phase that failed (`run`, `organize`, ...).
        phase: String,
        /// Rendered cause.
        reason: String,
    },

    /// A lifecycle transition that the state table forbids.
    #[error("Illegal state transition {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// `ingest`/`snapshot` called before `configure`.
    #[error("Accumulator is not configured")]
    AccumulatorNotConfigured,

    /// `configure` called with a zero dimension.
    #[error("Invalid accumulator shape: {slots} slots x {width} samples")]
    InvalidShape {
        /// Requested slot count.
        slots: usize,
        /// Requested segment width.
        width: usize,
    },

    /// A chunk whose length is not a whole number of segments.
    #[error("Chunk of {len} samples is not a whole number of {width}-sample segments")]
    MisalignedChunk {
        /// Chunk length in samples.
        len: usize,
        /// Configured segment width.
        width: usize,
    },

    /// A chunk acquired with a different segment width than configured.
    #[error("Segment width mismatch: accumulator expects {expected} samples, chunk has {actual}")]
    SegmentWidthMismatch {
        /// Configured width.
        expected: usize,
        /// Chunk width.
        actual: usize,
    },

    /// A sample window outside the segment.
    #[error("Sample range {start}..{end} is invalid for segment width {width}")]
    InvalidRange {
        /// Window start.
        start: usize,
        /// Window end (exclusive).
        end: usize,
        /// Configured segment width.
        width: usize,
    },

    /// A weight vector that cannot be normalized against the series.
    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    /// No protocol registered under this kind.
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// A parameter is missing or has the wrong type.
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// The OS refused to spawn a worker thread.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<figment::Error> for JobError {
    fn from(err: figment::Error) -> Self {
        JobError::Config(Box::new(err))
    }
}
