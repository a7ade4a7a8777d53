//! Job lifecycle states.
//!
//! # State Machine
//!
//! ```text
//!            submit                setup ok
//! ┌──────┐ ─────────▶ ┌──────┐ ─────────────▶ ┌─────┐ ── idx_run == num_run ──▶ ┌──────┐
//! │ idle │            │ wait │                │ run │                           │ done │
//! └──────┘ ◀───────── └──────┘ ◀───────────── └─────┘ ── fault ───────────────▶ ┌───────┐
//!     ▲       stop      │    pause/preempt     │                                │ error │
//!     │                 │ setup failure        │                                └───────┘
//!     └────── stop ─────┼──────────────────────┘
//!                       └──────────────────────────────────────────────────────▶ error
//! ```
//!
//! `done` and `error` return to `wait` on resubmission.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created or stopped; not scheduled
    Idle,
    /// Queued, paused, or preempted
    Wait,
    /// Setup done, ticking on its worker thread
    Run,
    /// Ran to the end of its budget
    Done,
    /// A hook failed
    Error,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Wait => write!(f, "wait"),
            JobState::Run => write!(f, "run"),
            JobState::Done => write!(f, "done"),
            JobState::Error => write!(f, "error"),
        }
    }
}

impl JobState {
    /// `done` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, next),
            (Idle | Wait | Done | Error, Wait)
                | (Wait, Run)
                | (Run, Wait)
                | (Run | Wait | Idle, Idle)
                | (Run, Done)
                | (Run | Wait, Error)
                | (Done | Error, Idle)
        )
    }

    /// Checked transition.
    pub fn transition(&self, next: JobState) -> JobResult<JobState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(JobError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}
