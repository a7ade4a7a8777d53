//! Hardware collaborators shared by all jobs.
//!
//! [`HardwarePool`] is an explicit service object: the application builds one
//! at startup and hands an `Arc` of it to every job. There is no global
//! registry. The pool itself does no locking; the scheduler's
//! single-running-job rule is what serializes hardware access.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    Digitizer, DigitizerConfig, Pulse, PulseSequencer, Repeats, SegmentChunk, Source,
    TriggerRearm, TriggerStart, DIGITIZER_TRIGGER, LASER_GATE, MW_GATE,
};

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The instruments one experiment station drives.
#[derive(Clone)]
pub struct HardwarePool {
    digitizer: Arc<dyn Digitizer>,
    sequencer: Arc<dyn PulseSequencer>,
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl fmt::Debug for HardwarePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwarePool")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HardwarePool {
    /// Pool with a digitizer and a sequencer and no sources.
    pub fn new(digitizer: Arc<dyn Digitizer>, sequencer: Arc<dyn PulseSequencer>) -> Self {
        Self {
            digitizer,
            sequencer,
            sources: BTreeMap::new(),
        }
    }

    /// Register a named source (e.g. "laser", "mw").
    pub fn with_source(mut self, name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// The digitizer.
    pub fn digitizer(&self) -> &dyn Digitizer {
        self.digitizer.as_ref()
    }

    /// The pulse sequencer.
    pub fn sequencer(&self) -> &dyn PulseSequencer {
        self.sequencer.as_ref()
    }

    /// A source by name.
    pub fn source(&self, name: &str) -> Result<&dyn Source> {
        self.sources
            .get(name)
            .map(|source| source.as_ref())
            .ok_or_else(|| anyhow!("No source named '{}' in hardware pool", name))
    }

    /// Registered source names.
    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::SimulatedLab;

    #[test]
    fn test_source_lookup() {
        let lab = SimulatedLab::new(1);
        let pool = lab.pool();

        assert!(pool.source("laser").is_ok());
        assert!(pool.source("mw").is_ok());
        let err = pool.source("rf").err().unwrap();
        assert!(err.to_string().contains("No source named 'rf'"));
        assert_eq!(pool.source_names().collect::<Vec<_>>(), vec!["laser", "mw"]);
    }
}
