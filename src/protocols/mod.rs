//! Built-in experiment protocols.

pub mod dummy;
pub mod pulsed;

pub use dummy::DummyMeasurement;
pub use pulsed::PulsedReadout;

use crate::experiment::ProtocolRegistry;

/// Register every built-in protocol kind.
pub fn register_builtin(registry: &mut ProtocolRegistry) {
    registry.register(DummyMeasurement::KIND, || Box::new(DummyMeasurement::new()));
    registry.register(PulsedReadout::KIND, || Box::new(PulsedReadout::new()));
}
