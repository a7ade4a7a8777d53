//! Accumulation and snapshot containers.
pub mod accumulator;
pub mod sets;

pub use accumulator::{StreamAccumulator, NO_DATA};
pub use sets::{DataSet, ParamValue, ParameterSet, StateSet};
