//! Parameter, data and state containers exchanged between jobs and callers.

use crate::error::{JobError, JobResult};
use crate::experiment::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single protocol parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Real number
    Float(f64),
    /// Free text (channel names, modes)
    Text(String),
    /// Sweep values, weights
    Array(Vec<f64>),
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(value: Vec<f64>) -> Self {
        ParamValue::Array(value)
    }
}

/// Named protocol parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Insert or replace. Returns `true` if the stored value changed.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> bool {
        let value = value.into();
        let name = name.into();
        if self.values.get(&name) == Some(&value) {
            return false;
        }
        self.values.insert(name, value);
        true
    }

    /// Overlay every entry of `other`. Returns `true` if anything changed.
    pub fn merge(&mut self, other: &ParameterSet) -> bool {
        let mut changed = false;
        for (name, value) in &other.values {
            changed |= self.set(name.clone(), value.clone());
        }
        changed
    }

    /// Raw value.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn require(&self, name: &str) -> JobResult<&ParamValue> {
        self.values
            .get(name)
            .ok_or_else(|| JobError::Parameter(format!("missing parameter '{}'", name)))
    }

    /// Numeric parameter (integers widen).
    pub fn get_f64(&self, name: &str) -> JobResult<f64> {
        match self.require(name)? {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v as f64),
            other => Err(type_error(name, "a number", other)),
        }
    }

    /// Non-negative integer parameter.
    pub fn get_usize(&self, name: &str) -> JobResult<usize> {
        match self.require(name)? {
            ParamValue::Int(v) => usize::try_from(*v)
                .map_err(|_| JobError::Parameter(format!("'{}' must be >= 0, got {}", name, v))),
            other => Err(type_error(name, "an integer", other)),
        }
    }

    /// Boolean parameter.
    pub fn get_bool(&self, name: &str) -> JobResult<bool> {
        match self.require(name)? {
            ParamValue::Bool(v) => Ok(*v),
            other => Err(type_error(name, "a boolean", other)),
        }
    }

    /// Text parameter.
    pub fn get_text(&self, name: &str) -> JobResult<&str> {
        match self.require(name)? {
            ParamValue::Text(v) => Ok(v),
            other => Err(type_error(name, "text", other)),
        }
    }

    /// Array parameter.
    pub fn get_array(&self, name: &str) -> JobResult<&[f64]> {
        match self.require(name)? {
            ParamValue::Array(v) => Ok(v),
            other => Err(type_error(name, "an array", other)),
        }
    }
}

fn type_error(name: &str, expected: &str, found: &ParamValue) -> JobError {
    JobError::Parameter(format!("'{}' must be {}, found {:?}", name, expected, found))
}

/// Named result arrays, republished after every tick.
///
/// `revision` counts publishes since the job last started fresh, so a poller
/// can tell whether anything changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    revision: u64,
    arrays: BTreeMap<String, Vec<f64>>,
}

impl DataSet {
    /// Empty data set at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an array.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.arrays.insert(name.into(), values);
    }

    /// Store a scalar as a one-element array.
    pub fn set_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.arrays.insert(name.into(), vec![value]);
    }

    /// Array by name.
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.arrays.get(name).map(Vec::as_slice)
    }

    /// Scalar by name (first element).
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|values| values.first().copied())
    }

    /// Array names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    /// Number of arrays.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    /// Whether no array is stored.
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Number of publishes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Drop all arrays and rewind the revision.
    pub fn clear(&mut self) {
        self.arrays.clear();
        self.revision = 0;
    }

    /// Copy the arrays of a working set and bump the revision.
    pub(crate) fn publish_from(&mut self, working: &DataSet) {
        self.arrays.clone_from(&working.arrays);
        self.revision += 1;
    }
}

/// Read-only snapshot of a job's scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSet {
    /// Scheduling priority
    pub priority: i32,
    /// Lifecycle state
    pub state: JobState,
    /// Ticks completed
    pub idx_run: u64,
    /// Tick budget (`None` = unbounded)
    pub num_run: Option<u64>,
    /// Accumulated run time in seconds
    pub time_run: f64,
    /// Wall-clock budget in seconds
    pub time_stop: Option<f64>,
    /// Whether progress survives the next start
    pub tokeep: bool,
    /// Identifier of the current/last worker session
    pub run_id: Option<Uuid>,
    /// When the current/last session started
    pub started_at: Option<DateTime<Utc>>,
}

impl StateSet {
    /// Completed fraction of the tick budget, when bounded.
    pub fn progress(&self) -> Option<f64> {
        match self.num_run {
            Some(0) => Some(1.0),
            Some(total) => Some(self.idx_run as f64 / total as f64),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_changes() {
        let mut params = ParameterSet::new().with("freq", 2.87e9);
        assert!(!params.set("freq", 2.87e9));
        assert!(params.set("freq", 2.88e9));
        assert!(params.set("power", -10.0));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_typed_getters() {
        let params = ParameterSet::new()
            .with("points", 8_i64)
            .with("amp", 0.5)
            .with("enabled", true)
            .with("channel", "ch0")
            .with("weights", vec![1.0, 2.0]);

        assert_eq!(params.get_usize("points").unwrap(), 8);
        assert_eq!(params.get_f64("points").unwrap(), 8.0);
        assert_eq!(params.get_f64("amp").unwrap(), 0.5);
        assert!(params.get_bool("enabled").unwrap());
        assert_eq!(params.get_text("channel").unwrap(), "ch0");
        assert_eq!(params.get_array("weights").unwrap(), &[1.0, 2.0]);

        assert!(params.get_usize("amp").is_err());
        assert!(params.get_f64("missing").is_err());
    }

    #[test]
    fn test_negative_usize_rejected() {
        let params = ParameterSet::new().with("points", -3_i64);
        assert!(matches!(params.get_usize("points"), Err(JobError::Parameter(_))));
    }

    #[test]
    fn test_parameters_from_toml() {
        let params: ParameterSet = toml::from_str(
            r#"
            points = 4
            rate_refresh = 12.5
            mode = "cw"
            weights = [1, 2, 3]
            "#,
        )
        .unwrap();

        assert_eq!(params.get_usize("points").unwrap(), 4);
        assert_eq!(params.get_f64("rate_refresh").unwrap(), 12.5);
        assert_eq!(params.get_text("mode").unwrap(), "cw");
        assert_eq!(params.get_array("weights").unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_merge() {
        let mut base = ParameterSet::new().with("a", 1_i64).with("b", 2_i64);
        let overlay = ParameterSet::new().with("b", 2_i64).with("c", 3_i64);
        assert!(base.merge(&overlay));
        assert!(!base.merge(&overlay));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_dataset_publish_bumps_revision() {
        let mut working = DataSet::new();
        working.insert("signal", vec![1.0, 2.0]);
        working.set_scalar("count", 3.0);

        let mut published = DataSet::new();
        published.publish_from(&working);
        published.publish_from(&working);

        assert_eq!(published.revision(), 2);
        assert_eq!(published.get("signal"), Some(&[1.0, 2.0][..]));
        assert_eq!(published.scalar("count"), Some(3.0));

        published.clear();
        assert_eq!(published.revision(), 0);
        assert!(published.is_empty());
    }

    #[test]
    fn test_progress() {
        let state = StateSet {
            priority: 0,
            state: JobState::Run,
            idx_run: 5,
            num_run: Some(10),
            time_run: 1.0,
            time_stop: None,
            tokeep: false,
            run_id: None,
            started_at: None,
        };
        assert_eq!(state.progress(), Some(0.5));
        assert_eq!(
            StateSet {
                num_run: None,
                ..state
            }
            .progress(),
            None
        );
    }
}
