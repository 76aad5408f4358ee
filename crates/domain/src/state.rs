//! Device state samples, the items of a state stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::time::{Timestamp, now};
use crate::value::Value;

/// A snapshot of one device's observable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub identifier: String,
    pub timestamp: Timestamp,
    pub readings: BTreeMap<String, Value>,
}

impl DeviceState {
    /// An empty sample for `identifier`, stamped now.
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp: now(),
            readings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_reading(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.readings.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn reading(&self, key: &str) -> Option<&Value> {
        self.readings.get(key)
    }
}
