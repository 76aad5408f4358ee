//! Opaque run identifiers backed by UUIDs.
//!
//! Devices are addressed by their human-chosen string identifier; only
//! program runs carry a generated id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a [`ProgramRun`](crate::run::ProgramRun).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(uuid::Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl RunId {
    /// Generate a fresh random run id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn as_uuid(self) -> uuid::Uuid {
        self.0
    }

    /// First eight hex digits, handy for thread names and log fields.
    #[must_use]
    pub fn short(self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_generate_distinct_run_ids() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn should_parse_displayed_run_id() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn should_serialize_as_plain_uuid_string() {
        let uuid = uuid::Uuid::new_v4();
        let json = serde_json::to_string(&RunId::from_uuid(uuid)).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }

    #[test]
    fn should_reject_malformed_run_id() {
        assert!(RunId::from_str("run-1").is_err());
    }

    #[test]
    fn should_shorten_to_eight_characters() {
        assert_eq!(RunId::new().short().len(), 8);
    }
}
