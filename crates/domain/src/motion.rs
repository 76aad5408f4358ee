//! Motion records: poses and the trajectories a device executed.
//!
//! Planning and kinematics happen elsewhere; these types only describe what
//! was executed so it can be reported in a run record.

use serde::{Deserialize, Serialize};

/// Cartesian TCP position in millimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Pose {
    #[must_use]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance_to(&self, other: &Pose) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }

    /// Linear interpolation; `t = 0` is `self`, `t = 1` is `target`.
    #[must_use]
    pub fn lerp(&self, target: &Pose, t: f64) -> Pose {
        Pose {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
            z: self.z + (target.z - self.z) * t,
        }
    }
}

/// One timed sample along an executed trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    /// Seconds since the start of the motion.
    pub time: f64,
    pub pose: Pose,
}

/// An executed motion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub samples: Vec<TrajectorySample>,
}

impl Trajectory {
    /// Duration covered by the samples, in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.samples.last().map_or(0.0, |s| s.time)
    }
}

/// Per-device summary collected at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub identifier: String,
    /// Accumulated motion time in seconds.
    pub motion_duration: f64,
    pub trajectories: Vec<Trajectory>,
}
