//! Virtual robot: linear moves at a fixed TCP speed inside a spherical reach.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

use cellrun_app::ports::{Device, Rate, Readable, StateStreamer, Stoppable, Writable};
use cellrun_app::registry::ConfigurableDevice;
use cellrun_domain::configuration::DeviceConfiguration;
use cellrun_domain::error::{CellError, ConfigurationError, MotionError, ProgramError};
use cellrun_domain::motion::{ExecutionResult, Pose, Trajectory, TrajectorySample};
use cellrun_domain::state::DeviceState;
use cellrun_domain::value::Value;

/// Simulated time between two trajectory samples.
const SAMPLE_PERIOD: Duration = Duration::from_millis(20);

fn default_tcp_speed() -> f64 {
    250.0
}

fn default_reach() -> f64 {
    1000.0
}

/// Declared fields of a `virtual_robot` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualRobotSettings {
    /// Tool centre point speed in mm/s.
    #[serde(default = "default_tcp_speed")]
    pub tcp_speed: f64,
    /// Radius of the reachable sphere around the base, in mm.
    #[serde(default = "default_reach")]
    pub reach: f64,
    #[serde(default)]
    pub home: Pose,
}

impl Default for VirtualRobotSettings {
    fn default() -> Self {
        Self {
            tcp_speed: default_tcp_speed(),
            reach: default_reach(),
            home: Pose::default(),
        }
    }
}

struct RobotState {
    pose: Pose,
    moving: bool,
    io: BTreeMap<String, Value>,
    motion_duration: f64,
    trajectories: Vec<Trajectory>,
}

/// A simulated six-axis arm reduced to its tool position.
pub struct VirtualRobot {
    identifier: String,
    settings: VirtualRobotSettings,
    active: AtomicBool,
    halted: watch::Sender<bool>,
    state: Mutex<RobotState>,
}

impl VirtualRobot {
    /// Current tool position.
    #[must_use]
    pub fn pose(&self) -> Pose {
        self.lock_state().pose
    }

    #[must_use]
    pub fn is_moving(&self) -> bool {
        self.lock_state().moving
    }

    /// Move the tool linearly to `target` at the configured TCP speed.
    ///
    /// # Errors
    ///
    /// Returns [`MotionError`] when the device is not open or `target` is out
    /// of reach, and [`CellError::Stopped`] if the robot is stopped before
    /// the move completes. An interrupted move keeps the pose it reached.
    pub async fn move_to(&self, target: Pose) -> Result<(), CellError> {
        if !self.is_active() {
            return Err(self.motion_error("device is not open"));
        }
        if ![target.x, target.y, target.z].iter().all(|c| c.is_finite()) {
            return Err(self.motion_error(format!("target {target:?} is not a finite pose")));
        }
        let distance_from_base = target.distance_to(&Pose::default());
        if distance_from_base > self.settings.reach {
            return Err(self.motion_error(format!(
                "target is {distance_from_base:.1} mm from the base, reach is {:.1} mm",
                self.settings.reach
            )));
        }

        let mut halted = self.halted.subscribe();
        if *halted.borrow() {
            return Err(CellError::Stopped);
        }

        let start = self.pose();
        let duration = start.distance_to(&target) / self.settings.tcp_speed;
        let steps = sample_count(duration);
        let step = Duration::try_from_secs_f64(duration / f64::from(steps)).map_err(|err| {
            self.motion_error(format!("move of {duration} s cannot be timed: {err}"))
        })?;
        self.lock_state().moving = true;
        tracing::debug!(identifier = %self.identifier, ?target, duration, "moving");

        let mut samples = vec![TrajectorySample {
            time: 0.0,
            pose: start,
        }];
        for index in 1..=steps {
            let interrupted = tokio::select! {
                biased;
                _ = halted.wait_for(|halted| *halted) => true,
                () = tokio::time::sleep(step) => false,
            };
            if interrupted {
                tracing::info!(identifier = %self.identifier, "move interrupted");
                self.record_motion(samples);
                return Err(CellError::Stopped);
            }
            let fraction = f64::from(index) / f64::from(steps);
            let pose = start.lerp(&target, fraction);
            samples.push(TrajectorySample {
                time: duration * fraction,
                pose,
            });
            self.lock_state().pose = pose;
        }

        self.record_motion(samples);
        Ok(())
    }

    fn record_motion(&self, samples: Vec<TrajectorySample>) {
        let trajectory = Trajectory { samples };
        let mut state = self.lock_state();
        state.moving = false;
        state.motion_duration += trajectory.duration();
        state.trajectories.push(trajectory);
    }

    fn motion_error(&self, reason: impl Into<String>) -> CellError {
        MotionError {
            identifier: self.identifier.clone(),
            reason: reason.into(),
        }
        .into()
    }

    fn snapshot(&self) -> DeviceState {
        let state = self.lock_state();
        let mut snapshot = DeviceState::new(self.identifier.clone())
            .with_reading("pose.x", state.pose.x)
            .with_reading("pose.y", state.pose.y)
            .with_reading("pose.z", state.pose.z)
            .with_reading("moving", state.moving);
        for (name, value) in &state.io {
            snapshot = snapshot.with_reading(format!("io.{name}"), value.clone());
        }
        snapshot
    }

    fn lock_state(&self) -> MutexGuard<'_, RobotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sample_count(duration: f64) -> u32 {
    let count = (duration / SAMPLE_PERIOD.as_secs_f64()).ceil();
    if count.is_finite() && count >= 1.0 {
        count.min(f64::from(u32::MAX)) as u32
    } else {
        1
    }
}

#[async_trait]
impl Device for VirtualRobot {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), CellError> {
        self.halted.send_replace(false);
        {
            let mut state = self.lock_state();
            state.motion_duration = 0.0;
            state.trajectories.clear();
        }
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(identifier = %self.identifier, "virtual robot opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), CellError> {
        self.active.store(false, Ordering::SeqCst);
        tracing::info!(identifier = %self.identifier, "virtual robot closed");
        Ok(())
    }

    fn configuration(&self) -> Option<DeviceConfiguration> {
        self.to_configuration()
    }

    fn execution_result(&self) -> Option<ExecutionResult> {
        let state = self.lock_state();
        Some(ExecutionResult {
            identifier: self.identifier.clone(),
            motion_duration: state.motion_duration,
            trajectories: state.trajectories.clone(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_state_streamer(&self) -> Option<&dyn StateStreamer> {
        Some(self)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

impl ConfigurableDevice for VirtualRobot {
    const KIND: &'static str = "virtual_robot";
    type Settings = VirtualRobotSettings;

    fn from_settings(identifier: String, settings: VirtualRobotSettings) -> Result<Self, CellError> {
        let invalid = |reason: &str| ConfigurationError::Invalid {
            kind: Self::KIND.to_string(),
            reason: reason.to_string(),
        };
        if !(settings.tcp_speed.is_finite() && settings.tcp_speed > 0.0) {
            return Err(invalid("tcp_speed must be positive").into());
        }
        if !(settings.reach.is_finite() && settings.reach > 0.0) {
            return Err(invalid("reach must be positive").into());
        }
        let home = settings.home;
        Ok(Self {
            identifier,
            settings,
            active: AtomicBool::new(false),
            halted: watch::Sender::new(false),
            state: Mutex::new(RobotState {
                pose: home,
                moving: false,
                io: BTreeMap::new(),
                motion_duration: 0.0,
                trajectories: Vec::new(),
            }),
        })
    }

    fn settings(&self) -> &VirtualRobotSettings {
        &self.settings
    }
}

#[async_trait]
impl Readable for VirtualRobot {
    async fn read(&self, key: &str) -> Result<Value, CellError> {
        let state = self.lock_state();
        let value = match key {
            "pose.x" => Some(Value::Float(state.pose.x)),
            "pose.y" => Some(Value::Float(state.pose.y)),
            "pose.z" => Some(Value::Float(state.pose.z)),
            "moving" => Some(Value::Bool(state.moving)),
            _ => key
                .strip_prefix("io.")
                .and_then(|name| state.io.get(name).cloned()),
        };
        value.ok_or_else(|| {
            ProgramError::runtime(format!("device `{}` has no value `{key}`", self.identifier)).into()
        })
    }
}

#[async_trait]
impl Writable for VirtualRobot {
    async fn write(&self, key: &str, value: Value) -> Result<(), CellError> {
        let Some(name) = key.strip_prefix("io.") else {
            return Err(ProgramError::runtime(format!(
                "device `{}` cannot write `{key}`",
                self.identifier
            ))
            .into());
        };
        self.lock_state().io.insert(name.to_string(), value);
        Ok(())
    }
}

impl StateStreamer for VirtualRobot {
    fn state_stream(&self, rate: Rate) -> BoxStream<'_, DeviceState> {
        let mut interval = tokio::time::interval(rate.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        IntervalStream::new(interval)
            .map(move |_| self.snapshot())
            .boxed()
    }
}

#[async_trait]
impl Stoppable for VirtualRobot {
    async fn stop(&self) -> Result<(), CellError> {
        tracing::info!(identifier = %self.identifier, "virtual robot stopped");
        self.halted.send_replace(true);
        Ok(())
    }
}
