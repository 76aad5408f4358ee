//! Device port: lifecycle plus the four optional capabilities.
//!
//! A device bridges some transport (REST, message bus, field bus, or a
//! simulation) into a cell. The cell drives the lifecycle in order:
//!
//! 1. [`open`](Device::open): acquire connections
//! 2. (the program runs, calling capabilities)
//! 3. [`close`](Device::close): release everything acquired in `open`
//!
//! Capabilities are declared, not inferred from the type: a device overrides
//! the matching `as_*` accessor to hand out a view of itself. The cell only
//! ever filters devices through these accessors.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use cellrun_domain::configuration::DeviceConfiguration;
use cellrun_domain::error::CellError;
use cellrun_domain::motion::ExecutionResult;
use cellrun_domain::state::DeviceState;
use cellrun_domain::value::Value;

/// Sampling rate for state streams, in samples per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate(u32);

impl Rate {
    /// A rate of `hz` samples per second; zero is raised to one.
    #[must_use]
    pub fn hertz(hz: u32) -> Self {
        Self(hz.max(1))
    }

    #[must_use]
    pub fn as_hertz(self) -> u32 {
        self.0
    }

    /// Time between two samples.
    #[must_use]
    pub fn period(self) -> Duration {
        Duration::from_secs(1) / self.0
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self(10)
    }
}

/// A uniformly-lifecycled unit inside a cell.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// Name of the device, unique within its cell.
    fn identifier(&self) -> &str;

    /// `true` between a successful [`open`](Self::open) and [`close`](Self::close).
    fn is_active(&self) -> bool;

    /// Acquire whatever the device needs to operate.
    async fn open(&self) -> Result<(), CellError>;

    /// Release everything acquired in [`open`](Self::open).
    async fn close(&self) -> Result<(), CellError>;

    /// The configuration this device was built from, if it has one.
    ///
    /// Built-in devices without a registry kind return `None` and are left
    /// out of [`Cell::to_configurations`](crate::cell::Cell::to_configurations).
    fn configuration(&self) -> Option<DeviceConfiguration> {
        None
    }

    /// Motion summary for the run record, for devices that execute motions.
    fn execution_result(&self) -> Option<ExecutionResult> {
        None
    }

    /// Concrete-type access for typed lookups.
    fn as_any(&self) -> &dyn Any;

    fn as_readable(&self) -> Option<&dyn Readable> {
        None
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        None
    }

    fn as_state_streamer(&self) -> Option<&dyn StateStreamer> {
        None
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }
}

/// Devices whose values can be read by key.
#[async_trait]
pub trait Readable: Send + Sync {
    async fn read(&self, key: &str) -> Result<Value, CellError>;
}

/// Devices that accept values by key.
///
/// A write is acknowledged asynchronously: a following [`Readable::read`]
/// is not guaranteed to observe the new value immediately.
#[async_trait]
pub trait Writable: Send + Sync {
    async fn write(&self, key: &str, value: Value) -> Result<(), CellError>;
}

/// Devices that publish their state as a stream.
pub trait StateStreamer: Send + Sync {
    /// Start a new state stream sampled at `rate`.
    ///
    /// The stream is infinite unless the device says otherwise. It is not a
    /// replayable cursor: call this again to start over.
    fn state_stream(&self, rate: Rate) -> BoxStream<'_, DeviceState>;
}

/// Devices that can be halted.
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Halt any ongoing activity. Calling it again is harmless.
    async fn stop(&self) -> Result<(), CellError>;
}
