//! Virtual IO block: named values with delayed write acknowledgement.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

use cellrun_app::ports::{Device, Rate, Readable, StateStreamer, Writable};
use cellrun_app::registry::ConfigurableDevice;
use cellrun_domain::configuration::DeviceConfiguration;
use cellrun_domain::error::{CellError, ProgramError};
use cellrun_domain::state::DeviceState;
use cellrun_domain::value::Value;

fn default_ack_delay_ms() -> u64 {
    10
}

/// Declared fields of a `virtual_io` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualIoSettings {
    /// Values present before the first write.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Delay before a write becomes visible to reads.
    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,
}

impl Default for VirtualIoSettings {
    fn default() -> Self {
        Self {
            inputs: BTreeMap::new(),
            ack_delay_ms: default_ack_delay_ms(),
        }
    }
}

type Values = Arc<Mutex<BTreeMap<String, Value>>>;

/// A simulated IO block.
pub struct VirtualIo {
    identifier: String,
    settings: VirtualIoSettings,
    active: AtomicBool,
    values: Values,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl VirtualIo {
    fn ensure_open(&self) -> Result<(), CellError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CellError::device(&self.identifier, "device is not open"))
        }
    }

    fn snapshot(&self) -> DeviceState {
        let values = lock(&self.values);
        values
            .iter()
            .fold(DeviceState::new(self.identifier.clone()), |state, (key, value)| {
                state.with_reading(key.clone(), value.clone())
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Device for VirtualIo {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), CellError> {
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(identifier = %self.identifier, "virtual io opened");
        Ok(())
    }

    /// Waits for pending writes to be acknowledged.
    async fn close(&self) -> Result<(), CellError> {
        self.active.store(false, Ordering::SeqCst);
        let pending = std::mem::take(&mut *lock(&self.pending));
        for handle in pending {
            if let Err(err) = handle.await {
                tracing::warn!(identifier = %self.identifier, %err, "pending write lost");
            }
        }
        tracing::info!(identifier = %self.identifier, "virtual io closed");
        Ok(())
    }

    fn configuration(&self) -> Option<DeviceConfiguration> {
        self.to_configuration()
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
}

impl ConfigurableDevice for VirtualIo {
    const KIND: &'static str = "virtual_io";
    type Settings = VirtualIoSettings;

    fn from_settings(identifier: String, settings: VirtualIoSettings) -> Result<Self, CellError> {
        let values = Arc::new(Mutex::new(settings.inputs.clone()));
        Ok(Self {
            identifier,
            settings,
            active: AtomicBool::new(false),
            values,
            pending: Mutex::new(Vec::new()),
        })
    }

    fn settings(&self) -> &VirtualIoSettings {
        &self.settings
    }
}

#[async_trait]
impl Readable for VirtualIo {
    async fn read(&self, key: &str) -> Result<Value, CellError> {
        self.ensure_open()?;
        lock(&self.values).get(key).cloned().ok_or_else(|| {
            ProgramError::runtime(format!("device `{}` has no value `{key}`", self.identifier)).into()
        })
    }
}

#[async_trait]
impl Writable for VirtualIo {
    async fn write(&self, key: &str, value: Value) -> Result<(), CellError> {
        self.ensure_open()?;
        let values = Arc::clone(&self.values);
        let key = key.to_string();
        let delay = Duration::from_millis(self.settings.ack_delay_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&values).insert(key, value);
        });
        let mut pending = lock(&self.pending);
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
        Ok(())
    }
}

impl StateStreamer for VirtualIo {
    fn state_stream(&self, rate: Rate) -> BoxStream<'_, DeviceState> {
        let mut interval = tokio::time::interval(rate.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        IntervalStream::new(interval)
            .map(move |_| self.snapshot())
            .boxed()
    }
}
