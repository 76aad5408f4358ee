//! Cell: the device aggregate a program runs against.
//!
//! A cell owns a set of devices keyed by their identifier and gives them one
//! lifecycle: open them all, close everything that opened, stop everything
//! that can stop, and merge every state stream into one.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use futures::stream::{BoxStream, StreamExt, select_all};

use cellrun_domain::configuration::DeviceConfiguration;
use cellrun_domain::error::{
    Capability, CellError, ConfigurationError, DeviceNotFoundError, MissingCapabilityError,
};
use cellrun_domain::motion::ExecutionResult;
use cellrun_domain::state::DeviceState;

use crate::ports::{Device, Rate, Readable, Stoppable, Writable};
use crate::registry::DeviceRegistry;
use crate::sync::{lock, panic_message};
use crate::timer::{TIMER, Timer};

/// A named collection of devices with a shared lifecycle.
///
/// Use [`Cell::scoped`] (or pair [`open`](Cell::open) with
/// [`close`](Cell::close) on every path) so hardware connections are never
/// left to drop order. A cell is opened by one holder at a time.
pub struct Cell {
    devices: BTreeMap<String, Arc<dyn Device>>,
    claimed: AtomicBool,
    opened: Mutex<Vec<Arc<dyn Device>>>,
}

impl Default for Cell {
    fn default() -> Self {
        let mut devices: BTreeMap<String, Arc<dyn Device>> = BTreeMap::new();
        devices.insert(TIMER.to_string(), Arc::new(Timer::default()));
        Self {
            devices,
            claimed: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }
}

impl Cell {
    /// A cell holding only the built-in timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cell from configurations, constructing each device through
    /// `registry`.
    ///
    /// Devices built before a failing entry are dropped, not rolled back:
    /// construction acquires nothing, only [`open`](Self::open) does.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown kinds, malformed settings
    /// or duplicate identifiers, or whatever a device constructor rejects.
    pub fn from_configurations(
        registry: &DeviceRegistry,
        configurations: impl IntoIterator<Item = DeviceConfiguration>,
    ) -> Result<Self, CellError> {
        let mut cell = Self::new();
        for config in configurations {
            let device = registry.construct(&config)?;
            cell.insert_shared(device)?;
        }
        Ok(cell)
    }

    /// Add an explicitly constructed device.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::DuplicateDevice`] if the identifier is taken.
    pub fn insert(&mut self, device: impl Device) -> Result<(), CellError> {
        self.insert_shared(Arc::new(device))
    }

    fn insert_shared(&mut self, device: Arc<dyn Device>) -> Result<(), CellError> {
        let identifier = device.identifier().to_string();
        if self.devices.contains_key(&identifier) {
            return Err(ConfigurationError::DuplicateDevice { identifier }.into());
        }
        self.devices.insert(identifier, device);
        Ok(())
    }

    /// Look up a device by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::DeviceNotFound`] when absent.
    pub fn get(&self, identifier: &str) -> Result<&dyn Device, CellError> {
        self.devices
            .get(identifier)
            .map(|device| &**device)
            .ok_or_else(|| {
                DeviceNotFoundError {
                    identifier: identifier.to_string(),
                }
                .into()
            })
    }

    /// Look up a device and downcast it to its concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::DeviceNotFound`] when absent, or
    /// [`CellError::DeviceType`] when the device is of another type.
    pub fn device<T: Device>(&self, identifier: &str) -> Result<&T, CellError> {
        self.get(identifier)?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| CellError::DeviceType {
                identifier: identifier.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// The built-in timer.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::DeviceType`] if the timer slot was taken over.
    pub fn timer(&self) -> Result<&Timer, CellError> {
        self.device::<Timer>(TIMER)
    }

    /// # Errors
    ///
    /// Returns [`CellError::DeviceNotFound`] or [`CellError::MissingCapability`].
    pub fn readable(&self, identifier: &str) -> Result<&dyn Readable, CellError> {
        let device = self.get(identifier)?;
        device
            .as_readable()
            .ok_or_else(|| missing(identifier, Capability::Read))
    }

    /// # Errors
    ///
    /// Returns [`CellError::DeviceNotFound`] or [`CellError::MissingCapability`].
    pub fn writable(&self, identifier: &str) -> Result<&dyn Writable, CellError> {
        let device = self.get(identifier)?;
        device
            .as_writable()
            .ok_or_else(|| missing(identifier, Capability::Write))
    }

    /// # Errors
    ///
    /// Returns [`CellError::DeviceNotFound`] or [`CellError::MissingCapability`].
    pub fn stoppable(&self, identifier: &str) -> Result<&dyn Stoppable, CellError> {
        let device = self.get(identifier)?;
        device
            .as_stoppable()
            .ok_or_else(|| missing(identifier, Capability::Stop))
    }

    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.devices.contains_key(identifier)
    }

    /// Device identifiers in sorted order.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether the cell is open, from the start of [`open`](Self::open)
    /// until the end of [`close`](Self::close).
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Open every device concurrently.
    ///
    /// If any device fails or panics, every device that did open is closed
    /// again and the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::AlreadyOpen`] while the cell is open, otherwise
    /// the first error raised by a device's `open`.
    #[tracing::instrument(skip(self), fields(devices = self.devices.len()))]
    pub async fn open(&self) -> Result<(), CellError> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            tracing::warn!("cell is already open");
            return Err(CellError::AlreadyOpen);
        }

        let attempts = join_all(self.devices.values().map(|device| async move {
            let result = guarded(device.open()).await;
            (Arc::clone(device), result)
        }))
        .await;

        let mut first_error = None;
        let mut opened = Vec::with_capacity(attempts.len());
        for (device, result) in attempts {
            match result {
                Ok(()) => opened.push(device),
                Err(err) => {
                    tracing::warn!(identifier = device.identifier(), %err, "device failed to open");
                    first_error.get_or_insert(err);
                }
            }
        }
        lock(&self.opened).extend(opened);

        if let Some(err) = first_error {
            if let Err(close_err) = self.close().await {
                tracing::warn!(%close_err, "failed to close devices after partial open");
            }
            return Err(err);
        }

        tracing::info!("cell opened");
        Ok(())
    }

    /// Close every device that was opened, concurrently, and release the
    /// cell for the next [`open`](Self::open).
    ///
    /// All devices are asked to close even if some of them fail or panic.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a device's `close`.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> Result<(), CellError> {
        let opened = std::mem::take(&mut *lock(&self.opened));
        let results = join_all(opened.iter().map(|device| async move {
            let result = guarded(device.close()).await;
            if let Err(err) = &result {
                tracing::warn!(identifier = device.identifier(), %err, "device failed to close");
            }
            result
        }))
        .await;

        self.claimed.store(false, Ordering::SeqCst);
        tracing::info!(closed = opened.len(), "cell closed");
        results.into_iter().collect::<Result<Vec<()>, _>>().map(drop)
    }

    /// Run `body` between [`open`](Self::open) and [`close`](Self::close).
    ///
    /// The cell is closed on every exit path, including a panicking body
    /// (the panic is resumed after closing). When both the body and closing
    /// fail, the body's error wins.
    ///
    /// # Errors
    ///
    /// Returns the open error, the body's error, or the close error.
    pub async fn scoped<T, F>(&self, body: F) -> Result<T, CellError>
    where
        F: for<'c> FnOnce(&'c Cell) -> BoxFuture<'c, Result<T, CellError>>,
    {
        self.open().await?;
        let outcome = AssertUnwindSafe(body(self)).catch_unwind().await;
        let closed = self.close().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) | (Ok(_), Err(err)) => Err(err),
        }
    }

    /// Ask every stoppable device to stop, concurrently.
    ///
    /// A failing device never prevents the others from being asked.
    ///
    /// # Errors
    ///
    /// Returns the first failure after every device was attempted.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), CellError> {
        let stops = self.devices.values().filter_map(|device| {
            let stoppable = device.as_stoppable()?;
            Some(async move { (device.identifier(), guarded(stoppable.stop()).await) })
        });

        let mut first_error = None;
        for (identifier, result) in join_all(stops).await {
            if let Err(err) = result {
                tracing::warn!(identifier, %err, "device failed to stop");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Merge the state streams of every state-streaming device.
    ///
    /// Items are yielded as they arrive, across devices. The merged stream
    /// ends once every device stream has ended; dropping it drops every
    /// device stream.
    pub fn state_stream(&self, rate: Rate) -> BoxStream<'_, DeviceState> {
        let streams: Vec<_> = self
            .devices
            .values()
            .filter_map(|device| device.as_state_streamer())
            .map(|streamer| streamer.state_stream(rate))
            .collect();
        tracing::debug!(streams = streams.len(), rate_hz = rate.as_hertz(), "merging state streams");
        select_all(streams).boxed()
    }

    /// Configurations of every device that exposes one.
    #[must_use]
    pub fn to_configurations(&self) -> Vec<DeviceConfiguration> {
        self.devices
            .values()
            .filter_map(|device| device.configuration())
            .collect()
    }

    /// Motion summaries of every device that reports one.
    #[must_use]
    pub fn execution_results(&self) -> Vec<ExecutionResult> {
        self.devices
            .values()
            .filter_map(|device| device.execution_result())
            .collect()
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Turn a panic inside a device call into [`CellError::Panicked`].
async fn guarded(call: BoxFuture<'_, Result<(), CellError>>) -> Result<(), CellError> {
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(CellError::Panicked(panic_message(&*panic))))
}

fn missing(identifier: &str, capability: Capability) -> CellError {
    MissingCapabilityError {
        identifier: identifier.to_string(),
        capability,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;

    use cellrun_domain::value::Value;

    use crate::ports::StateStreamer;
    use crate::registry::tests::{Gripper, gripper_config, registry};

    // ── Counting device ────────────────────────────────────────────

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        stopped: AtomicUsize,
        streams_dropped: AtomicUsize,
    }

    struct Probe {
        identifier: String,
        counters: Arc<Counters>,
        fail_open: bool,
        fail_stop: bool,
        panic_open: bool,
        panic_close: bool,
        stream_len: Option<usize>,
        active: AtomicBool,
    }

    impl Probe {
        fn new(identifier: &str, counters: &Arc<Counters>) -> Self {
            Self {
                identifier: identifier.to_string(),
                counters: Arc::clone(counters),
                fail_open: false,
                fail_stop: false,
                panic_open: false,
                panic_close: false,
                stream_len: None,
                active: AtomicBool::new(false),
            }
        }

        fn failing_open(mut self) -> Self {
            self.fail_open = true;
            self
        }

        fn failing_stop(mut self) -> Self {
            self.fail_stop = true;
            self
        }

        fn panicking_open(mut self) -> Self {
            self.panic_open = true;
            self
        }

        fn panicking_close(mut self) -> Self {
            self.panic_close = true;
            self
        }

        fn streaming(mut self, len: usize) -> Self {
            self.stream_len = Some(len);
            self
        }
    }

    #[async_trait]
    impl Device for Probe {
        fn identifier(&self) -> &str {
            &self.identifier
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        async fn open(&self) -> Result<(), CellError> {
            if self.fail_open {
                return Err(CellError::device(&self.identifier, "connection refused"));
            }
            assert!(!self.panic_open, "driver crashed");
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), CellError> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
            assert!(!self.panic_close, "brake released twice");
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_readable(&self) -> Option<&dyn Readable> {
            Some(self)
        }

        fn as_state_streamer(&self) -> Option<&dyn StateStreamer> {
            self.stream_len.map(|_| self as &dyn StateStreamer)
        }

        fn as_stoppable(&self) -> Option<&dyn Stoppable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Readable for Probe {
        async fn read(&self, key: &str) -> Result<Value, CellError> {
            Ok(Value::from(format!("{}:{key}", self.identifier)))
        }
    }

    #[async_trait]
    impl Stoppable for Probe {
        async fn stop(&self) -> Result<(), CellError> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(CellError::device(&self.identifier, "brake fault"));
            }
            Ok(())
        }
    }

    struct DropGuard(Arc<Counters>);

    impl Drop for DropGuard {
        fn drop(&mut self) {
            self.0.streams_dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StateStreamer for Probe {
        fn state_stream(&self, _rate: Rate) -> BoxStream<'_, DeviceState> {
            let len = self.stream_len.unwrap_or(0);
            let guard = DropGuard(Arc::clone(&self.counters));
            stream::unfold((0, guard), move |(n, guard)| async move {
                if n == len {
                    return None;
                }
                tokio::task::yield_now().await;
                let state = DeviceState::new(self.identifier.clone())
                    .with_reading("n", i64::try_from(n).unwrap_or(i64::MAX));
                Some((state, (n + 1, guard)))
            })
            .boxed()
        }
    }

    fn probe_cell(probes: Vec<Probe>) -> Cell {
        let mut cell = Cell::new();
        for probe in probes {
            cell.insert(probe).unwrap();
        }
        cell
    }

    // ── Construction & lookup ──────────────────────────────────────

    #[test]
    fn should_contain_timer_by_default() {
        let cell = Cell::new();
        assert!(cell.contains(TIMER));
        assert_eq!(cell.len(), 1);
        assert!(cell.timer().is_ok());
    }

    #[test]
    fn should_key_devices_by_their_identifier() {
        let cell =
            Cell::from_configurations(&registry(), vec![gripper_config("left", 1.0)]).unwrap();
        for identifier in cell.identifiers() {
            assert_eq!(cell.get(identifier).unwrap().identifier(), identifier);
        }
        assert_eq!(cell.identifiers().collect::<Vec<_>>(), vec!["left", "timer"]);
    }

    #[test]
    fn should_fail_with_device_not_found_for_missing_identifier() {
        let cell = Cell::new();
        let result = cell.get("robot");
        assert!(matches!(
            result,
            Err(CellError::DeviceNotFound(DeviceNotFoundError { identifier })) if identifier == "robot"
        ));
    }

    #[test]
    fn should_reject_duplicate_identifiers() {
        let result = Cell::from_configurations(
            &registry(),
            vec![gripper_config("left", 1.0), gripper_config("left", 2.0)],
        );
        assert!(matches!(
            result,
            Err(CellError::Configuration(ConfigurationError::DuplicateDevice { .. }))
        ));
    }

    #[test]
    fn should_fail_fast_on_unknown_kind() {
        let result = Cell::from_configurations(
            &registry(),
            vec![
                gripper_config("left", 1.0),
                DeviceConfiguration::new("laser", "cutter"),
            ],
        );
        assert!(matches!(
            result,
            Err(CellError::Configuration(ConfigurationError::UnknownKind { .. }))
        ));
    }

    #[test]
    fn should_round_trip_configurations() {
        let config = gripper_config("left", 7.25);
        let cell = Cell::from_configurations(&registry(), vec![config.clone()]).unwrap();
        assert_eq!(cell.to_configurations(), vec![config]);
    }

    #[test]
    fn should_downcast_typed_devices() {
        let cell =
            Cell::from_configurations(&registry(), vec![gripper_config("left", 1.0)]).unwrap();
        assert_eq!(cell.device::<Gripper>("left").unwrap().identifier(), "left");
        assert!(matches!(
            cell.device::<Gripper>(TIMER),
            Err(CellError::DeviceType { .. })
        ));
    }

    #[test]
    fn should_report_missing_capability() {
        let cell = Cell::new();
        assert!(matches!(
            cell.readable(TIMER),
            Err(CellError::MissingCapability(MissingCapabilityError {
                capability: Capability::Read,
                ..
            }))
        ));
        assert!(cell.stoppable(TIMER).is_ok());
    }

    #[tokio::test]
    async fn should_read_through_capability_lookup() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![Probe::new("io", &counters)]);
        let value = cell.readable("io").unwrap().read("di0").await.unwrap();
        assert_eq!(value, Value::from("io:di0"));
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn should_open_and_close_every_device() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![Probe::new("a", &counters), Probe::new("b", &counters)]);

        cell.open().await.unwrap();
        assert!(cell.is_open());
        assert!(cell.get("a").unwrap().is_active());
        assert!(cell.timer().unwrap().is_active());

        cell.close().await.unwrap();
        assert!(!cell.is_open());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_close_opened_devices_when_one_fails_to_open() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters),
            Probe::new("b", &counters).failing_open(),
            Probe::new("c", &counters),
        ]);

        let result = cell.open().await;

        assert!(matches!(result, Err(CellError::Device { identifier, .. }) if identifier == "b"));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert!(!cell.get("a").unwrap().is_active());
        assert!(!cell.get("c").unwrap().is_active());
        assert!(!cell.is_open());
    }

    #[tokio::test]
    async fn should_reject_open_while_open() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![Probe::new("a", &counters)]);
        cell.open().await.unwrap();

        assert!(matches!(cell.open().await, Err(CellError::AlreadyOpen)));
        let scoped: Result<(), CellError> =
            cell.scoped(|_| Box::pin(async { Ok(()) })).await;
        assert!(matches!(scoped, Err(CellError::AlreadyOpen)));
        assert!(cell.get("a").unwrap().is_active());

        cell.close().await.unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_reopen_after_close() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![Probe::new("a", &counters)]);
        cell.open().await.unwrap();
        cell.close().await.unwrap();

        cell.open().await.unwrap();
        assert!(cell.is_open());
        cell.close().await.unwrap();
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_close_opened_devices_when_one_panics_on_open() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters),
            Probe::new("b", &counters).panicking_open(),
        ]);

        let result = cell.open().await;

        assert!(matches!(result, Err(CellError::Panicked(message)) if message == "driver crashed"));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(!cell.get("a").unwrap().is_active());
        assert!(!cell.is_open());
    }

    #[tokio::test]
    async fn should_close_every_device_when_one_panics_on_close() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters).panicking_close(),
            Probe::new("b", &counters),
        ]);
        cell.open().await.unwrap();

        let result = cell.close().await;

        assert!(matches!(result, Err(CellError::Panicked(_))));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert!(!cell.get("b").unwrap().is_active());
        assert!(!cell.is_open());
    }

    #[tokio::test]
    async fn should_close_after_scoped_body_fails() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![Probe::new("a", &counters)]);

        let result: Result<(), CellError> = cell
            .scoped(|cell| {
                Box::pin(async move { cell.get("missing").map(|_| ()) })
            })
            .await;

        assert!(matches!(result, Err(CellError::DeviceNotFound(_))));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_return_scoped_body_value() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![Probe::new("a", &counters)]);
        let value = cell
            .scoped(|cell| Box::pin(async move { cell.readable("a")?.read("x").await }))
            .await
            .unwrap();
        assert_eq!(value, Value::from("a:x"));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    // ── Stop ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn should_stop_every_device_even_when_one_fails() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters),
            Probe::new("b", &counters).failing_stop(),
            Probe::new("c", &counters),
        ]);

        let result = cell.stop().await;

        assert!(matches!(result, Err(CellError::Device { identifier, .. }) if identifier == "b"));
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_stop_timer_waits() {
        let cell = Cell::new();
        cell.open().await.unwrap();
        cell.stop().await.unwrap();
        let result = cell.timer().unwrap().wait(std::time::Duration::from_secs(60)).await;
        assert!(matches!(result, Err(CellError::Stopped)));
        cell.close().await.unwrap();
    }

    // ── State streams ──────────────────────────────────────────────

    #[tokio::test]
    async fn should_merge_all_items_from_finite_streams() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters).streaming(5),
            Probe::new("b", &counters).streaming(3),
            Probe::new("c", &counters).streaming(7),
        ]);

        let items: Vec<DeviceState> = cell.state_stream(Rate::default()).collect().await;

        assert_eq!(items.len(), 15);
        for (identifier, len) in [("a", 5), ("b", 3), ("c", 7)] {
            let count = items.iter().filter(|s| s.identifier == identifier).count();
            assert_eq!(count, len);
        }
        assert_eq!(counters.streams_dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_preserve_per_device_order_in_merged_stream() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters).streaming(4),
            Probe::new("b", &counters).streaming(4),
        ]);

        let items: Vec<DeviceState> = cell.state_stream(Rate::default()).collect().await;

        let sequence: Vec<_> = items
            .iter()
            .filter(|s| s.identifier == "a")
            .map(|s| s.reading("n").cloned())
            .collect();
        let expected: Vec<_> = (0..4_i64).map(|n| Some(Value::Int(n))).collect();
        assert_eq!(sequence, expected);
    }

    #[tokio::test]
    async fn should_tear_down_every_stream_when_consumer_stops_early() {
        let counters = Arc::new(Counters::default());
        let cell = probe_cell(vec![
            Probe::new("a", &counters).streaming(5),
            Probe::new("b", &counters).streaming(3),
            Probe::new("c", &counters).streaming(7),
        ]);

        let mut merged = cell.state_stream(Rate::default());
        assert!(merged.next().await.is_some());
        assert!(merged.next().await.is_some());
        assert_eq!(counters.streams_dropped.load(Ordering::SeqCst), 0);
        drop(merged);

        assert_eq!(counters.streams_dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_end_immediately_without_streaming_devices() {
        let cell = Cell::new();
        let items: Vec<DeviceState> = cell.state_stream(Rate::default()).collect().await;
        assert!(items.is_empty());
    }
}
