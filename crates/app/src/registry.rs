//! Device registry: maps a configuration `kind` to the device constructor.
//!
//! The registry is built explicitly at start-up, one [`DeviceRegistry::register`]
//! call per device type, and then passed by reference to
//! [`Cell::from_configurations`](crate::cell::Cell::from_configurations).
//! Nothing registers itself behind the caller's back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use cellrun_domain::configuration::DeviceConfiguration;
use cellrun_domain::error::{CellError, ConfigurationError};

use crate::ports::Device;

/// A device type that can be rebuilt from a [`DeviceConfiguration`].
pub trait ConfigurableDevice: Device + Sized {
    /// Discriminant stored in `DeviceConfiguration::kind`.
    const KIND: &'static str;

    /// The device-specific fields of its configuration.
    type Settings: Serialize + DeserializeOwned;

    /// Construct an unopened device.
    ///
    /// # Errors
    ///
    /// Returns an error when the settings are valid JSON but not acceptable
    /// to the device (for example a non-positive speed).
    fn from_settings(identifier: String, settings: Self::Settings) -> Result<Self, CellError>;

    /// The settings this device was built from.
    fn settings(&self) -> &Self::Settings;

    /// The full configuration of this device, for [`Device::configuration`].
    fn to_configuration(&self) -> Option<DeviceConfiguration> {
        match DeviceConfiguration::with_settings(Self::KIND, self.identifier(), self.settings()) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!(identifier = self.identifier(), %err, "device settings are not serializable");
                None
            }
        }
    }
}

type Constructor =
    Box<dyn Fn(&DeviceConfiguration) -> Result<Arc<dyn Device>, CellError> + Send + Sync>;

/// Table of known device kinds.
#[derive(Default)]
pub struct DeviceRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `D` under [`ConfigurableDevice::KIND`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::DuplicateKind`] if the kind is taken.
    pub fn register<D: ConfigurableDevice>(&mut self) -> Result<(), CellError> {
        if self.constructors.contains_key(D::KIND) {
            return Err(ConfigurationError::DuplicateKind {
                kind: D::KIND.to_string(),
            }
            .into());
        }
        self.constructors.insert(
            D::KIND,
            Box::new(|config| {
                let settings = config.settings::<D::Settings>()?;
                let device = D::from_settings(config.identifier.clone(), settings)?;
                Ok(Arc::new(device) as Arc<dyn Device>)
            }),
        );
        tracing::debug!(kind = D::KIND, "device kind registered");
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds in alphabetical order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.constructors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build an unopened device from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnknownKind`] for unregistered kinds,
    /// [`ConfigurationError::Malformed`] when the settings do not decode, or
    /// whatever the device's own constructor rejects.
    pub fn construct(&self, config: &DeviceConfiguration) -> Result<Arc<dyn Device>, CellError> {
        let constructor = self.constructors.get(config.kind.as_str()).ok_or_else(|| {
            ConfigurationError::UnknownKind {
                kind: config.kind.clone(),
            }
        })?;
        constructor(config)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
