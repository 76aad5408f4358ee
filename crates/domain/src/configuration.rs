//! Device configuration: the serializable recipe for constructing a device.
//!
//! A configuration is an envelope: the `kind` discriminant selects the device
//! type in the registry, `identifier` names the device inside its cell, and
//! every other field belongs to the device type's own settings struct.
//!
//! ```text
//! { "kind": "virtual_robot", "identifier": "robot", "tcp_speed": 250.0 }
//! ```
//!
//! Settings structs must not declare fields named `kind` or `identifier`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Immutable description of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub kind: String,
    pub identifier: String,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl DeviceConfiguration {
    /// A configuration without device-specific settings.
    #[must_use]
    pub fn new(kind: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            identifier: identifier.into(),
            settings: serde_json::Map::new(),
        }
    }

    /// Build a configuration from a typed settings value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Malformed`] if `settings` cannot be
    /// serialized, or [`ConfigurationError::NotAMap`] if it does not
    /// serialize to named fields.
    pub fn with_settings<S: Serialize>(
        kind: impl Into<String>,
        identifier: impl Into<String>,
        settings: &S,
    ) -> Result<Self, ConfigurationError> {
        let kind = kind.into();
        let value = match serde_json::to_value(settings) {
            Ok(value) => value,
            Err(source) => {
                return Err(ConfigurationError::Malformed {
                    kind,
                    source: Arc::new(source),
                });
            }
        };
        let serde_json::Value::Object(settings) = value else {
            return Err(ConfigurationError::NotAMap { kind });
        };
        Ok(Self {
            kind,
            identifier: identifier.into(),
            settings,
        })
    }

    /// Decode the device-specific settings into their typed form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Malformed`] when the fields do not match `S`.
    pub fn settings<S: DeserializeOwned>(&self) -> Result<S, ConfigurationError> {
        serde_json::from_value(serde_json::Value::Object(self.settings.clone())).map_err(
            |source| ConfigurationError::Malformed {
                kind: self.kind.clone(),
                source: Arc::new(source),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LampSettings {
        brightness: u8,
        #[serde(default)]
        label: Option<String>,
    }

    #[test]
    fn should_flatten_settings_next_to_kind_and_identifier() {
        let config = DeviceConfiguration::with_settings(
            "lamp",
            "lamp_1",
            &LampSettings {
                brightness: 80,
                label: None,
            },
        )
        .unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "lamp",
                "identifier": "lamp_1",
                "brightness": 80,
                "label": null,
            })
        );
    }

    #[test]
    fn should_decode_typed_settings_from_json() {
        let config: DeviceConfiguration = serde_json::from_str(
            r#"{"kind": "lamp", "identifier": "lamp_1", "brightness": 12}"#,
        )
        .unwrap();
        assert_eq!(config.kind, "lamp");
        assert_eq!(config.identifier, "lamp_1");
        let settings: LampSettings = config.settings().unwrap();
        assert_eq!(
            settings,
            LampSettings {
                brightness: 12,
                label: None
            }
        );
    }

    #[test]
    fn should_report_malformed_settings() {
        let mut config = DeviceConfiguration::new("lamp", "lamp_1");
        config
            .settings
            .insert("brightness".to_string(), serde_json::json!("very"));
        let result = config.settings::<LampSettings>();
        assert!(matches!(
            result,
            Err(ConfigurationError::Malformed { kind, .. }) if kind == "lamp"
        ));
    }

    #[test]
    fn should_reject_settings_that_are_not_a_map() {
        let result = DeviceConfiguration::with_settings("lamp", "lamp_1", &42);
        assert!(matches!(result, Err(ConfigurationError::NotAMap { .. })));
    }

    #[test]
    fn should_accept_unit_settings_for_plain_devices() {
        #[derive(Serialize, Deserialize)]
        struct Empty {}
        let config = DeviceConfiguration::with_settings("timer", "timer", &Empty {}).unwrap();
        assert!(config.settings.is_empty());
        assert_eq!(config, DeviceConfiguration::new("timer", "timer"));
    }
}
