//! The driver registry: maps a driver module name to its configuration
//! schema and constructor.
//!
//! The registry is built once at startup and read-only afterwards.
//! Unqualified module names resolve under the built-in namespace, so a
//! config can say `driver_module: sht30` instead of the full path.

use std::collections::HashMap;

use meridian_edge::driver_config::DriverConfigError;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::driver::{DeviceDriver, DriverError, contact, device_metrics, relay, sht30, si1145};

/// Namespace the built-in drivers live under.
pub const BUILTIN_NAMESPACE: &str = "meridian.device.driver";

/// Errors raised while registering or building drivers.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("the driver module '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("the driver module '{0}' is not registered")]
    UnknownModule(String),
    #[error("driver config is invalid: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    AddressSpace(#[from] DriverConfigError),
}

/// Constructor for one driver module: resolved module name plus the raw
/// config mapping, validated against the module's own config schema.
pub type DriverConstructor =
    fn(driver_module: &str, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError>;

/// A registered driver module.
pub struct DriverDefinition {
    pub constructor: DriverConstructor,
}

/// The fields every driver configuration must carry.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonDriverConfig {
    /// Unique identifier of this driver within the device.
    pub identifier: String,
    /// Module name; unqualified names resolve under
    /// [`BUILTIN_NAMESPACE`].
    pub driver_module: String,
}

/// Parse a raw YAML config mapping into a module's config schema.
pub fn parse_config<T: DeserializeOwned>(raw: &serde_yaml::Value) -> Result<T, RegistryError> {
    serde_yaml::from_value(raw.clone()).map_err(|e| RegistryError::InvalidConfig(e.to_string()))
}

/// Maps `driver_module` names to their definitions.
pub struct DriverRegistry {
    index: HashMap<String, DriverDefinition>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        DriverRegistry {
            index: HashMap::new(),
        }
    }

    /// A registry with every built-in driver registered.
    pub fn with_builtins() -> Self {
        let mut registry = DriverRegistry::new();
        for (module, constructor) in [
            (device_metrics::MODULE, device_metrics::build as DriverConstructor),
            (sht30::MODULE, sht30::build as DriverConstructor),
            (si1145::MODULE, si1145::build as DriverConstructor),
            (relay::MODULE, relay::build as DriverConstructor),
            (contact::MODULE, contact::build as DriverConstructor),
        ] {
            let qualified = format!("{BUILTIN_NAMESPACE}.{module}");
            registry
                .register(&qualified, DriverDefinition { constructor })
                .expect("built-in driver modules are distinct");
        }
        registry
    }

    /// Register a driver module. Rejects duplicate module names.
    pub fn register(
        &mut self,
        driver_module: &str,
        definition: DriverDefinition,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(driver_module) {
            return Err(RegistryError::AlreadyRegistered(driver_module.to_owned()));
        }
        self.index.insert(driver_module.to_owned(), definition);
        Ok(())
    }

    /// Resolve an unqualified module name under the built-in namespace.
    pub fn resolve(&self, driver_module: &str) -> String {
        if driver_module.contains('.') {
            driver_module.to_owned()
        } else {
            format!("{BUILTIN_NAMESPACE}.{driver_module}")
        }
    }

    /// Build a driver from its raw config mapping.
    ///
    /// Resolves the module, validates the mapping against the module's
    /// config schema, and invokes the constructor.
    pub fn build(&self, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError> {
        let common: CommonDriverConfig = parse_config(raw)?;
        if common.identifier.len() > meridian_edge::driver_config::DRIVER_IDENTIFIER_LENGTH {
            return Err(RegistryError::InvalidConfig(format!(
                "driver identifier '{}' exceeds {} characters",
                common.identifier,
                meridian_edge::driver_config::DRIVER_IDENTIFIER_LENGTH
            )));
        }

        let module = self.resolve(&common.driver_module);
        let definition = self
            .index
            .get(&module)
            .ok_or_else(|| RegistryError::UnknownModule(module.clone()))?;
        (definition.constructor)(&module, raw)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        DriverRegistry::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> serde_yaml::Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn unqualified_modules_resolve_under_the_builtin_namespace() {
        let registry = DriverRegistry::with_builtins();
        assert_eq!(
            registry.resolve("sht30"),
            "meridian.device.driver.sht30"
        );
        assert_eq!(
            registry.resolve("vendor.driver.custom"),
            "vendor.driver.custom"
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = DriverRegistry::with_builtins();
        let result = registry.register(
            "meridian.device.driver.sht30",
            DriverDefinition {
                constructor: crate::driver::sht30::build,
            },
        );
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn build_resolves_validates_and_constructs() {
        let registry = DriverRegistry::with_builtins();
        let driver = registry
            .build(&yaml(
                "identifier: climate\ndriver_module: sht30\nprotocol: i2c\naddress: '0x44'\ndirection: input",
            ))
            .unwrap();
        let metadata = driver.metadata();
        assert_eq!(metadata.identifier, "climate");
        assert_eq!(metadata.driver_module, "meridian.device.driver.sht30");
    }

    #[test]
    fn unknown_modules_fail_the_build() {
        let registry = DriverRegistry::with_builtins();
        let result = registry.build(&yaml("identifier: x\ndriver_module: nope"));
        assert!(matches!(result, Err(RegistryError::UnknownModule(m)) if m.ends_with(".nope")));
    }

    #[test]
    fn schema_mismatch_fails_the_build() {
        let registry = DriverRegistry::with_builtins();
        // sht30 requires an i2c address; pin is not part of its schema.
        let result = registry.build(&yaml(
            "identifier: climate\ndriver_module: sht30\npin: 17\ndirection: input",
        ));
        assert!(matches!(result, Err(RegistryError::InvalidConfig(_))));
    }

    #[test]
    fn overlong_identifiers_are_rejected() {
        let registry = DriverRegistry::with_builtins();
        let identifier = "x".repeat(65);
        let result = registry.build(&yaml(&format!(
            "identifier: {identifier}\ndriver_module: device_metrics"
        )));
        assert!(matches!(result, Err(RegistryError::InvalidConfig(_))));
    }
}
