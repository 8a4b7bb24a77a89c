//! Launcher configuration
//!
//! Values come from compiled-in defaults, optionally a JSON file, and finally
//! `BINIX_*` environment overrides.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::error::ConfigError;

/// Default number of sandboxed worker slots per package
pub const DEFAULT_SANDBOXED_CAPACITY: usize = 20;
/// Default number of privileged worker slots per package
pub const DEFAULT_PRIVILEGED_CAPACITY: usize = 3;

const ENV_HOST_PACKAGE: &str = "BINIX_HOST_PACKAGE";
const ENV_SANDBOXED_SERVICES: &str = "BINIX_SANDBOXED_SERVICES";
const ENV_PRIVILEGED_SERVICES: &str = "BINIX_PRIVILEGED_SERVICES";
const ENV_MAX_CONFLICT_RETRIES: &str = "BINIX_MAX_CONFLICT_RETRIES";

/// Capacity override for a single (package, sandboxed) pool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CapacityOverride {
    pub package: String,
    pub sandboxed: bool,
    pub capacity: usize,
}

/// Launcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Package the host itself runs as
    pub host_package: String,
    /// Service class prefix for sandboxed slots; the slot index is appended
    pub sandboxed_service_class: String,
    /// Service class prefix for privileged slots
    pub privileged_service_class: String,
    pub sandboxed_capacity: usize,
    pub privileged_capacity: usize,
    pub capacity_overrides: Vec<CapacityOverride>,
    /// How many fresh slots a request may try after losing a slot to another process
    pub max_conflict_retries: u32,
    /// How many times a pending-origin request is replayed after crashing before setup
    pub max_crash_replays: u32,
    /// Number of terminated connection snapshots kept for diagnostics
    pub terminated_history: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            host_package: "org.binix.browser".to_string(),
            sandboxed_service_class: "org.binix.app.SandboxedProcessService".to_string(),
            privileged_service_class: "org.binix.app.PrivilegedProcessService".to_string(),
            sandboxed_capacity: DEFAULT_SANDBOXED_CAPACITY,
            privileged_capacity: DEFAULT_PRIVILEGED_CAPACITY,
            capacity_overrides: Vec::new(),
            max_conflict_retries: 3,
            max_crash_replays: 1,
            terminated_history: 32,
        }
    }
}

impl LauncherConfig {
    /// Parse a config from JSON; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply `BINIX_*` overrides using the given lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(package) = lookup(ENV_HOST_PACKAGE) {
            if package.trim().is_empty() {
                return Err(invalid(ENV_HOST_PACKAGE, &package));
            }
            self.host_package = package.trim().to_string();
        }
        if let Some(value) = lookup(ENV_SANDBOXED_SERVICES) {
            self.sandboxed_capacity = parse_number(ENV_SANDBOXED_SERVICES, &value)?;
        }
        if let Some(value) = lookup(ENV_PRIVILEGED_SERVICES) {
            self.privileged_capacity = parse_number(ENV_PRIVILEGED_SERVICES, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_CONFLICT_RETRIES) {
            self.max_conflict_retries = parse_number(ENV_MAX_CONFLICT_RETRIES, &value)?;
        }
        self.validate()
    }

    /// Reject capacities that would make a pool unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandboxed_capacity == 0 {
            return Err(invalid("sandboxed_capacity", "0"));
        }
        if self.privileged_capacity == 0 {
            return Err(invalid("privileged_capacity", "0"));
        }
        if let Some(o) = self.capacity_overrides.iter().find(|o| o.capacity == 0) {
            return Err(invalid(&format!("capacity_overrides[{}]", o.package), "0"));
        }
        Ok(())
    }

    /// Slot capacity for a (package, sandboxed) pool
    pub fn capacity_for(&self, package: &str, sandboxed: bool) -> usize {
        self.capacity_overrides
            .iter()
            .find(|o| o.package == package && o.sandboxed == sandboxed)
            .map(|o| o.capacity)
            .unwrap_or(if sandboxed {
                self.sandboxed_capacity
            } else {
                self.privileged_capacity
            })
    }

    /// Service class prefix for the given sandbox mode
    pub fn service_class_for(&self, sandboxed: bool) -> &str {
        if sandboxed {
            &self.sandboxed_service_class
        } else {
            &self.privileged_service_class
        }
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LauncherConfig::default();
        assert_eq!(config.capacity_for("org.binix.browser", true), 20);
        assert_eq!(config.capacity_for("org.binix.browser", false), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_partial() {
        let config = LauncherConfig::from_json_str(
            r#"{
                "sandboxed_capacity": 4,
                "capacity_overrides": [
                    { "package": "org.external.apk", "sandboxed": true, "capacity": 1 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.host_package, "org.binix.browser");
        assert_eq!(config.capacity_for("org.binix.browser", true), 4);
        assert_eq!(config.capacity_for("org.external.apk", true), 1);
        assert_eq!(config.capacity_for("org.external.apk", false), 3);
    }

    #[test]
    fn test_json_rejects_zero_capacity() {
        let err = LauncherConfig::from_json_str(r#"{ "privileged_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LauncherConfig::default();
        config
            .apply_env(env(&[
                ("BINIX_HOST_PACKAGE", "org.test.host"),
                ("BINIX_SANDBOXED_SERVICES", " 6 "),
                ("BINIX_MAX_CONFLICT_RETRIES", "1"),
            ]))
            .unwrap();
        assert_eq!(config.host_package, "org.test.host");
        assert_eq!(config.sandboxed_capacity, 6);
        assert_eq!(config.max_conflict_retries, 1);
        assert_eq!(config.privileged_capacity, 3);
    }

    #[test]
    fn test_env_invalid_number() {
        let mut config = LauncherConfig::default();
        let err = config
            .apply_env(env(&[("BINIX_PRIVILEGED_SERVICES", "many")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "BINIX_PRIVILEGED_SERVICES");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = LauncherConfig::from_file("/nonexistent/binix/launcher.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
