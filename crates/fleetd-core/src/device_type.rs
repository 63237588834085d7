// ABOUTME: Device type configuration: the configured feature list and pricing template per device model.
// ABOUTME: Defines the DeviceConfigProvider lookup trait and a YAML-backed DeviceTypeCatalog.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{FeatureDescriptor, PricingProfile};

/// Errors that can occur when looking up or loading device type configuration.
#[derive(Debug, Error)]
pub enum ConfigLookupError {
    #[error("unknown device type: {0}")]
    UnknownType(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Raw configuration for one device type, before mode resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTypeConfig {
    #[serde(default)]
    pub features: Vec<FeatureDescriptor>,
    pub pricing: PricingProfile,
}

/// Source of device type configuration consulted by the registry whenever it
/// resolves a record's features and pricing.
pub trait DeviceConfigProvider: Send + Sync {
    fn device_config(&self, device_type: &str) -> Result<DeviceTypeConfig, ConfigLookupError>;
}

/// In-memory map of device type name to configuration, usually loaded from YAML:
///
/// ```yaml
/// buzzer:
///   features:
///     - name: vibrate
///     - name: turbo
///       experimental: true
///   pricing:
///     base_rate: 4.0
///     feature_rates: { turbo: 1.5 }
///     currency: USD
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTypeCatalog {
    types: HashMap<String, DeviceTypeConfig>,
}

impl DeviceTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigLookupError> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a catalog from a YAML file. A missing file yields an empty catalog.
    pub fn load(path: &Path) -> Result<Self, ConfigLookupError> {
        if !path.exists() {
            tracing::warn!("device type file {} not found, using empty catalog", path.display());
            return Ok(Self::new());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn insert(&mut self, device_type: impl Into<String>, config: DeviceTypeConfig) {
        self.types.insert(device_type.into(), config);
    }

    pub fn with_type(mut self, device_type: impl Into<String>, config: DeviceTypeConfig) -> Self {
        self.insert(device_type, config);
        self
    }

    /// Known device type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

impl DeviceConfigProvider for DeviceTypeCatalog {
    fn device_config(&self, device_type: &str) -> Result<DeviceTypeConfig, ConfigLookupError> {
        self.types
            .get(device_type)
            .cloned()
            .ok_or_else(|| ConfigLookupError::UnknownType(device_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CATALOG_YAML: &str = r#"
buzzer:
  features:
    - name: vibrate
    - name: turbo
      experimental: true
  pricing:
    base_rate: 4.0
    feature_rates:
      turbo: 1.5
    currency: USD
lamp:
  pricing:
    base_rate: 1.0
    currency: USD
"#;

    #[test]
    fn catalog_parses_yaml() {
        let catalog = DeviceTypeCatalog::from_yaml_str(CATALOG_YAML).unwrap();

        assert_eq!(catalog.type_names(), vec!["buzzer", "lamp"]);

        let buzzer = catalog.device_config("buzzer").unwrap();
        assert_eq!(buzzer.features.len(), 2);
        assert!(!buzzer.features[0].experimental);
        assert!(buzzer.features[1].experimental);
        assert_eq!(buzzer.pricing.base_rate, 4.0);
        assert_eq!(buzzer.pricing.feature_rates["turbo"], 1.5);

        let lamp = catalog.device_config("lamp").unwrap();
        assert!(lamp.features.is_empty());
        assert!(lamp.pricing.feature_rates.is_empty());
    }

    #[test]
    fn unknown_type_is_a_lookup_error() {
        let catalog = DeviceTypeCatalog::from_yaml_str(CATALOG_YAML).unwrap();
        let err = catalog.device_config("toaster").unwrap_err();
        assert!(matches!(err, ConfigLookupError::UnknownType(ref t) if t == "toaster"));
    }

    #[test]
    fn load_missing_file_gives_empty_catalog() {
        let dir = TempDir::new().unwrap();
        let catalog = DeviceTypeCatalog::load(&dir.path().join("nope.yaml")).unwrap();
        assert!(catalog.type_names().is_empty());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_types.yaml");
        fs::write(&path, CATALOG_YAML).unwrap();

        let catalog = DeviceTypeCatalog::load(&path).unwrap();
        assert!(catalog.device_config("buzzer").is_ok());
    }

    #[test]
    fn load_rejects_malformed_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_types.yaml");
        fs::write(&path, "buzzer: [not, a, config").unwrap();

        assert!(matches!(
            DeviceTypeCatalog::load(&path),
            Err(ConfigLookupError::Yaml(_))
        ));
    }
}
