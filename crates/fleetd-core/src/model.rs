// ABOUTME: Defines the DeviceRecord and its supporting types: mode, lifecycle state, features, pricing.
// ABOUTME: Also provides DeviceFilter for exact-match and has-all-features queries over records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Global registry mode. Controls which features are visible and what pricing applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Development => "DEVELOPMENT",
            Mode::Production => "PRODUCTION",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown mode '{0}', expected 'development' or 'production'")]
pub struct ParseModeError(pub String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Lifecycle state of a registry record. Records only ever start out as
/// `Initialized`; live connectivity is tracked separately by the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    #[default]
    Initialized,
}

/// A named capability of a device type, optionally marked experimental.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    #[serde(default)]
    pub experimental: bool,
}

impl FeatureDescriptor {
    pub fn stable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experimental: false,
        }
    }

    pub fn experimental(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experimental: true,
        }
    }
}

/// Base rate plus per-feature rate overrides, in a single currency.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PricingProfile {
    pub base_rate: f64,
    #[serde(default)]
    pub feature_rates: BTreeMap<String, f64>,
    pub currency: String,
}

/// One physical device known to the fleet. `features` and `pricing` hold the
/// values resolved for `mode`, not the raw device type configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub features: Vec<FeatureDescriptor>,
    pub pricing: PricingProfile,
    pub state: DeviceState,
    pub mode: Mode,
    pub is_default: bool,
}

impl DeviceRecord {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.name == name)
    }
}

/// Query over device records. Every populated criterion must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub device_type: Option<String>,
    pub mode: Option<Mode>,
    pub features: Vec<String>,
}

impl DeviceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn feature(mut self, name: impl Into<String>) -> Self {
        self.features.push(name.into());
        self
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        if let Some(device_type) = &self.device_type
            && record.device_type != *device_type
        {
            return false;
        }
        if let Some(mode) = self.mode
            && record.mode != mode
        {
            return false;
        }
        self.features.iter().all(|name| record.has_feature(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(id: &str, device_type: &str, mode: Mode, features: &[&str]) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            device_type: device_type.to_string(),
            features: features.iter().map(|f| FeatureDescriptor::stable(*f)).collect(),
            pricing: PricingProfile::default(),
            state: DeviceState::Initialized,
            mode,
            is_default: false,
        }
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("production".parse::<Mode>().unwrap(), Mode::Production);
        assert_eq!("DEVELOPMENT".parse::<Mode>().unwrap(), Mode::Development);
        assert_eq!("Prod".parse::<Mode>().unwrap(), Mode::Production);
        assert!("staging".parse::<Mode>().is_err());
    }

    #[test]
    fn record_serializes_type_and_mode_like_the_snapshot_format() {
        let record = make_record("d1", "buzzer", Mode::Production, &["vibrate"]);
        let json = serde_json::to_value(&record).expect("serialize");

        assert_eq!(json["type"], "buzzer");
        assert_eq!(json["mode"], "PRODUCTION");
        assert_eq!(json["state"], "INITIALIZED");
        assert_eq!(json["is_default"], false);
    }

    #[test]
    fn feature_experimental_flag_defaults_to_false() {
        let feature: FeatureDescriptor =
            serde_json::from_str(r#"{"name":"vibrate"}"#).expect("deserialize");
        assert!(!feature.experimental);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let record = make_record("d1", "buzzer", Mode::Development, &[]);
        assert!(DeviceFilter::new().matches(&record));
    }

    #[test]
    fn filter_matches_type_and_mode_exactly() {
        let record = make_record("d1", "buzzer", Mode::Development, &[]);

        assert!(DeviceFilter::new().device_type("buzzer").matches(&record));
        assert!(!DeviceFilter::new().device_type("lamp").matches(&record));
        assert!(DeviceFilter::new().mode(Mode::Development).matches(&record));
        assert!(!DeviceFilter::new().mode(Mode::Production).matches(&record));
    }

    #[test]
    fn filter_requires_all_listed_features() {
        let record = make_record("d1", "buzzer", Mode::Development, &["vibrate", "pulse"]);

        assert!(DeviceFilter::new().feature("vibrate").matches(&record));
        assert!(
            DeviceFilter::new()
                .feature("vibrate")
                .feature("pulse")
                .matches(&record)
        );
        assert!(
            !DeviceFilter::new()
                .feature("vibrate")
                .feature("turbo")
                .matches(&record)
        );
    }
}
