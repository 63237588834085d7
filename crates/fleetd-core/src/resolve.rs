// ABOUTME: Mode-aware resolution of a device type's configured features and pricing.
// ABOUTME: Production hides experimental features; development zeroes every rate.

use crate::model::{FeatureDescriptor, Mode, PricingProfile};

/// Features visible under `mode`. Production filters out experimental
/// features, development keeps the configured list as is. Order is preserved.
pub fn resolve_features(configured: &[FeatureDescriptor], mode: Mode) -> Vec<FeatureDescriptor> {
    match mode {
        Mode::Development => configured.to_vec(),
        Mode::Production => configured
            .iter()
            .filter(|f| !f.experimental)
            .cloned()
            .collect(),
    }
}

/// Pricing applicable under `mode`. Development is free: the base rate and
/// every per-feature rate are forced to zero. Production uses the template unchanged.
pub fn resolve_pricing(template: &PricingProfile, mode: Mode) -> PricingProfile {
    match mode {
        Mode::Production => template.clone(),
        Mode::Development => PricingProfile {
            base_rate: 0.0,
            feature_rates: template
                .feature_rates
                .keys()
                .map(|name| (name.clone(), 0.0))
                .collect(),
            currency: template.currency.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn features() -> Vec<FeatureDescriptor> {
        vec![
            FeatureDescriptor::stable("vibrate"),
            FeatureDescriptor::experimental("turbo"),
            FeatureDescriptor::stable("pulse"),
        ]
    }

    fn pricing() -> PricingProfile {
        let mut feature_rates = BTreeMap::new();
        feature_rates.insert("turbo".to_string(), 2.5);
        feature_rates.insert("pulse".to_string(), 0.75);
        PricingProfile {
            base_rate: 10.0,
            feature_rates,
            currency: "EUR".to_string(),
        }
    }

    #[test]
    fn production_hides_experimental_features() {
        let resolved = resolve_features(&features(), Mode::Production);
        let names: Vec<_> = resolved.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["vibrate", "pulse"]);
    }

    #[test]
    fn development_shows_all_features_in_order() {
        let resolved = resolve_features(&features(), Mode::Development);
        assert_eq!(resolved, features());
    }

    #[test]
    fn development_pricing_is_free() {
        let resolved = resolve_pricing(&pricing(), Mode::Development);
        assert_eq!(resolved.base_rate, 0.0);
        assert_eq!(resolved.feature_rates.len(), 2);
        assert!(resolved.feature_rates.values().all(|rate| *rate == 0.0));
        assert_eq!(resolved.currency, "EUR");
    }

    #[test]
    fn production_pricing_is_unmodified() {
        assert_eq!(resolve_pricing(&pricing(), Mode::Production), pricing());
    }
}
