//! Feature Gates
//!
//! `--feature-gates=Name=true,Other=false` toggles for alpha and beta
//! behavior. Values are checked against the set of gates known to the
//! combined sidecars.

use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Gates understood by the hosted controllers and their defaults
pub const KNOWN_FEATURE_GATES: &[(&str, bool)] = &[
    ("CrossNamespaceVolumeDataSource", false),
    ("HonorPVReclaimPolicy", true),
    ("ReadWriteOncePod", true),
    ("RecoverVolumeExpansionFailure", false),
    ("VolumeAttributesClass", false),
];

/// Explicitly set feature gates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FeatureGates {
    overrides: BTreeMap<String, bool>,
}

impl FeatureGates {
    /// Create an empty set of overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective value of a gate, falling back to its default.
    ///
    /// Unknown gates are reported as disabled.
    pub fn enabled(&self, gate: &str) -> bool {
        if let Some(value) = self.overrides.get(gate) {
            return *value;
        }
        KNOWN_FEATURE_GATES
            .iter()
            .find(|(name, _)| *name == gate)
            .map(|(_, default)| *default)
            .unwrap_or(false)
    }

    /// Gates that were set explicitly
    pub fn overrides(&self) -> &BTreeMap<String, bool> {
        &self.overrides
    }

    /// Check that every override names a known gate
    pub fn validate(&self) -> Result<()> {
        for gate in self.overrides.keys() {
            if !KNOWN_FEATURE_GATES.iter().any(|(name, _)| name == gate) {
                return Err(Error::FeatureGate {
                    gate: gate.clone(),
                    reason: format!(
                        "unrecognized feature gate (known: {})",
                        KNOWN_FEATURE_GATES
                            .iter()
                            .map(|(name, _)| *name)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
            }
        }
        Ok(())
    }
}

impl FromStr for FeatureGates {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut overrides = BTreeMap::new();

        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("missing bool value for {}", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("missing gate name in {:?}", pair));
            }
            let value = super::parse_go_bool(value)
                .map_err(|_| format!("invalid value of {}={}, err: expected a boolean", key, value.trim()))?;
            overrides.insert(key.to_string(), value);
        }

        Ok(Self { overrides })
    }
}

/// clap value parser for `--feature-gates`
pub(crate) fn parse_feature_gates(s: &str) -> std::result::Result<FeatureGates, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let gates: FeatureGates = "HonorPVReclaimPolicy=false, VolumeAttributesClass=true"
            .parse()
            .unwrap();

        assert!(!gates.enabled("HonorPVReclaimPolicy"));
        assert!(gates.enabled("VolumeAttributesClass"));
        assert!(gates.enabled("ReadWriteOncePod"));
        assert!(!gates.enabled("CrossNamespaceVolumeDataSource"));
        assert_eq!(gates.overrides().len(), 2);
    }

    #[test]
    fn test_parse_empty() {
        let gates: FeatureGates = "".parse().unwrap();
        assert!(gates.overrides().is_empty());
        assert!(gates.validate().is_ok());
    }

    #[test]
    fn test_parse_accepts_go_bool_spellings() {
        let gates: FeatureGates = "HonorPVReclaimPolicy=False,VolumeAttributesClass=True,ReadWriteOncePod=0,RecoverVolumeExpansionFailure=t"
            .parse()
            .unwrap();

        assert!(!gates.enabled("HonorPVReclaimPolicy"));
        assert!(gates.enabled("VolumeAttributesClass"));
        assert!(!gates.enabled("ReadWriteOncePod"));
        assert!(gates.enabled("RecoverVolumeExpansionFailure"));
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!("HonorPVReclaimPolicy".parse::<FeatureGates>().is_err());
        assert!("HonorPVReclaimPolicy=maybe".parse::<FeatureGates>().is_err());
        assert!("=true".parse::<FeatureGates>().is_err());
    }

    #[test]
    fn test_validate_unknown_gate() {
        let gates: FeatureGates = "NotAGate=true".parse().unwrap();
        let err = gates.validate().unwrap_err();
        assert!(matches!(err, Error::FeatureGate { ref gate, .. } if gate == "NotAGate"));
    }
}
