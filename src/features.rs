//! Feature gates.
//!
//! Optional behavior is switched on through a `--feature-gates` flag of the
//! form `Name1=true,Name2=false`. Gates are parsed once at startup and read
//! from a process-wide table afterwards.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::controller::Error;

/// Known feature gates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Feature {
    /// Drain and decommission nodes before scaling down.
    UseDecommission,
    /// Delete PVCs left behind by removed nodes.
    AutoPrunePVC,
    /// Roll version changes one pod at a time with health checks in between.
    PartitionedUpdate,
    /// Honor spec.affinity.
    AffinityRules,
    /// Honor spec.tolerations.
    TolerationRules,
    /// Honor spec.topologySpreadConstraints.
    TopologySpreadRules,
    /// Watch a comma-separated list of namespaces instead of one.
    MultipleNamespaces,
    /// Allow annotation-driven cluster restarts.
    ClusterRestart,
}

impl Feature {
    fn from_name(name: &str) -> Option<Feature> {
        match name {
            "UseDecommission" => Some(Feature::UseDecommission),
            "AutoPrunePVC" => Some(Feature::AutoPrunePVC),
            "PartitionedUpdate" => Some(Feature::PartitionedUpdate),
            "AffinityRules" => Some(Feature::AffinityRules),
            "TolerationRules" => Some(Feature::TolerationRules),
            "TopologySpreadRules" => Some(Feature::TopologySpreadRules),
            "MultipleNamespaces" => Some(Feature::MultipleNamespaces),
            "ClusterRestart" => Some(Feature::ClusterRestart),
            _ => None,
        }
    }

    /// Default value when the gate is not mentioned on the command line.
    fn default_enabled(self) -> bool {
        match self {
            Feature::UseDecommission => true,
            Feature::PartitionedUpdate => true,
            Feature::AutoPrunePVC => false,
            Feature::AffinityRules => false,
            Feature::TolerationRules => false,
            Feature::TopologySpreadRules => false,
            Feature::MultipleNamespaces => false,
            Feature::ClusterRestart => false,
        }
    }
}

static GATES: OnceLock<HashMap<Feature, bool>> = OnceLock::new();

/// Parse a `Name=bool,...` gate string. Unknown gate names are rejected so
/// typos fail loudly at startup.
pub fn parse_feature_gates(gates: &str) -> Result<HashMap<Feature, bool>, Error> {
    let mut parsed = HashMap::new();
    for entry in gates.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, value) = entry.split_once('=').ok_or_else(|| {
            Error::Validation(format!("invalid feature gate entry: {entry:?}"))
        })?;
        let feature = Feature::from_name(name.trim())
            .ok_or_else(|| Error::Validation(format!("unknown feature gate: {name:?}")))?;
        let enabled = value.trim().parse::<bool>().map_err(|_| {
            Error::Validation(format!("invalid feature gate value for {name}: {value:?}"))
        })?;
        parsed.insert(feature, enabled);
    }
    Ok(parsed)
}

/// Install parsed gates process-wide. Later calls are ignored, which keeps
/// unit tests that race on initialization harmless.
pub fn install_feature_gates(gates: HashMap<Feature, bool>) {
    let _ = GATES.set(gates);
}

/// Whether a feature is enabled, falling back to its default when the gate
/// table was never installed or does not mention it.
pub fn enabled(feature: Feature) -> bool {
    GATES
        .get()
        .and_then(|gates| gates.get(&feature).copied())
        .unwrap_or_else(|| feature.default_enabled())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let gates = parse_feature_gates("").expect("empty gate string");
        assert!(gates.is_empty());
    }

    #[test]
    fn test_parse_multiple_gates() {
        let gates = parse_feature_gates("AutoPrunePVC=true, UseDecommission=false")
            .expect("valid gate string");
        assert_eq!(gates.get(&Feature::AutoPrunePVC), Some(&true));
        assert_eq!(gates.get(&Feature::UseDecommission), Some(&false));
    }

    #[test]
    fn test_parse_unknown_gate_rejected() {
        let err = parse_feature_gates("NoSuchGate=true").unwrap_err();
        assert!(err.to_string().contains("unknown feature gate"));
    }

    #[test]
    fn test_parse_bad_value_rejected() {
        assert!(parse_feature_gates("AutoPrunePVC=yes").is_err());
        assert!(parse_feature_gates("AutoPrunePVC").is_err());
    }

    #[test]
    fn test_defaults() {
        assert!(Feature::UseDecommission.default_enabled());
        assert!(Feature::PartitionedUpdate.default_enabled());
        assert!(!Feature::AutoPrunePVC.default_enabled());
        assert!(!Feature::AffinityRules.default_enabled());
        assert!(!Feature::ClusterRestart.default_enabled());
    }
}
