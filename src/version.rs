//! CockroachDB version handling.
//!
//! Symbolic versions in the spec (`cockroachDBVersion: v24.2.2`) are resolved
//! to container images through `RELATED_IMAGE_COCKROACH_*` environment
//! variables on the operator deployment, e.g.
//! `RELATED_IMAGE_COCKROACH_v24_2_2=cockroachdb/cockroach:v24.2.2`.
//! The same table defines the set of supported versions.

use semver::Version;

use crate::controller::Error;

/// Environment variable prefix for supported version -> image mappings.
pub const RELATED_IMAGE_PREFIX: &str = "RELATED_IMAGE_COCKROACH_";

/// Fallback version used by the defaulting webhook when neither an image nor
/// a version is specified and no supported-version table is present.
pub const DEFAULT_VERSION: &str = "v24.2.2";

/// Ordered release trains, oldest first. Upgrades may only move to the next
/// entry in this table (no major/minor skips).
const RELEASE_TRAINS: [(u64, u64); 10] = [
    (21, 1),
    (21, 2),
    (22, 1),
    (22, 2),
    (23, 1),
    (23, 2),
    (24, 1),
    (24, 2),
    (24, 3),
    (25, 1),
];

/// Turn a version string into its environment variable name, e.g.
/// `v24.2.2` -> `RELATED_IMAGE_COCKROACH_v24_2_2`.
pub fn env_var_for_version(version: &str) -> String {
    format!("{}{}", RELATED_IMAGE_PREFIX, version.replace('.', "_"))
}

/// Resolve a symbolic version to a container image, or None when the version
/// is not in the supported table.
pub fn image_for_version(version: &str) -> Option<String> {
    std::env::var(env_var_for_version(version)).ok()
}

/// All versions present in the supported-version table.
pub fn supported_versions() -> Vec<String> {
    std::env::vars()
        .filter_map(|(key, _)| {
            key.strip_prefix(RELATED_IMAGE_PREFIX)
                .map(|suffix| suffix.replace('_', "."))
        })
        .collect()
}

/// Whether a version appears in the supported-version table. An empty table
/// (no RELATED_IMAGE variables at all) accepts everything, so development
/// setups without a curated table still work.
pub fn is_supported(version: &str) -> bool {
    let supported = supported_versions();
    supported.is_empty() || supported.iter().any(|v| v == version)
}

/// Parse a `vX.Y.Z` version string.
pub fn parse_version(version: &str) -> Result<Version, Error> {
    let trimmed = version.trim_start_matches('v');
    Version::parse(trimmed)
        .map_err(|e| Error::Validation(format!("invalid version {version:?}: {e}")))
}

/// `major.minor` pair for preserve-downgrade bookkeeping, e.g. "24.1".
pub fn major_minor(version: &Version) -> String {
    format!("{}.{}", version.major, version.minor)
}

/// Whether moving from `from` to `to` crosses a release-train boundary.
pub fn is_major_change(from: &Version, to: &Version) -> bool {
    (from.major, from.minor) != (to.major, to.minor)
}

/// Whether an upgrade from `from` to `to` skips over an intermediate release
/// train. Patch-level moves and single-train hops are fine; anything further
/// is rejected. Trains outside the known table are compared leniently.
pub fn skips_release_train(from: &Version, to: &Version) -> bool {
    let from_idx = RELEASE_TRAINS
        .iter()
        .position(|&(maj, min)| maj == from.major && min == from.minor);
    let to_idx = RELEASE_TRAINS
        .iter()
        .position(|&(maj, min)| maj == to.major && min == to.minor);

    match (from_idx, to_idx) {
        (Some(f), Some(t)) => t > f + 1,
        // Unknown trains: only flag obviously large jumps.
        _ => to.major > from.major + 1,
    }
}

/// Image reference without its tag or digest, e.g.
/// `cockroachdb/cockroach:v24.2.2` -> `cockroachdb/cockroach`. Digest
/// references (`@sha256:...`) are returned unchanged since the digest is the
/// identity.
pub fn image_name_without_version(image: &str) -> &str {
    if image.contains("@sha256:") {
        return image;
    }
    match image.rsplit_once(':') {
        // Guard against a colon that belongs to a registry port.
        Some((name, tag)) if !tag.contains('/') => name,
        _ => image,
    }
}

/// Extract the tag from an image reference, if any.
pub fn image_tag(image: &str) -> Option<&str> {
    if image.contains("@sha256:") {
        return None;
    }
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => Some(tag),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_for_version() {
        assert_eq!(
            env_var_for_version("v24.2.2"),
            "RELATED_IMAGE_COCKROACH_v24_2_2"
        );
    }

    #[test]
    fn test_parse_version() {
        let v = parse_version("v24.2.2").expect("valid version");
        assert_eq!((v.major, v.minor, v.patch), (24, 2, 2));
        assert!(parse_version("not-a-version").is_err());
    }

    #[test]
    fn test_major_minor() {
        let v = parse_version("v23.1.11").unwrap();
        assert_eq!(major_minor(&v), "23.1");
    }

    #[test]
    fn test_is_major_change() {
        let a = parse_version("v24.1.0").unwrap();
        let b = parse_version("v24.1.5").unwrap();
        let c = parse_version("v24.2.0").unwrap();
        assert!(!is_major_change(&a, &b));
        assert!(is_major_change(&a, &c));
    }

    #[test]
    fn test_skips_release_train() {
        let v23_2 = parse_version("v23.2.0").unwrap();
        let v24_1 = parse_version("v24.1.0").unwrap();
        let v24_2 = parse_version("v24.2.0").unwrap();
        // Adjacent train hop is allowed.
        assert!(!skips_release_train(&v23_2, &v24_1));
        // Skipping 24.1 is not.
        assert!(skips_release_train(&v23_2, &v24_2));
        // Patch move within a train is fine.
        let v24_2_2 = parse_version("v24.2.2").unwrap();
        assert!(!skips_release_train(&v24_2, &v24_2_2));
    }

    #[test]
    fn test_image_name_without_version() {
        assert_eq!(
            image_name_without_version("cockroachdb/cockroach:v24.2.2"),
            "cockroachdb/cockroach"
        );
        assert_eq!(
            image_name_without_version("registry.local:5000/cockroach"),
            "registry.local:5000/cockroach"
        );
        let digest = "cockroachdb/cockroach@sha256:abc123";
        assert_eq!(image_name_without_version(digest), digest);
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(
            image_tag("cockroachdb/cockroach:v24.2.2"),
            Some("v24.2.2")
        );
        assert_eq!(image_tag("cockroachdb/cockroach"), None);
        assert_eq!(image_tag("cockroachdb/cockroach@sha256:abc"), None);
    }
}
