//! Protocol and software version management.

use semver::Version;

/// Wire protocol version announced in the Version message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Software version of this build, announced in the Version message.
pub const SOFT_VERSION: &str = "v2.3.0";

/// Oldest software version that negotiates identities through the DHT.
pub const MIN_VERSION_FOR_DHT: &str = "2.0.0-0";

/// Lenient semver parse: accepts a leading `v` and missing minor or patch
/// components (`v2.3` parses as `2.3.0`).
pub fn parse_tolerant(version: &str) -> Option<Version> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }

    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).ok()
}

/// Whether a peer running `version` negotiates identities through the DHT.
pub fn supports_dht(version: &str) -> bool {
    let Some(v) = parse_tolerant(version) else {
        return false;
    };
    match Version::parse(MIN_VERSION_FOR_DHT) {
        Ok(min) => v >= min,
        Err(_) => false,
    }
}

/// Symmetric: both sides must support the DHT, otherwise neither uses it,
/// so the two ends always agree on whether the identity exchange happens.
pub fn use_dht(client: &str, server: &str) -> bool {
    supports_dht(client) && supports_dht(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_version_parses() {
        assert!(Version::parse(MIN_VERSION_FOR_DHT).is_ok());
    }

    #[test]
    fn tolerant_parse_forms() {
        assert_eq!(parse_tolerant("v2.3.0"), Version::parse("2.3.0").ok());
        assert_eq!(parse_tolerant("2"), Version::parse("2.0.0").ok());
        assert_eq!(parse_tolerant("v1.9"), Version::parse("1.9.0").ok());
        assert_eq!(parse_tolerant("v2.0-rc1"), Version::parse("2.0.0-rc1").ok());
        assert_eq!(parse_tolerant(""), None);
        assert_eq!(parse_tolerant("garbage"), None);
    }

    #[test]
    fn dht_threshold() {
        assert!(supports_dht("v2.0.0"));
        assert!(supports_dht("v2.0.0-beta"));
        assert!(supports_dht("v2.3.0"));
        assert!(!supports_dht("v1.9.0"));
        assert!(!supports_dht(""));
    }

    #[test]
    fn use_dht_is_symmetric() {
        for (a, b) in [("v2.3.0", "v1.8.0"), ("v2.3.0", ""), ("v2.1.0", "v2.0.0")] {
            assert_eq!(use_dht(a, b), use_dht(b, a));
        }
        assert!(!use_dht("v2.3.0", "v1.8.0"));
        assert!(use_dht("v2.1.0", "v2.0.0"));
    }
}
