//! Canonical stored form for migration versions.
//!
//! History rows store versions in a fixed-width prefixed form so that plain
//! lexicographic comparison orders them correctly:
//!
//! - semantic `1.20.3` with suffix `s` → `0001.0020.0003-s`
//! - non-semantic `20210817`           → `0000.0000.0000-20210817`
//!
//! The all-zero prefix sorts every non-semantic version below every semantic
//! one, and within each family the remainder compares as the caller expects.

use crate::error::{DriverError, Result};

/// Prefix marking a non-semantic stored version.
pub const NON_SEMANTIC_PREFIX: &str = "0000.0000.0000-";

/// A parsed semantic version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemanticVersion {
    /// Parse a strict `major.minor.patch` triple.
    pub fn parse(version: &str) -> Result<Self> {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() != 3 {
            return Err(DriverError::Config(format!(
                "invalid semantic version {version:?}: expected major.minor.patch"
            )));
        }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                DriverError::Config(format!("invalid semantic version {version:?}"))
            })?;
            if *slot > 9999 {
                return Err(DriverError::Config(format!(
                    "semantic version component {part} exceeds the storable range"
                )));
            }
        }
        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
        })
    }
}

/// Encode a version into its canonical stored form.
///
/// `suffix` disambiguates semantic versions that would otherwise collide
/// (typically a sequence or timestamp chosen by the caller).
pub fn to_stored_version(semantic: bool, version: &str, suffix: &str) -> Result<String> {
    if !semantic {
        return Ok(format!("{NON_SEMANTIC_PREFIX}{version}"));
    }
    let v = SemanticVersion::parse(version)?;
    Ok(format!(
        "{:04}.{:04}.{:04}-{}",
        v.major, v.minor, v.patch, suffix
    ))
}

/// Decode a stored version back into `(semantic, version, suffix)`.
pub fn from_stored_version(stored: &str) -> Result<(bool, String, String)> {
    if let Some(raw) = stored.strip_prefix(NON_SEMANTIC_PREFIX) {
        return Ok((false, raw.to_string(), String::new()));
    }
    let (triple, suffix) = stored
        .split_once('-')
        .ok_or_else(|| DriverError::InvalidStoredVersion(stored.to_string()))?;
    let parts: Vec<&str> = triple.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.len() != 4 || p.parse::<u64>().is_err()) {
        return Err(DriverError::InvalidStoredVersion(stored.to_string()));
    }
    let nums: Vec<u64> = parts.iter().map(|p| p.parse().unwrap()).collect();
    Ok((
        true,
        format!("{}.{}.{}", nums[0], nums[1], nums[2]),
        suffix.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_semantic_round_trip() {
        let stored = to_stored_version(false, "0002", "").unwrap();
        assert_eq!(stored, "0000.0000.0000-0002");
        let (semantic, version, suffix) = from_stored_version(&stored).unwrap();
        assert!(!semantic);
        assert_eq!(version, "0002");
        assert_eq!(suffix, "");
    }

    #[test]
    fn semantic_round_trip() {
        let stored = to_stored_version(true, "1.20.3", "20210817").unwrap();
        assert_eq!(stored, "0001.0020.0003-20210817");
        let (semantic, version, suffix) = from_stored_version(&stored).unwrap();
        assert!(semantic);
        assert_eq!(version, "1.20.3");
        assert_eq!(suffix, "20210817");
    }

    #[test]
    fn stored_forms_order_lexicographically() {
        let a = to_stored_version(false, "0001", "").unwrap();
        let b = to_stored_version(false, "0002", "").unwrap();
        assert!(b > a);

        let low = to_stored_version(true, "1.9.0", "x").unwrap();
        let high = to_stored_version(true, "1.10.0", "x").unwrap();
        assert!(high > low);

        // Every non-semantic version sorts below every semantic one.
        assert!(b < low);
    }

    #[test]
    fn malformed_stored_version_is_a_typed_error() {
        let err = from_stored_version("0002").unwrap_err();
        assert!(matches!(err, DriverError::InvalidStoredVersion(_)));

        let err = from_stored_version("1.2.3-x").unwrap_err();
        assert!(matches!(err, DriverError::InvalidStoredVersion(_)));
    }

    #[test]
    fn semantic_component_range_is_enforced() {
        assert!(to_stored_version(true, "10000.0.0", "x").is_err());
        assert!(to_stored_version(true, "1.2", "x").is_err());
    }
}
