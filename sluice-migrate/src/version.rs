//! Migration versions.
//!
//! A version is a dotted (or underscored) sequence of non-negative integers
//! such as `1`, `1.2.3`, `2024_01_15` or `201004200021`. Components are
//! compared numerically and may be arbitrarily long, so `09.4` and `9_4`
//! are the same version even though they print differently.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MigrateResult, MigrationError};

#[derive(Debug, Clone)]
enum Kind {
    Empty,
    /// Normalised components: no leading zeroes, trailing zero components trimmed.
    Numeric(Vec<String>),
    Latest,
}

/// An immutable, totally ordered migration version.
#[derive(Debug, Clone)]
pub struct Version {
    kind: Kind,
    text: Cow<'static, str>,
}

impl Version {
    /// Version of a schema with no migrations applied. Sorts below every version.
    pub const EMPTY: Version = Version {
        kind: Kind::Empty,
        text: Cow::Borrowed("<< Empty Schema >>"),
    };

    /// Unbounded target. Sorts above every version.
    pub const LATEST: Version = Version {
        kind: Kind::Latest,
        text: Cow::Borrowed("<< Latest Version >>"),
    };

    /// Parse a version string. `latest` (any case) yields [`Version::LATEST`].
    pub fn parse(text: &str) -> MigrateResult<Self> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::LATEST);
        }
        if trimmed.is_empty() {
            return Err(MigrationError::invalid_version(text, "version is empty"));
        }

        let display = trimmed.replace('_', ".");
        if display.starts_with('.') {
            return Err(MigrationError::invalid_version(
                text,
                "version must not start with a separator",
            ));
        }

        let mut parts = Vec::new();
        for part in display.split('.') {
            if part.is_empty() {
                return Err(MigrationError::invalid_version(
                    text,
                    "version contains an empty component",
                ));
            }
            if !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MigrationError::invalid_version(
                    text,
                    "only 0..9 and the separators '.' and '_' are allowed",
                ));
            }
            let digits = part.trim_start_matches('0');
            parts.push(if digits.is_empty() { "0" } else { digits }.to_string());
        }
        while parts.len() > 1 && parts.last().is_some_and(|p| p == "0") {
            parts.pop();
        }

        Ok(Self {
            kind: Kind::Numeric(parts),
            text: Cow::Owned(display),
        })
    }

    /// Strip `prefix` and `suffix` from `text` and parse the remainder.
    pub fn parse_with_affixes(text: &str, prefix: &str, suffix: &str) -> MigrateResult<Self> {
        let stripped = text.strip_prefix(prefix).unwrap_or(text);
        let stripped = stripped.strip_suffix(suffix).unwrap_or(stripped);
        Self::parse(stripped).map_err(|err| match err {
            MigrationError::InvalidVersion { reason, .. } => {
                MigrationError::invalid_version(text, reason)
            }
            other => other,
        })
    }

    /// The display text (`_` rendered as `.`, leading zeroes preserved).
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether this is the [`Version::EMPTY`] sentinel.
    pub fn is_empty_sentinel(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    /// Whether this is the [`Version::LATEST`] sentinel.
    pub fn is_latest(&self) -> bool {
        matches!(self.kind, Kind::Latest)
    }

    /// Whether `self` sorts strictly after `other`.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_parts(a: &[String], b: &[String]) -> Ordering {
    let longest = a.len().max(b.len());
    for i in 0..longest {
        let left = a.get(i).map(String::as_str).unwrap_or("0");
        let right = b.get(i).map(String::as_str).unwrap_or("0");
        match compare_digits(left, right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.kind, &other.kind) {
            (Kind::Empty, Kind::Empty) | (Kind::Latest, Kind::Latest) => Ordering::Equal,
            (Kind::Empty, _) | (_, Kind::Latest) => Ordering::Less,
            (_, Kind::Empty) | (Kind::Latest, _) => Ordering::Greater,
            (Kind::Numeric(a), Kind::Numeric(b)) => compare_parts(a, b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.kind {
            Kind::Empty => 0u8.hash(state),
            Kind::Numeric(parts) => {
                1u8.hash(state);
                parts.hash(state);
            }
            Kind::Latest => 2u8.hash(state),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::str::FromStr for Version {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.kind {
            Kind::Latest => serializer.serialize_str("latest"),
            _ => serializer.serialize_str(&self.text),
        }
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_equal_in_order_distinct_in_display() {
        let a = v("9_4");
        let b = v("09.4");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.to_string(), "9.4");
        assert_eq!(b.to_string(), "09.4");
    }

    #[test]
    fn test_numeric_not_lexical() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("10") > v("9"));
        assert!(v("1.2.3") < v("1.2.10"));
    }

    #[test]
    fn test_trailing_zeroes_pad() {
        assert_eq!(v("1"), v("1.0.0"));
        assert!(v("1") < v("1.0.1"));
        assert!(v("1.1") > v("1"));
    }

    #[test]
    fn test_huge_components() {
        assert!(v("201004200021000000000001") > v("201004200021000000000000"));
        assert!(v("99999999999999999999999") > v("1"));
    }

    #[test]
    fn test_sentinels() {
        assert!(Version::EMPTY < v("0"));
        assert!(Version::LATEST > v("999999999999"));
        assert!(Version::EMPTY < Version::LATEST);
        assert!(v("latest").is_latest());
        assert!(Version::EMPTY.is_empty_sentinel());
    }

    #[test]
    fn test_total_order_transitive() {
        let mut versions = vec![v("2"), v("1.1"), v("1_0_1"), v("01"), v("1.01.1")];
        versions.sort();
        let display: Vec<_> = versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(display, vec!["01", "1.0.1", "1.1", "1.01.1", "2"]);
        for w in versions.windows(3) {
            assert!(w[0] <= w[1] && w[1] <= w[2] && w[0] <= w[2]);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [".1", "_1", "1..2", "1.", "1.a", "v1", ""] {
            let err = Version::parse(bad).unwrap_err();
            assert!(err.is_descriptor_format(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_error_names_original_string() {
        let err = Version::parse_with_affixes("V.1__x", "V", "__x").unwrap_err();
        assert!(err.to_string().contains("V.1__x"));
    }

    #[test]
    fn test_parse_with_affixes() {
        let version = Version::parse_with_affixes("V1_2", "V", "").unwrap();
        assert_eq!(version, v("1.2"));
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(v("1.0"));
        assert!(set.contains(&v("01")));
    }

    #[test]
    fn test_serde_roundtrip_latest() {
        let json = serde_json::to_string(&Version::LATEST).unwrap();
        assert_eq!(json, "\"latest\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert!(back.is_latest());
    }
}
