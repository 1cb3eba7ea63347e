//! The supported semver subset.
//!
//! Versions are `major.minor.patch` (missing parts read as zero, a leading
//! `v` is accepted) with an optional `-pre.release` tag and `+build`
//! metadata. Pre-release tags order per semver; build metadata is dropped.
//!
//! Ranges are exact, `^x.y.z`, `~x.y.z`, `"a - b"` (inclusive) and
//! `*`/empty, over release versions only. Anything else, including `||`,
//! comparison operators and pre-release tags, is
//! [`DepsError::UnsupportedRange`]. A pre-release version only satisfies `*`.

use crate::{DepsError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Dot-separated pre-release identifiers, without the leading `-`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<String>,
}

impl Version {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let text = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let invalid = || DepsError::InvalidVersion(s.to_string());

        let text = match text.split_once('+') {
            Some((rest, build)) if valid_identifiers(build, false) => rest,
            Some(_) => return Err(invalid()),
            None => text,
        };
        let (digits, pre) = match text.split_once('-') {
            Some((digits, pre)) if valid_identifiers(pre, true) => (digits, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (text, None),
        };
        if digits.is_empty() {
            return Err(invalid());
        }

        let mut parts = [0u64; 3];
        let mut count = 0;
        for part in digits.split('.') {
            if count == 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        Ok(Self {
            pre,
            ..Self::new(parts[0], parts[1], parts[2])
        })
    }

    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    fn release(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

/// Non-empty `[0-9A-Za-z-]` identifiers separated by dots. Numeric
/// pre-release identifiers may not carry leading zeros.
fn valid_identifiers(s: &str, pre: bool) -> bool {
    s.split('.').all(|id| {
        !id.is_empty()
            && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !(pre && id.len() > 1 && id.starts_with('0') && id.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Numeric identifiers compare numerically and sort before alphanumeric
/// ones; a shorter list that is a prefix of the other sorts first.
fn compare_pre(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release()
            .cmp(&other.release())
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre(a, b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = DepsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRange {
    Any,
    Exact(Version),
    /// Same major, `minor.patch` at least the given one.
    Caret(Version),
    /// Same `major.minor`, patch at least the given one.
    Tilde(Version),
    /// Inclusive on both ends.
    Between(Version, Version),
}

impl VersionRange {
    pub fn parse(s: &str) -> Result<Self> {
        let range = s.trim();
        let unsupported = || DepsError::UnsupportedRange(s.to_string());

        if range.is_empty() || range == "*" {
            return Ok(Self::Any);
        }
        if range.contains("||") {
            return Err(unsupported());
        }
        // Bounds are release versions only.
        let bound = |text: &str| match Version::parse(text) {
            Ok(v) if !v.is_prerelease() && !text.contains('+') => Ok(v),
            _ => Err(unsupported()),
        };
        if let Some((low, high)) = range.split_once(" - ") {
            return Ok(Self::Between(bound(low)?, bound(high)?));
        }

        let (ctor, rest): (fn(Version) -> Self, &str) = if let Some(rest) = range.strip_prefix('^') {
            (Self::Caret, rest)
        } else if let Some(rest) = range.strip_prefix('~') {
            (Self::Tilde, rest)
        } else {
            (Self::Exact, range)
        };
        bound(rest).map(ctor)
    }

    /// Parses an optional range; `None` means any version.
    pub fn parse_opt(s: Option<&str>) -> Result<Self> {
        s.map_or(Ok(Self::Any), Self::parse)
    }

    #[must_use]
    pub fn matches(&self, v: &Version) -> bool {
        if v.is_prerelease() {
            return matches!(self, Self::Any);
        }
        match self {
            Self::Any => true,
            Self::Exact(want) => v == want,
            Self::Caret(base) => v.major == base.major && (v.minor, v.patch) >= (base.minor, base.patch),
            Self::Tilde(base) => {
                v.major == base.major && v.minor == base.minor && v.patch >= base.patch
            }
            Self::Between(low, high) => low <= v && v <= high,
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::Caret(v) => write!(f, "^{v}"),
            Self::Tilde(v) => write!(f, "~{v}"),
            Self::Between(low, high) => write!(f, "{low} - {high}"),
        }
    }
}
