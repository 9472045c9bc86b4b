//! npm-style version ranges over semver.
//!
//! Handles:
//! - Standard semver ranges: `^1.0.0`, `~1.0.0`, `>=1.0.0`, etc.
//! - Hyphen ranges: `1.0.0 - 2.0.0`
//! - X-ranges: `1.x`, `1.0.x`, `x.x.x`, `*`
//! - Space-separated comparators: `>= 2.1.2 < 3.0.0`
//! - OR ranges: `^1.0.0 || ^2.0.0`
//! - Opam-flavoured numbers with leading zeros: `>=4.02.0`

use crate::error::{OpamError, Result};
use crate::opam::version::OpamVersion;
use semver::{Version, VersionReq};

/// Range matching every version. Used for overrides without a version part.
pub const MATCH_ALL: &str = "x.x.x";

/// A parsed range: a union of semver requirements.
#[derive(Debug, Clone)]
pub struct VersionRange {
    source: String,
    /// Empty means "any version".
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse a range. `""`, `*`, `latest` and [`MATCH_ALL`] accept everything.
    ///
    /// # Errors
    /// Returns an error if no alternative of the range can be parsed.
    pub fn parse(range: &str) -> Result<Self> {
        let source = range.trim().to_string();
        if is_any(&source) {
            return Ok(Self {
                source,
                alternatives: Vec::new(),
            });
        }

        let mut alternatives = Vec::new();
        let mut last_err = None;
        for alt in source.split("||").map(str::trim) {
            if alt.is_empty() {
                continue;
            }
            if is_any(alt) {
                return Ok(Self {
                    source,
                    alternatives: Vec::new(),
                });
            }
            match parse_single(alt) {
                Ok(req) => alternatives.push(req),
                Err(e) => last_err = Some(e),
            }
        }

        if alternatives.is_empty() {
            return Err(last_err.unwrap_or_else(|| invalid(&source, "no valid alternatives")));
        }

        Ok(Self {
            source,
            alternatives,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn is_any(&self) -> bool {
        self.alternatives.is_empty()
    }

    /// Whether a semver version satisfies any alternative.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.is_any() || self.alternatives.iter().any(|req| req.matches(version))
    }

    /// Whether an opam version satisfies this range once its pre-release
    /// part is stripped. Versions with no numeric prefix never match a
    /// non-wildcard range.
    #[must_use]
    pub fn matches_opam(&self, version: &str) -> bool {
        if self.is_any() {
            return true;
        }
        OpamVersion::new(version)
            .to_stripped_semver()
            .is_some_and(|v| self.matches(&v))
    }
}

/// Range satisfaction primitive: does `version` (an opam version) satisfy
/// `range`? Unparseable ranges are never satisfied.
#[must_use]
pub fn satisfies(version: &str, range: &str) -> bool {
    VersionRange::parse(range).is_ok_and(|r| r.matches_opam(version))
}

fn is_any(range: &str) -> bool {
    matches!(range, "" | "*" | "x" | "X" | "latest") || is_wildcard_parts(range)
}

fn is_wildcard_parts(range: &str) -> bool {
    !range.is_empty() && range.split('.').all(|p| matches!(p, "x" | "X" | "*"))
}

fn invalid(range: &str, message: impl Into<String>) -> OpamError {
    OpamError::InvalidRange {
        range: range.to_string(),
        message: message.into(),
    }
}

/// Parse a single alternative (no `||`).
fn parse_single(range: &str) -> Result<VersionReq> {
    let range = strip_leading_zeros(range.trim());
    let range = range.as_str();

    // "1.0.0 - 2.0.0" -> ">=1.0.0, <=2.0.0"
    if let Some((start, end)) = parse_hyphen_range(range) {
        let converted = format!(">={}, <={}", complete(&start), complete(&end));
        return VersionReq::parse(&converted).map_err(|e| invalid(range, e.to_string()));
    }

    if range.contains(['x', 'X', '*']) && !range.contains(' ') {
        let converted = convert_x_range(range);
        return VersionReq::parse(&converted).map_err(|e| invalid(range, e.to_string()));
    }

    // A bare version is exact ("1.2.3") or an x-range when partial ("1.2")
    if range.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        let parts = range.split('.').filter(|p| !p.is_empty()).count();
        let converted = if parts >= 3 {
            format!("={range}")
        } else {
            convert_x_range(&format!("{range}.x"))
        };
        return VersionReq::parse(&converted).map_err(|e| invalid(range, e.to_string()));
    }

    let converted = convert_space_separated_comparators(range);
    VersionReq::parse(&converted).map_err(|e| invalid(range, e.to_string()))
}

/// Parse a hyphen range like "1.0.0 - 2.0.0".
fn parse_hyphen_range(range: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = range.split(" - ").collect();
    if parts.len() == 2 {
        let start = parts[0].trim();
        let end = parts[1].trim();
        if !start.is_empty() && !end.is_empty() {
            return Some((start.to_string(), end.to_string()));
        }
    }
    None
}

/// Pad a partial version to three components: "1.2" -> "1.2.0".
fn complete(version: &str) -> String {
    let parts = version.split('.').count();
    match parts {
        1 => format!("{version}.0.0"),
        2 => format!("{version}.0"),
        _ => version.to_string(),
    }
}

/// Convert space-separated comparators to comma-separated.
///
/// npm allows `>= 2.1.2 < 3.0.0` meaning `>=2.1.2 AND <3.0.0`;
/// the semver crate requires `>=2.1.2, <3.0.0`.
fn convert_space_separated_comparators(range: &str) -> String {
    let mut result = String::new();
    let mut pending_op = String::new();

    for token in range.split_whitespace() {
        if token_has_version(token) {
            if !result.is_empty() {
                result.push_str(", ");
            }
            result.push_str(&pending_op);
            result.push_str(token);
            pending_op.clear();
        } else {
            // Operator separated from its version: ">= 2.1.2"
            pending_op.push_str(token);
        }
    }

    if result.is_empty() {
        return range.to_string();
    }
    result
}

/// Check if a token contains a version number (has digits).
fn token_has_version(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Convert an x-range to a semver requirement.
fn convert_x_range(range: &str) -> String {
    fn is_wild(part: &str) -> bool {
        matches!(part, "x" | "X" | "*")
    }

    let parts: Vec<&str> = range.split('.').collect();

    match parts.as_slice() {
        [major, rest @ ..] if !is_wild(major) && rest.first().is_some_and(|p| is_wild(p)) => {
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, rest @ ..]
            if !is_wild(major) && !is_wild(minor) && rest.first().is_some_and(|p| is_wild(p)) =>
        {
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }

    if is_wildcard_parts(range) {
        return ">=0.0.0".to_string();
    }

    range.replace(['x', 'X', '*'], "0")
}

/// Drop leading zeros from every numeric run: ">=4.02.0" -> ">=4.2.0".
fn strip_leading_zeros(range: &str) -> String {
    let mut out = String::with_capacity(range.len());
    let mut chars = range.chars().peekable();
    let mut prev_is_digit = false;

    while let Some(c) = chars.next() {
        if c == '0' && !prev_is_digit && chars.peek().is_some_and(char::is_ascii_digit) {
            continue;
        }
        prev_is_digit = c.is_ascii_digit();
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_wildcards_match_everything() {
        for range in ["*", "", "latest", "x.x.x", "x", "x.x"] {
            let r = VersionRange::parse(range).unwrap();
            assert!(r.is_any(), "{range} should be any");
            assert!(r.matches(&v("0.0.1")));
        }
    }

    #[test]
    fn test_x_ranges() {
        let r = VersionRange::parse("1.x").unwrap();
        assert!(r.matches(&v("1.2.0")));
        assert!(!r.matches(&v("2.0.0")));

        let r = VersionRange::parse("1.2.x").unwrap();
        assert!(r.matches(&v("1.2.9")));
        assert!(!r.matches(&v("1.3.0")));

        let r = VersionRange::parse("1.x.x").unwrap();
        assert!(r.matches(&v("1.9.9")));
    }

    #[test]
    fn test_bare_versions() {
        let r = VersionRange::parse("1.2.3").unwrap();
        assert!(r.matches(&v("1.2.3")));
        assert!(!r.matches(&v("1.2.4")));

        let r = VersionRange::parse("1.2").unwrap();
        assert!(r.matches(&v("1.2.7")));
        assert!(!r.matches(&v("1.3.0")));
    }

    #[test]
    fn test_hyphen_range() {
        let r = VersionRange::parse("1.0.0 - 2.0.0").unwrap();
        assert!(r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("2.0.1")));
    }

    #[test]
    fn test_space_separated_comparators() {
        let r = VersionRange::parse(">= 2.1.2 < 3.0.0").unwrap();
        assert!(r.matches(&v("2.5.0")));
        assert!(!r.matches(&v("3.0.0")));

        let r = VersionRange::parse(">=2.1.2 <3.0.0").unwrap();
        assert!(r.matches(&v("2.1.2")));
    }

    #[test]
    fn test_or_range() {
        let r = VersionRange::parse("^1.0.0 || ^3.0.0").unwrap();
        assert!(r.matches(&v("1.5.0")));
        assert!(!r.matches(&v("2.0.0")));
        assert!(r.matches(&v("3.1.0")));
    }

    #[test]
    fn test_leading_zeros() {
        let r = VersionRange::parse(">=4.02.0").unwrap();
        assert!(r.matches(&v("4.2.3")));
        assert!(!r.matches(&v("4.1.0")));
        assert_eq!(strip_leading_zeros(">=4.02.00"), ">=4.2.0");
        assert_eq!(strip_leading_zeros("10.0.100"), "10.0.100");
    }

    #[test]
    fn test_invalid_range() {
        assert!(VersionRange::parse("not-a-range!!!").is_err());
    }

    #[test]
    fn test_satisfies_strips_prerelease() {
        assert!(satisfies("1.2.0-beta", "1.x"));
        assert!(satisfies("1.1.0~rc1", "*"));
        assert!(satisfies("4.02.3", ">=4.2.0 <4.3.0"));
        assert!(!satisfies("dev", "1.x"));
        assert!(satisfies("dev", "*"));
    }
}
