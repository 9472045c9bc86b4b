//! Opam version ordering and conversion to semver.
//!
//! Opam orders versions with the Debian algorithm: versions are split into
//! alternating non-digit and digit runs; non-digit runs compare character by
//! character where `~` sorts before everything (even the end of the string)
//! and letters sort before other characters; digit runs compare numerically.

use semver::{BuildMetadata, Prerelease, Version};
use std::cmp::Ordering;
use std::fmt;

/// An opam version string with opam's native ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpamVersion(String);

impl OpamVersion {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Semver view of this version with pre-release and build cleared.
    #[must_use]
    pub fn to_stripped_semver(&self) -> Option<Version> {
        to_semver(&self.0).map(strip_prerelease)
    }
}

impl fmt::Display for OpamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for OpamVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

impl PartialOrd for OpamVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two opam version strings.
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() || j < b.len() {
        // Non-digit run
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit())
        {
            let ac = char_order(a.get(i).copied());
            let bc = char_order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        // Digit run: the first differing digit decides unless one run is longer
        let mut first_diff = Ordering::Equal;
        while i < a.len() && a[i].is_ascii_digit() && j < b.len() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

/// Weight of one character inside a non-digit run. `None` is end of string.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(c) => i32::from(c) + 256,
    }
}

/// Convert an opam version to the closest semver.
///
/// Up to three leading numeric components become major/minor/patch
/// (missing ones are zero, leading zeros dropped, an initial `v` ignored).
/// Whatever follows becomes the pre-release, sanitized to semver's
/// identifier alphabet. Returns `None` when there is no leading number.
///
/// `4.02.3` -> `4.2.3`, `1.2` -> `1.2.0`, `v0.9.0` -> `0.9.0`,
/// `1.0+beta` -> `1.0.0-beta`, `0.9.0~rc1` -> `0.9.0-rc1`.
#[must_use]
pub fn to_semver(version: &str) -> Option<Version> {
    let s = version.trim();
    let s = s
        .strip_prefix('v')
        .or_else(|| s.strip_prefix('V'))
        .unwrap_or(s);

    let mut parts = [0u64; 3];
    let mut rest = s;
    let mut count = 0;
    while count < 3 {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            break;
        }
        parts[count] = rest[..digits].parse().ok()?;
        count += 1;
        rest = &rest[digits..];
        match rest.strip_prefix('.') {
            Some(after) if after.starts_with(|c: char| c.is_ascii_digit()) && count < 3 => {
                rest = after;
            }
            _ => break,
        }
    }
    if count == 0 {
        return None;
    }

    let suffix = rest.trim_start_matches(['.', '-', '+', '~', '_']);
    let pre = sanitize_prerelease(suffix);
    let pre = if pre.is_empty() {
        Prerelease::EMPTY
    } else {
        Prerelease::new(&pre).ok()?
    };

    Some(Version {
        major: parts[0],
        minor: parts[1],
        patch: parts[2],
        pre,
        build: BuildMetadata::EMPTY,
    })
}

/// Clear pre-release and build metadata so wildcard ranges match.
#[must_use]
pub fn strip_prerelease(mut version: Version) -> Version {
    version.pre = Prerelease::EMPTY;
    version.build = BuildMetadata::EMPTY;
    version
}

/// Map an opam version into the semver dialect used in manifest ranges.
///
/// Falls back to the raw string when there is nothing numeric to keep.
#[must_use]
pub fn to_range_version(version: &str) -> String {
    to_semver(version).map_or_else(|| version.to_string(), |v| v.to_string())
}

fn sanitize_prerelease(suffix: &str) -> String {
    let mapped: String = suffix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '.' })
        .collect();
    mapped
        .split('.')
        .filter(|ident| !ident.is_empty())
        .map(|ident| {
            // Numeric identifiers must not carry leading zeros
            if ident.bytes().all(|b| b.is_ascii_digit()) {
                let trimmed = ident.trim_start_matches('0');
                if trimmed.is_empty() {
                    "0".to_string()
                } else {
                    trimmed.to_string()
                }
            } else {
                ident.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ordering() {
        assert_eq!(compare("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare("4.02.3", "4.2.3"), Ordering::Equal);
        assert_eq!(compare("1.0", "1.0.0"), Ordering::Less);
    }

    #[test]
    fn test_tilde_sorts_first() {
        assert_eq!(compare("1.0~beta", "1.0"), Ordering::Less);
        assert_eq!(compare("1.0~~", "1.0~"), Ordering::Less);
        assert_eq!(compare("1.0~beta", "1.0~alpha"), Ordering::Greater);
    }

    #[test]
    fn test_letters_before_symbols() {
        assert_eq!(compare("1.0a", "1.0+"), Ordering::Less);
        assert_eq!(compare("1.0+beta", "1.0"), Ordering::Greater);
    }

    #[test]
    fn test_dash_prerelease_is_not_special() {
        // Unlike semver, a dash suffix sorts after the bare version
        assert_eq!(compare("1.1.0-beta", "1.1.0"), Ordering::Greater);
        assert_eq!(compare("1.1.0-beta", "1.0.0"), Ordering::Greater);
    }

    #[test]
    fn test_sort_descending() {
        let mut versions: Vec<OpamVersion> = ["0.9", "1.0~rc1", "1.0", "1.0.1", "v0.10"]
            .into_iter()
            .map(OpamVersion::new)
            .collect();
        versions.sort_by(|a, b| b.cmp(a));
        let sorted: Vec<&str> = versions.iter().map(OpamVersion::as_str).collect();
        assert_eq!(sorted, vec!["v0.10", "1.0.1", "1.0", "1.0~rc1", "0.9"]);
    }

    #[test]
    fn test_to_semver() {
        assert_eq!(to_semver("4.02.3").unwrap().to_string(), "4.2.3");
        assert_eq!(to_semver("1.2").unwrap().to_string(), "1.2.0");
        assert_eq!(to_semver("v0.9.0").unwrap().to_string(), "0.9.0");
        assert_eq!(to_semver("1.0+beta").unwrap().to_string(), "1.0.0-beta");
        assert_eq!(to_semver("0.9.0~rc1").unwrap().to_string(), "0.9.0-rc1");
        assert_eq!(to_semver("113.33.03").unwrap().to_string(), "113.33.3");
        assert_eq!(to_semver("1.2.3.4").unwrap().to_string(), "1.2.3-4");
        assert_eq!(to_semver("1.1.0-beta").unwrap().to_string(), "1.1.0-beta");
        assert!(to_semver("dev").is_none());
    }

    #[test]
    fn test_stripped_semver() {
        let v = OpamVersion::new("1.1.0-beta").to_stripped_semver().unwrap();
        assert_eq!(v.to_string(), "1.1.0");
    }
}
