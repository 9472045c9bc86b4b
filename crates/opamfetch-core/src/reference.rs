//! Opam request patterns and fetch references.
//!
//! Handles:
//! - `@opam/lwt@^3.0.0` request patterns
//! - `@opam/lwt@3.1.0` fetch references
//! - offline mirror tarball names

use crate::manifest::{Manifest, OPAM_SCOPE};
use crate::range::VersionRange;

/// A requested opam package and range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Unscoped opam name.
    pub name: String,
    pub version: String,
}

/// A resolved package reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Scope without the `@`.
    pub scope: Option<String>,
    pub name: String,
    pub version: String,
}

fn scope_prefix() -> String {
    format!("@{OPAM_SCOPE}/")
}

/// Whether `pattern` is an opam request with a valid range, e.g.
/// `@opam/lwt@^3.0.0`.
#[must_use]
pub fn is_opam_pattern(pattern: &str) -> bool {
    let Some(rest) = pattern.strip_prefix(&scope_prefix()) else {
        return false;
    };
    match rest.split_once('@') {
        Some((name, range)) => !name.is_empty() && VersionRange::parse(range).is_ok(),
        None => false,
    }
}

/// Split a request fragment into name and range; the range defaults to `*`.
#[must_use]
pub fn parse_resolution(fragment: &str) -> Resolution {
    let rest = fragment.strip_prefix(&scope_prefix()).unwrap_or(fragment);
    let (name, version) = rest.split_once('@').unwrap_or((rest, "*"));
    Resolution {
        name: name.to_string(),
        version: (if version.is_empty() { "*" } else { version }).to_string(),
    }
}

/// Parse `@scope/name@version` or `name@version`.
#[must_use]
pub fn parse_reference(reference: &str) -> Option<Reference> {
    let (scope, rest) = match reference.strip_prefix('@') {
        Some(scoped) => {
            let (scope, rest) = scoped.split_once('/')?;
            if scope.is_empty() {
                return None;
            }
            (Some(scope.to_string()), rest)
        }
        None => (None, reference),
    };
    let (name, version) = rest.split_once('@')?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some(Reference {
        scope,
        name: name.to_string(),
        version: version.to_string(),
    })
}

/// Name of a package's tarball in the offline mirror:
/// `@opam-lwt@3.1.0-<uid>.tgz`.
#[must_use]
pub fn tarball_filename(manifest: &Manifest) -> String {
    match parse_reference(&manifest.reference()) {
        Some(Reference {
            scope: Some(scope),
            name,
            version,
        }) => format!("@{scope}-{name}@{version}-{}.tgz", manifest.content_hash),
        Some(Reference { name, version, .. }) => {
            format!("{name}@{version}-{}.tgz", manifest.content_hash)
        }
        None => format!("{}-{}.tgz", manifest.opam_name(), manifest.content_hash),
    }
}
