use crate::manifest::Manifest;
use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// File name of the canonical tarball inside a package cache directory.
pub const TARBALL_FILENAME: &str = ".opam-tarball.tgz";

/// Get the default cache root.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_CACHE_HOME/opamfetch/v{N}` or `~/.cache/opamfetch/v{N}`
/// - macOS: `~/Library/Caches/opamfetch/v{N}`
/// - Windows: `%LOCALAPPDATA%\opamfetch\v{N}`
#[must_use]
pub fn default_cache_root() -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".opamfetch-cache"),
                |p| p.join(".cache").join("opamfetch"),
            )
        },
        |p| p.join("opamfetch"),
    );

    base.join(format!("v{SCHEMA_VERSION}"))
}

/// Layout of everything the pipeline keeps under the cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checkout of the opam metadata repository.
    #[must_use]
    pub fn repository_dir(&self) -> PathBuf {
        self.root.join("opam-repository")
    }

    /// Checkout of the override repository.
    #[must_use]
    pub fn override_dir(&self) -> PathBuf {
        self.root.join("esy-opam-override")
    }

    /// Serialized archive URL index.
    #[must_use]
    pub fn url_index_path(&self) -> PathBuf {
        self.root.join("opam-urls")
    }

    /// Scratch space for staging and repacking.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(".tmp")
    }

    /// Unpacked content plus canonical tarball of one resolved package.
    #[must_use]
    pub fn package_dir(&self, manifest: &Manifest) -> PathBuf {
        self.root.join(package_cache_key(manifest))
    }
}

/// Cache key of a resolved package: name, version and content hash prefix.
///
/// `@opam/lwt` at `3.1.0` becomes `opam__s__lwt-3.1.0-<hash16>`.
#[must_use]
pub fn package_cache_key(manifest: &Manifest) -> String {
    let name = manifest
        .name
        .trim_start_matches('@')
        .replace('/', "__s__");
    let uid: String = manifest.content_hash.chars().take(16).collect();
    format!("{name}-{}-{uid}", sanitize(&manifest.version))
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
