//! Pipeline configuration.
//!
//! Every upstream location has a built-in default and can be overridden
//! through the environment (see [`OpamConfig::from_env`]).

use crate::paths::default_cache_root;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the opam metadata repository.
pub const REPOSITORY_ENV: &str = "ESY_OPAM_REPOSITORY";

/// Environment variable overriding the override repository.
pub const OVERRIDE_REPOSITORY_ENV: &str = "ESY_OPAM_REPOSITORY_OVERRIDE";

/// Environment variable overriding the archive index URL.
pub const URLS_ENV: &str = "ESY_OPAM_REPOSITORY_URLS";

/// Environment variable pointing at a fixed override checkout. When set the
/// override repository is never synced.
pub const OVERRIDE_CHECKOUT_ENV: &str = "ESY_OPAM_REPOSITORY_OVERRIDE_CHECKOUT";

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "ESY_OPAM_CACHE_DIR";

/// Default opam repository. Windows uses the mingw fork.
pub const DEFAULT_REPOSITORY: &str = if cfg!(windows) {
    "https://github.com/fdopen/opam-repository-mingw.git"
} else {
    "https://github.com/ocaml/opam-repository.git"
};

pub const DEFAULT_OVERRIDE_REPOSITORY: &str = "https://github.com/esy-ocaml/esy-opam-override.git";

pub const DEFAULT_URLS: &str = "https://opam.ocaml.org/urls.txt";

pub const DEFAULT_BRANCH: &str = "master";

/// How much the pipeline may rely on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Check upstream for changes.
    #[default]
    Online,
    /// Use existing local state without a network round-trip; hit the
    /// network only when nothing is cached.
    PreferOffline,
    /// Never touch the network.
    Offline,
}

impl NetworkMode {
    #[must_use]
    pub fn is_offline(self) -> bool {
        self == Self::Offline
    }

    /// Whether cached state may be used without checking upstream.
    #[must_use]
    pub fn trusts_cache(self) -> bool {
        matches!(self, Self::PreferOffline | Self::Offline)
    }
}

/// Runtime configuration for resolution and fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpamConfig {
    /// Root of the on-disk cache.
    pub cache_root: PathBuf,

    /// Git remote of the opam metadata repository.
    pub repository: String,

    /// Branch of the metadata repository to track.
    pub repository_branch: String,

    /// Git remote of the override repository.
    pub override_repository: String,

    /// Branch of the override repository to track.
    pub override_branch: String,

    /// Fixed override checkout; disables override syncing.
    pub override_checkout: Option<PathBuf>,

    /// URL of the flat archive index.
    pub urls_index: String,

    pub network: NetworkMode,

    /// Pull even when the network policy would allow skipping.
    pub force_update: bool,

    /// Directory receiving a copy of every fetched tarball.
    pub offline_mirror: Option<PathBuf>,
}

impl Default for OpamConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            repository: DEFAULT_REPOSITORY.to_string(),
            repository_branch: DEFAULT_BRANCH.to_string(),
            override_repository: DEFAULT_OVERRIDE_REPOSITORY.to_string(),
            override_branch: DEFAULT_BRANCH.to_string(),
            override_checkout: None,
            urls_index: DEFAULT_URLS.to_string(),
            network: NetworkMode::default(),
            force_update: false,
            offline_mirror: None,
        }
    }
}

impl OpamConfig {
    /// Create a config rooted at the given cache directory.
    #[must_use]
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            ..Default::default()
        }
    }

    /// Build a config from the defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = env_non_empty(CACHE_DIR_ENV) {
            config.cache_root = PathBuf::from(root);
        }
        if let Some(repo) = env_non_empty(REPOSITORY_ENV) {
            config.repository = repo;
        }
        if let Some(repo) = env_non_empty(OVERRIDE_REPOSITORY_ENV) {
            config.override_repository = repo;
        }
        if let Some(urls) = env_non_empty(URLS_ENV) {
            config.urls_index = urls;
        }
        config.override_checkout = env_non_empty(OVERRIDE_CHECKOUT_ENV).map(PathBuf::from);
        config
    }

    #[must_use]
    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    #[must_use]
    pub fn with_force_update(mut self, force: bool) -> Self {
        self.force_update = force;
        self
    }

    #[must_use]
    pub fn with_offline_mirror(mut self, mirror: Option<PathBuf>) -> Self {
        self.offline_mirror = mirror;
        self
    }

    #[must_use]
    pub fn with_urls_index(mut self, url: impl Into<String>) -> Self {
        self.urls_index = url.into();
        self
    }

    #[must_use]
    pub fn with_override_checkout(mut self, checkout: Option<PathBuf>) -> Self {
        self.override_checkout = checkout;
        self
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            CACHE_DIR_ENV,
            REPOSITORY_ENV,
            OVERRIDE_REPOSITORY_ENV,
            URLS_ENV,
            OVERRIDE_CHECKOUT_ENV,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = OpamConfig::from_env();
        assert_eq!(config.repository, DEFAULT_REPOSITORY);
        assert_eq!(config.override_repository, DEFAULT_OVERRIDE_REPOSITORY);
        assert_eq!(config.urls_index, DEFAULT_URLS);
        assert_eq!(config.repository_branch, "master");
        assert!(config.override_checkout.is_none());
        assert_eq!(config.network, NetworkMode::Online);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var(REPOSITORY_ENV, "https://example.com/opam.git");
        std::env::set_var(OVERRIDE_CHECKOUT_ENV, "/tmp/overrides");
        std::env::set_var(URLS_ENV, "http://127.0.0.1:1/urls.txt");
        std::env::set_var(CACHE_DIR_ENV, "/tmp/opam-cache");

        let config = OpamConfig::from_env();
        assert_eq!(config.repository, "https://example.com/opam.git");
        assert_eq!(config.override_checkout, Some(PathBuf::from("/tmp/overrides")));
        assert_eq!(config.urls_index, "http://127.0.0.1:1/urls.txt");
        assert_eq!(config.cache_root, PathBuf::from("/tmp/opam-cache"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_empty_env_value_ignored() {
        clear_env();
        std::env::set_var(OVERRIDE_REPOSITORY_ENV, "");
        let config = OpamConfig::from_env();
        assert_eq!(config.override_repository, DEFAULT_OVERRIDE_REPOSITORY);
        clear_env();
    }

    #[test]
    fn test_network_mode_policy() {
        assert!(!NetworkMode::Online.trusts_cache());
        assert!(NetworkMode::PreferOffline.trusts_cache());
        assert!(NetworkMode::Offline.trusts_cache());
        assert!(NetworkMode::Offline.is_offline());
        assert!(!NetworkMode::PreferOffline.is_offline());
    }
}
