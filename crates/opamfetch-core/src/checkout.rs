//! Fully synced repository mirror plus the caches that depend on it.

use crate::config::OpamConfig;
use crate::error::Result;
use crate::overrides::OverrideStore;
use crate::paths::CacheLayout;
use crate::process::CommandRunner;
use crate::sync::{sync_repository, SyncOptions};
use crate::url_index::{UrlIndex, UrlIndexCache};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RepositoryCheckout {
    checkout_path: PathBuf,
    overrides: OverrideStore,
    url_index: UrlIndex,
}

impl RepositoryCheckout {
    /// Sync the metadata repository, load overrides and fetch the URL
    /// index. The three run concurrently.
    ///
    /// # Errors
    /// Returns the first failure of any of the three steps.
    pub async fn init(
        runner: &dyn CommandRunner,
        http: &Client,
        config: &OpamConfig,
        layout: &CacheLayout,
    ) -> Result<Self> {
        let checkout_path = layout.repository_dir();
        let notify_clone = || {
            info!("Cloning opam repository (this might take a while)...");
        };
        let notify_update = || {
            info!("Updating opam repository checkout...");
        };
        let options = SyncOptions {
            branch: &config.repository_branch,
            force_update: config.force_update,
            network: config.network,
            on_clone: Some(&notify_clone),
            on_update: Some(&notify_update),
        };
        let url_cache = UrlIndexCache::new(
            http.clone(),
            config.urls_index.clone(),
            layout.url_index_path(),
            config.network,
        );

        let ((), overrides, url_index) = tokio::try_join!(
            sync_repository(runner, &config.repository, &checkout_path, &options),
            OverrideStore::init(runner, config, layout),
            url_cache.fetch_index(),
        )?;

        Ok(Self {
            checkout_path,
            overrides,
            url_index,
        })
    }

    #[must_use]
    pub fn checkout_path(&self) -> &Path {
        &self.checkout_path
    }

    #[must_use]
    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    #[must_use]
    pub fn url_index(&self) -> &UrlIndex {
        &self.url_index
    }
}
