//! Version selection and the resolver façade.
//!
//! Resolvers share one lazily initialized repository checkout per cache
//! root, so within a process the metadata repository is synced, the
//! overrides loaded and the URL index fetched at most once per cache no
//! matter how many resolvers or resolutions run concurrently.

use crate::checkout::RepositoryCheckout;
use crate::collector::{get_manifest_collection, CollectorContext, ManifestCollection};
use crate::config::OpamConfig;
use crate::error::{OpamError, Result};
use crate::fetcher::{FetchResult, Fetcher};
use crate::http::build_client;
use crate::manifest::{scoped_name, unscoped_name, Manifest, OCAML_PEER};
use crate::opam::version::compare;
use crate::paths::CacheLayout;
use crate::process::{CommandRunner, SystemRunner};
use crate::range::{satisfies, VersionRange};
use crate::reference::parse_reference;
use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::debug;

/// Range requested when the caller gives none.
const ANY_RANGE: &str = "*";

type SharedCheckout = Arc<OnceCell<RepositoryCheckout>>;

/// Checkout cells of every cache root used in this process.
static CHECKOUTS: OnceLock<Mutex<HashMap<PathBuf, SharedCheckout>>> = OnceLock::new();

fn shared_checkout(cache_root: &Path) -> SharedCheckout {
    let mut cells = CHECKOUTS
        .get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(cells.entry(cache_root.to_path_buf()).or_default())
}

/// `None` and `latest` mean any version.
#[must_use]
pub fn normalize_range(range: Option<&str>) -> &str {
    match range.map(str::trim) {
        None | Some("" | "latest") => ANY_RANGE,
        Some(range) => range,
    }
}

/// Pick the highest version of `collection` satisfying `range`.
///
/// With `peer` set, versions whose `ocaml` peer constraint rejects that
/// compiler version are discarded first; a missing constraint accepts any
/// compiler. Candidates are ordered by the opam comparator, highest first,
/// and the first one matching `range` wins.
///
/// Returns `Ok(None)` when no candidate matches the range.
///
/// # Errors
/// - [`OpamError::InvalidRange`] if `range` cannot be parsed
/// - [`OpamError::NoCompatibleVersion`] if the peer filter rejects every version
pub fn choose_version(
    collection: &ManifestCollection,
    range: Option<&str>,
    peer: Option<&str>,
) -> Result<Option<String>> {
    let range = normalize_range(range);
    let requirement = VersionRange::parse(range)?;

    let mut candidates: Vec<&Manifest> = collection.versions.values().collect();
    if let Some(peer) = peer {
        candidates.retain(|m| {
            let constraint = m
                .peer_dependencies
                .get(OCAML_PEER)
                .map_or(ANY_RANGE, String::as_str);
            satisfies(peer, constraint)
        });
        if candidates.is_empty() {
            return Err(OpamError::NoCompatibleVersion {
                name: scoped_name(&collection.name),
                range: range.to_string(),
                peer: Some(peer.to_string()),
                path: None,
            });
        }
    }

    candidates.sort_by(|a, b| compare(&b.version, &a.version));
    Ok(candidates
        .into_iter()
        .find(|m| requirement.matches_opam(&m.version))
        .map(|m| m.version.clone()))
}

/// Entry point for resolving and fetching opam packages.
pub struct OpamResolver {
    config: OpamConfig,
    layout: CacheLayout,
    runner: Arc<dyn CommandRunner>,
    http: Client,
    checkout: SharedCheckout,
    /// Manifests pinned by a lockfile, keyed by scoped name.
    locked: RwLock<HashMap<String, Manifest>>,
    fetcher: Fetcher,
}

impl std::fmt::Debug for OpamResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpamResolver")
            .field("config", &self.config)
            .field("initialized", &self.checkout.initialized())
            .finish_non_exhaustive()
    }
}

impl OpamResolver {
    /// Create a resolver that runs git and patch on the host.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OpamConfig) -> Result<Self> {
        Ok(Self::with_runner(config, Arc::new(SystemRunner), build_client()?))
    }

    #[must_use]
    pub fn with_runner(config: OpamConfig, runner: Arc<dyn CommandRunner>, http: Client) -> Self {
        let layout = CacheLayout::new(&config.cache_root);
        let fetcher = Fetcher::new(http.clone(), Arc::clone(&runner), &config, &layout);
        let checkout = shared_checkout(&config.cache_root);
        Self {
            config,
            layout,
            runner,
            http,
            checkout,
            locked: RwLock::new(HashMap::new()),
            fetcher,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OpamConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// The synced checkout. Initialized on first use by any resolver over
    /// the same cache root; concurrent callers wait on that initialization.
    ///
    /// # Errors
    /// Returns the initialization error. A failed initialization is retried
    /// by the next caller.
    pub async fn checkout(&self) -> Result<&RepositoryCheckout> {
        self.checkout
            .get_or_try_init(|| {
                RepositoryCheckout::init(self.runner.as_ref(), &self.http, &self.config, &self.layout)
            })
            .await
    }

    /// Pin manifests from a lockfile. A pinned manifest is returned by
    /// [`resolve`](Self::resolve) whenever its version satisfies the request.
    pub fn lock_manifests(&self, manifests: impl IntoIterator<Item = Manifest>) {
        let mut locked = self.locked.write().unwrap_or_else(PoisonError::into_inner);
        for manifest in manifests {
            locked.insert(manifest.name.clone(), manifest);
        }
    }

    fn locked_manifest(&self, name: &str) -> Option<Manifest> {
        let locked = self.locked.read().unwrap_or_else(PoisonError::into_inner);
        locked.get(&scoped_name(name)).cloned()
    }

    /// Resolve `name` (scoped or not) against `range`, optionally filtering
    /// by the `ocaml` version in use.
    ///
    /// # Errors
    /// - [`OpamError::PackageNotFound`] if the repository has no such package
    /// - [`OpamError::NoCompatibleVersion`] if no version matches
    pub async fn resolve(
        &self,
        name: &str,
        range: Option<&str>,
        peer: Option<&str>,
    ) -> Result<Manifest> {
        let name = unscoped_name(name);
        let range = normalize_range(range);

        if let Some(locked) = self.locked_manifest(name) {
            if VersionRange::parse(range)?.matches_opam(&locked.version) {
                debug!(package = name, version = %locked.version, "using locked manifest");
                return Ok(locked);
            }
        }

        let mut collection = self.manifest_collection(name).await?;
        let Some(version) = choose_version(&collection, Some(range), peer)? else {
            return Err(OpamError::NoCompatibleVersion {
                name: scoped_name(name),
                range: range.to_string(),
                peer: peer.map(str::to_string),
                path: None,
            });
        };

        let Some(mut manifest) = collection.versions.remove(&version) else {
            return Err(OpamError::PackageNotFound {
                name: name.to_string(),
            });
        };
        manifest.attach_remote();
        debug!(package = name, range, version = %manifest.version, "resolved");
        Ok(manifest)
    }

    /// Every version of `name` known to the repository.
    ///
    /// # Errors
    /// Returns an error if initialization fails or the package does not exist.
    pub async fn manifest_collection(&self, name: &str) -> Result<ManifestCollection> {
        let checkout = self.checkout().await?;
        let ctx = CollectorContext {
            repository: checkout.checkout_path(),
            overrides: checkout.overrides(),
            url_index: checkout.url_index(),
        };
        get_manifest_collection(ctx, unscoped_name(name)).await
    }

    /// Manifest of an exact version, or `None` if that version does not exist.
    ///
    /// # Errors
    /// Returns an error if initialization fails or the package does not exist.
    pub async fn lookup_manifest(&self, name: &str, version: &str) -> Result<Option<Manifest>> {
        let name = unscoped_name(name);
        if let Some(locked) = self.locked_manifest(name).filter(|m| m.version == version) {
            return Ok(Some(locked));
        }

        let mut collection = self.manifest_collection(name).await?;
        Ok(collection.versions.remove(version).map(|mut manifest| {
            manifest.attach_remote();
            manifest
        }))
    }

    /// Materialize a resolved manifest into its package cache directory.
    ///
    /// # Errors
    /// See [`Fetcher::materialize`].
    pub async fn fetch(&self, manifest: &Manifest) -> Result<FetchResult> {
        let dest = self.layout.package_dir(manifest);
        self.fetcher.materialize(manifest, &dest).await
    }

    /// Fetch by `@opam/<name>@<version>` reference.
    ///
    /// # Errors
    /// - [`OpamError::PackageNotFound`] if the reference is malformed or unknown
    /// - [`OpamError::NoCompatibleVersion`] if the version does not exist
    pub async fn fetch_reference(&self, reference: &str) -> Result<FetchResult> {
        let Some(parsed) = parse_reference(reference) else {
            return Err(OpamError::PackageNotFound {
                name: reference.to_string(),
            });
        };
        let Some(manifest) = self.lookup_manifest(&parsed.name, &parsed.version).await? else {
            return Err(OpamError::NoCompatibleVersion {
                name: scoped_name(&parsed.name),
                range: parsed.version,
                peer: None,
                path: None,
            });
        };
        self.fetch(&manifest).await
    }
}
