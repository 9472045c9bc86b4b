//! Cached index of prebuilt opam archives.
//!
//! The upstream index is a flat text file with one archive per line:
//!
//! ```text
//! archives/<name>.<version>+opam.tar.gz <md5-hex> <mode>
//! ```
//!
//! The parsed index is stored on disk together with a cache key derived from
//! the upstream `Last-Modified` and `Content-Length` headers. A cheap `HEAD`
//! probe decides whether the body must be downloaded again.

use crate::config::NetworkMode;
use crate::error::{OpamError, Result};
use crate::http::check_status;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, LAST_MODIFIED};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Base URL of the prebuilt archives.
pub const ARCHIVE_BASE_URL: &str = "https://opam.ocaml.org/archives/";

const ARCHIVE_PREFIX: &str = "archives/";
const ARCHIVE_SUFFIX: &str = "+opam.tar.gz";

/// Location and md5 of one prebuilt archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub url: String,
    pub checksum: String,
}

/// Parsed archive index: name -> version -> entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlIndex {
    pub cache_key: String,
    pub archives: BTreeMap<String, BTreeMap<String, ArchiveEntry>>,
}

impl UrlIndex {
    /// Look up the archive of `name` at `version`.
    #[must_use]
    pub fn resolve(&self, name: &str, version: &str) -> Option<&ArchiveEntry> {
        self.archives.get(name)?.get(version)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.archives.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

/// Parse one index line into `(name, version, entry)`.
///
/// Lines of any other shape yield `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<(String, String, ArchiveEntry)> {
    let mut fields = line.split_whitespace();
    let path = fields.next()?;
    let checksum = fields.next()?;
    let _mode = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let stem = path
        .strip_prefix(ARCHIVE_PREFIX)?
        .strip_suffix(ARCHIVE_SUFFIX)?;
    let (name, version) = stem.split_once('.')?;
    if name.is_empty() || version.is_empty() || !is_md5(checksum) {
        return None;
    }

    let entry = ArchiveEntry {
        url: format!("{ARCHIVE_BASE_URL}{name}.{version}{ARCHIVE_SUFFIX}"),
        checksum: checksum.to_ascii_lowercase(),
    };
    Some((name.to_string(), version.to_string(), entry))
}

/// Parse a whole index body.
#[must_use]
pub fn parse_archives(body: &str) -> BTreeMap<String, BTreeMap<String, ArchiveEntry>> {
    let mut archives: BTreeMap<String, BTreeMap<String, ArchiveEntry>> = BTreeMap::new();
    for (name, version, entry) in body.lines().filter_map(parse_line) {
        archives.entry(name).or_default().insert(version, entry);
    }
    archives
}

fn is_md5(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Cache key from response metadata.
#[must_use]
pub fn cache_key(headers: &HeaderMap) -> String {
    format!(
        "{}__{}",
        header_str(headers, &LAST_MODIFIED),
        header_str(headers, &CONTENT_LENGTH)
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Fetches the archive index and keeps its on-disk copy current.
#[derive(Debug, Clone)]
pub struct UrlIndexCache {
    http: Client,
    index_url: String,
    cache_path: PathBuf,
    network: NetworkMode,
}

impl UrlIndexCache {
    #[must_use]
    pub fn new(
        http: Client,
        index_url: impl Into<String>,
        cache_path: impl Into<PathBuf>,
        network: NetworkMode,
    ) -> Self {
        Self {
            http,
            index_url: index_url.into(),
            cache_path: cache_path.into(),
            network,
        }
    }

    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Return the current index, downloading it only when the cached copy
    /// is missing or stale.
    ///
    /// # Errors
    /// - [`OpamError::Offline`] when no cached copy exists and the network is disabled
    /// - [`OpamError::Http`] when a request fails
    pub async fn fetch_index(&self) -> Result<UrlIndex> {
        let cached = self.read_cached().await;

        match cached {
            Some(index) if self.network.trusts_cache() => {
                debug!(path = %self.cache_path.display(), "using cached url index");
                Ok(index)
            }
            Some(index) => {
                let response = self.http.head(&self.index_url).send().await?;
                let key = cache_key(check_status(response)?.headers());
                if key == index.cache_key {
                    debug!(cache_key = %key, "url index unchanged");
                    Ok(index)
                } else {
                    debug!(old = %index.cache_key, new = %key, "url index changed");
                    self.download().await
                }
            }
            None if self.network.is_offline() => Err(OpamError::offline(format!(
                "cannot download {}: network access is disabled",
                self.index_url
            ))),
            None => self.download().await,
        }
    }

    async fn read_cached(&self) -> Option<UrlIndex> {
        let bytes = tokio::fs::read(&self.cache_path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(path = %self.cache_path.display(), error = %e, "ignoring corrupt url index cache");
                None
            }
        }
    }

    async fn download(&self) -> Result<UrlIndex> {
        info!(url = %self.index_url, "downloading url index");
        let response = check_status(self.http.get(&self.index_url).send().await?)?;
        let key = cache_key(response.headers());
        let body = response.text().await?;

        let index = UrlIndex {
            cache_key: key,
            archives: parse_archives(&body),
        };
        debug!(archives = index.len(), "parsed url index");

        let bytes = serde_json::to_vec(&index)?;
        let path = self.cache_path.clone();
        tokio::task::spawn_blocking(move || opamfetch_util::fs::atomic_write(&path, &bytes))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        Ok(index)
    }
}
