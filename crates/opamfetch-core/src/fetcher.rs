//! Materializes a resolved manifest into the package cache.
//!
//! A fetch downloads (or synthesizes) the package sources, lays the
//! manifest, extra files and patches on top, repacks the result into a
//! canonical tarball, places it in the cache directory and unpacks it
//! there. The offline mirror, when configured, gets a copy of the tarball
//! and is consulted before going to the network.

use crate::archive::{self, ArchiveFormat};
use crate::config::{NetworkMode, OpamConfig};
use crate::error::{OpamError, Result};
use crate::http::check_status;
use crate::manifest::Manifest;
use crate::paths::{CacheLayout, TARBALL_FILENAME};
use crate::process::{args, CommandRunner};
use crate::reference::tarball_filename;
use opamfetch_util::hash::Md5Stream;
use reqwest::Client;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Outcome of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Content hash of the manifest that was materialized.
    pub content_hash: String,
    /// Canonical tarball inside the destination directory.
    pub archive_path: PathBuf,
    /// Upstream md5 the download was verified against, if any.
    pub source_checksum: Option<String>,
}

/// Downloads, stages and caches opam packages.
pub struct Fetcher {
    http: Client,
    runner: Arc<dyn CommandRunner>,
    temp_root: PathBuf,
    offline_mirror: Option<PathBuf>,
    network: NetworkMode,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("temp_root", &self.temp_root)
            .field("offline_mirror", &self.offline_mirror)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    #[must_use]
    pub fn new(
        http: Client,
        runner: Arc<dyn CommandRunner>,
        config: &OpamConfig,
        layout: &CacheLayout,
    ) -> Self {
        Self {
            http,
            runner,
            temp_root: layout.temp_dir(),
            offline_mirror: config.offline_mirror.clone(),
            network: config.network,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Materialize `manifest` into `dest`.
    ///
    /// On success `dest` holds the unpacked package plus its canonical
    /// tarball. Concurrent fetches of the same destination are serialized,
    /// and a destination that already holds a tarball is returned as-is.
    /// The tarball is written last, so a failed fetch never leaves one
    /// behind.
    ///
    /// # Errors
    /// - [`OpamError::ChecksumMismatch`] if the download does not match the md5
    /// - [`OpamError::Offline`] if a download is needed but the network is off
    /// - [`OpamError::ProcessExecution`] if a patch does not apply
    pub async fn materialize(&self, manifest: &Manifest, dest: &Path) -> Result<FetchResult> {
        let lock = self.lock_for(dest);
        let result = {
            let _guard = lock.lock().await;
            self.materialize_locked(manifest, dest).await
        };
        self.release_lock(dest, &lock);
        result
    }

    async fn materialize_locked(&self, manifest: &Manifest, dest: &Path) -> Result<FetchResult> {
        let archive_path = dest.join(TARBALL_FILENAME);
        let result = FetchResult {
            content_hash: manifest.content_hash.clone(),
            archive_path: archive_path.clone(),
            source_checksum: manifest.opam.checksum.clone(),
        };
        if tokio::fs::try_exists(&archive_path).await? {
            debug!(package = %manifest.reference(), "already in cache");
            return Ok(result);
        }

        tokio::fs::create_dir_all(&self.temp_root).await?;
        let workdir = tempfile::Builder::new()
            .prefix("opam-fetch-")
            .tempdir_in(&self.temp_root)?;
        let packed = workdir.path().join("package.tgz");

        let mirror_copy = self.mirror_path(manifest);
        let from_mirror = match &mirror_copy {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        };

        match mirror_copy.as_deref().filter(|_| from_mirror) {
            Some(path) => {
                debug!(package = %manifest.reference(), mirror = %path.display(), "using offline mirror");
                tokio::fs::copy(path, &packed).await?;
            }
            None => {
                let staging = self.stage(manifest, workdir.path()).await?;
                self.overlay(manifest, &staging, workdir.path()).await?;
                let out = packed.clone();
                blocking(move || archive::pack_directory(&staging, &out)).await?;
            }
        }

        let unpacked = workdir.path().join("unpacked");
        {
            let (packed, unpacked) = (packed.clone(), unpacked.clone());
            blocking(move || archive::unpack_canonical(&packed, &unpacked)).await?;
        }

        if let (Some(mirror), false) = (&mirror_copy, from_mirror) {
            let (src, target) = (packed.clone(), mirror.clone());
            blocking(move || copy_to_mirror(&src, &target)).await?;
            debug!(package = %manifest.reference(), mirror = %mirror.display(), "mirrored");
        }

        let dest_dir = dest.to_path_buf();
        blocking(move || place_entry(&unpacked, &packed, &dest_dir, &archive_path)).await?;

        info!(package = %manifest.reference(), dest = %dest.display(), "fetched");
        Ok(result)
    }

    fn lock_for(&self, dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(dest.to_path_buf()).or_default())
    }

    /// Drop the lock entry once no other fetch holds or waits on it.
    fn release_lock(&self, dest: &Path, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = locks.get(dest).is_some_and(|held| Arc::ptr_eq(held, lock));
        // The map and this caller
        if ours && Arc::strong_count(lock) == 2 {
            locks.remove(dest);
        }
    }

    fn mirror_path(&self, manifest: &Manifest) -> Option<PathBuf> {
        self.offline_mirror
            .as_ref()
            .map(|dir| dir.join(tarball_filename(manifest)))
    }

    /// Produce the directory holding the package sources: the extracted
    /// download, or an empty directory when there is nothing to download.
    async fn stage(&self, manifest: &Manifest, workdir: &Path) -> Result<PathBuf> {
        let Some(url) = manifest.opam.url.as_deref() else {
            let staging = workdir.join("package");
            tokio::fs::create_dir_all(&staging).await?;
            return Ok(staging);
        };

        if self.network.is_offline() {
            return Err(OpamError::offline(format!(
                "{} is not in the offline mirror and {url} cannot be downloaded",
                manifest.reference()
            )));
        }

        let format = ArchiveFormat::from_filename(&archive_name(url));
        let download = workdir.join(format!("source.{}", format.suffix()));
        self.download(url, manifest.opam.checksum.as_deref(), &download)
            .await?;

        let extracted = workdir.join("source");
        archive::extract_source(self.runner.as_ref(), &download, format, &extracted).await?;
        tokio::fs::remove_file(&download).await?;
        Ok(archive::find_extracted_root(&extracted)?)
    }

    /// Stream `url` to `target`, verifying the md5 as bytes arrive.
    async fn download(&self, url: &str, checksum: Option<&str>, target: &Path) -> Result<()> {
        info!(url, "downloading");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OpamError::Http {
                url: url.to_string(),
                status: None,
                message: e.to_string(),
            })?;
        let mut response = check_status(response)?;

        let mut file = tokio::fs::File::create(target).await?;
        let mut md5 = Md5Stream::new();
        while let Some(chunk) = response.chunk().await? {
            md5.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(url, bytes = md5.len(), "downloaded");

        let actual = md5.finish_hex();
        if let Some(expected) = checksum {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(OpamError::ChecksumMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Write `package.json` and the attached files, then apply patches in
    /// order. Patch files live in `workdir`, outside the staged tree.
    async fn overlay(&self, manifest: &Manifest, staging: &Path, workdir: &Path) -> Result<()> {
        tokio::fs::write(
            staging.join("package.json"),
            serde_json::to_vec_pretty(manifest)?,
        )
        .await?;

        for file in &manifest.opam.files {
            let path = staging.join(relative_blob_path(&file.name)?);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.content).await?;
        }

        for (i, patch) in manifest.opam.patches.iter().enumerate() {
            let patch_path = workdir.join(format!("patch-{i}.patch"));
            tokio::fs::write(&patch_path, &patch.content).await?;
            debug!(package = %manifest.reference(), patch = %patch.name, "applying patch");

            let patch_arg = patch_path.to_string_lossy().into_owned();
            let applied = self
                .runner
                .run("patch", &args(["-p1", "-i", patch_arg.as_str()]), Some(staging))
                .await;
            let _ = tokio::fs::remove_file(&patch_path).await;
            applied?;
        }
        Ok(())
    }
}

/// Copy a tarball into the mirror under a temp name, then rename it.
fn copy_to_mirror(packed: &Path, mirror: &Path) -> Result<()> {
    let parent = mirror.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::copy(&mut std::fs::File::open(packed)?, temp.as_file_mut())?;
    temp.persist(mirror).map_err(|e| e.error)?;
    Ok(())
}

/// Move the unpacked tree to `dest`, then the tarball into it.
///
/// Anything already at `dest` has no tarball, so it is left over from an
/// interrupted fetch and is replaced.
fn place_entry(unpacked: &Path, packed: &Path, dest: &Path, archive_path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(dest)?,
        Ok(_) => std::fs::remove_file(dest)?,
        Err(_) => {}
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if std::fs::rename(unpacked, dest).is_err() {
        // Different filesystem: unpack in place instead
        if let Err(e) = archive::unpack_canonical(packed, dest) {
            let _ = std::fs::remove_dir_all(dest);
            return Err(e);
        }
    }
    if let Err(e) = opamfetch_util::fs::move_file(packed, archive_path) {
        let _ = std::fs::remove_dir_all(dest);
        return Err(e.into());
    }
    Ok(())
}

/// Last path segment of a download URL, used to guess the archive format.
fn archive_name(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string(),
        Err(_) => url.rsplit('/').next().unwrap_or(url).to_string(),
    }
}

/// Attached file names are relative paths inside the package.
fn relative_blob_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let safe = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(OpamError::archive(format!(
            "refusing to write file outside the package: {name}"
        )))
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OpamError::archive(format!("fetch task failed: {e}")))?
}
