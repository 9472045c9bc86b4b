//! Conversion of a package's version directories into manifests.

use crate::error::{OpamError, Result};
use crate::manifest::{Manifest, Patch};
use crate::opam::{self, UrlSpec};
use crate::overrides::{read_loose_files, OverrideStore};
use crate::url_index::UrlIndex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Every known version of one package.
#[derive(Debug, Clone, Default)]
pub struct ManifestCollection {
    /// Unscoped opam name.
    pub name: String,
    pub versions: BTreeMap<String, Manifest>,
}

/// Where manifests are read from and what gets merged into them.
#[derive(Clone, Copy)]
pub struct CollectorContext<'a> {
    /// Root of the opam repository checkout.
    pub repository: &'a Path,
    pub overrides: &'a OverrideStore,
    pub url_index: &'a UrlIndex,
}

impl CollectorContext<'_> {
    fn package_dir(&self, name: &str) -> PathBuf {
        self.repository.join("packages").join(name)
    }
}

/// Convert every version directory of `package_name`.
///
/// Versions are converted concurrently; the collection is assembled once
/// all of them are done.
///
/// # Errors
/// - [`OpamError::PackageNotFound`] when the repository has no such package
/// - [`OpamError::Parse`] when an opam or url file is malformed
pub async fn get_manifest_collection(
    ctx: CollectorContext<'_>,
    package_name: &str,
) -> Result<ManifestCollection> {
    let package_dir = ctx.package_dir(package_name);
    if !tokio::fs::try_exists(&package_dir).await? {
        return Err(OpamError::PackageNotFound {
            name: package_name.to_string(),
        });
    }

    let mut specs = Vec::new();
    let mut entries = tokio::fs::read_dir(&package_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            specs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let manifests = futures::future::try_join_all(
        specs
            .iter()
            .map(|spec| convert_version(ctx, package_name, spec, package_dir.join(spec))),
    )
    .await?;

    let versions: BTreeMap<String, Manifest> = manifests
        .into_iter()
        .flatten()
        .map(|m| (m.version.clone(), m))
        .collect();
    debug!(package = package_name, versions = versions.len(), "collected manifests");

    Ok(ManifestCollection {
        name: package_name.to_string(),
        versions,
    })
}

/// Version part of a `<name>.<version>` directory name.
#[must_use]
pub fn version_from_spec<'a>(name: &str, spec: &'a str) -> Option<&'a str> {
    let version = spec
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('.'))
        .or_else(|| spec.split_once('.').map(|(_, v)| v))?;
    (!version.is_empty()).then_some(version)
}

async fn convert_version(
    ctx: CollectorContext<'_>,
    name: &str,
    spec: &str,
    version_dir: PathBuf,
) -> Result<Option<Manifest>> {
    let Some(version) = version_from_spec(name, spec) else {
        warn!(package = name, dir = spec, "skipping version directory without a version");
        return Ok(None);
    };

    let opam_path = version_dir.join("opam");
    let source = read_lossy(&opam_path).await?;
    let file = opam::parse(&source).map_err(|e| OpamError::parse(&opam_path, e.to_string()))?;
    let rendered = opam::render(name, version, &file);
    let mut manifest = rendered.manifest;

    let location = match ctx.url_index.resolve(name, version) {
        Some(entry) => Some(UrlSpec {
            url: entry.url.clone(),
            checksum: Some(entry.checksum.clone()),
        }),
        None => match read_url_file(&version_dir).await? {
            Some(spec) => Some(spec),
            None => rendered.url,
        },
    };
    if let Some(location) = location {
        manifest.opam.url = Some(location.url);
        manifest.opam.checksum = location.checksum;
    }

    let files_dir = version_dir.join("files");
    let mut patch_names = HashSet::new();
    for patch in &rendered.patches {
        match read_lossy(&files_dir.join(patch)).await {
            Ok(content) => {
                patch_names.insert(patch.clone());
                manifest.opam.patches.push(Patch {
                    name: patch.clone(),
                    content,
                });
            }
            Err(e) => warn!(package = name, version, patch = %patch, error = %e, "patch file unreadable"),
        }
    }
    if tokio::fs::try_exists(&files_dir).await? {
        let files = read_loose_files(files_dir).await?;
        manifest
            .opam
            .files
            .extend(files.into_iter().filter(|f| !patch_names.contains(&f.name)));
    }

    manifest.normalize();
    manifest.seal()?;
    let manifest = ctx.overrides.apply_override(manifest)?;
    Ok(Some(manifest))
}

async fn read_url_file(version_dir: &Path) -> Result<Option<UrlSpec>> {
    let url_path = version_dir.join("url");
    if !tokio::fs::try_exists(&url_path).await? {
        return Ok(None);
    }
    let source = read_lossy(&url_path).await?;
    opam::parse_url_file(&source).map_err(|e| OpamError::parse(&url_path, e.to_string()))
}

async fn read_lossy(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
