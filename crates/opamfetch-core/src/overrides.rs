//! Community overrides for opam packages.
//!
//! The override repository holds one directory per `<name>.<range>` entry
//! under `packages/`. Each entry has a `package.yaml` or `package.json`
//! descriptor and an optional `files/` directory whose contents are added
//! to the package at fetch time.

use crate::config::OpamConfig;
use crate::error::{OpamError, Result};
use crate::manifest::{deserialize_commands, unscoped_name, Command, ExportedEnvVar, File, Manifest};
use crate::paths::CacheLayout;
use crate::process::CommandRunner;
use crate::range::{VersionRange, MATCH_ALL};
use crate::sync::{sync_repository, SyncOptions};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory under the checkout holding override entries.
const PACKAGES_DIR: &str = "packages";

/// Changes one override entry makes to a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRecord {
    /// Replacement build commands.
    #[serde(
        default,
        deserialize_with = "deserialize_build",
        skip_serializing_if = "Option::is_none"
    )]
    pub build: Option<Vec<Command>>,
    /// Dependencies merged over the manifest's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub exported_env: BTreeMap<String, ExportedEnvVar>,
    #[serde(default)]
    pub opam: OverrideSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSource {
    #[serde(default)]
    pub files: Vec<File>,
    /// Replacement archive location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

fn deserialize_build<'de, D>(deserializer: D) -> Result<Option<Vec<Command>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let Some(raw) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    deserialize_commands(raw).map(Some).map_err(D::Error::custom)
}

/// Split an entry directory name into package name and version range.
///
/// `foo.1.x` -> `("foo", "1.x")`, `foo.>=1.0.0_<2.0.0` -> `("foo", ">=1.0.0 <2.0.0")`,
/// `foo` -> `("foo", "x.x.x")`.
#[must_use]
pub fn parse_override_spec(spec: &str) -> (String, String) {
    match spec.split_once('.') {
        Some((name, range)) => (name.to_string(), range.replace('_', " ")),
        None => (spec.to_string(), MATCH_ALL.to_string()),
    }
}

/// Loaded override entries keyed by package name.
#[derive(Debug, Clone, Default)]
pub struct OverrideStore {
    checkout_path: PathBuf,
    overrides: BTreeMap<String, Vec<(VersionRange, OverrideRecord)>>,
}

impl OverrideStore {
    /// Sync the override repository (unless a fixed checkout is configured)
    /// and load every entry.
    ///
    /// # Errors
    /// Returns an error if syncing fails or an override descriptor is invalid.
    pub async fn init(
        runner: &dyn CommandRunner,
        config: &OpamConfig,
        layout: &CacheLayout,
    ) -> Result<Self> {
        let checkout = if let Some(fixed) = &config.override_checkout {
            debug!(path = %fixed.display(), "using fixed override checkout");
            fixed.clone()
        } else {
            let checkout = layout.override_dir();
            let options = SyncOptions {
                branch: &config.override_branch,
                force_update: config.force_update,
                network: config.network,
                ..SyncOptions::default()
            };
            sync_repository(runner, &config.override_repository, &checkout, &options).await?;
            checkout
        };
        Self::load(checkout).await
    }

    /// Load every entry under `<checkout>/packages`. Entries are kept in
    /// directory-name order, which is the order overrides are applied in.
    ///
    /// # Errors
    /// Returns an error if a descriptor cannot be read or parsed.
    pub async fn load(checkout_path: PathBuf) -> Result<Self> {
        let packages = checkout_path.join(PACKAGES_DIR);
        let mut specs = Vec::new();
        match tokio::fs::read_dir(&packages).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        specs.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %packages.display(), "override checkout has no packages directory");
            }
            Err(e) => return Err(e.into()),
        }
        specs.sort();

        let records = futures::future::try_join_all(
            specs.iter().map(|spec| read_override(packages.join(spec))),
        )
        .await?;

        let mut overrides: BTreeMap<String, Vec<(VersionRange, OverrideRecord)>> = BTreeMap::new();
        let mut count = 0usize;
        for (spec, record) in specs.iter().zip(records) {
            let Some(record) = record else {
                continue;
            };
            let (name, range) = parse_override_spec(spec);
            match VersionRange::parse(&range) {
                Ok(range) => {
                    overrides.entry(name).or_default().push((range, record));
                    count += 1;
                }
                Err(e) => warn!(entry = %spec, error = %e, "skipping override with invalid range"),
            }
        }
        debug!(entries = count, packages = overrides.len(), "loaded overrides");

        Ok(Self {
            checkout_path,
            overrides,
        })
    }

    /// Build a store from already parsed entries, in application order.
    #[must_use]
    pub fn from_entries(
        checkout_path: PathBuf,
        entries: impl IntoIterator<Item = (String, VersionRange, OverrideRecord)>,
    ) -> Self {
        let mut overrides: BTreeMap<String, Vec<(VersionRange, OverrideRecord)>> = BTreeMap::new();
        for (name, range, record) in entries {
            overrides.entry(name).or_default().push((range, record));
        }
        Self {
            checkout_path,
            overrides,
        }
    }

    #[must_use]
    pub fn checkout_path(&self) -> &Path {
        &self.checkout_path
    }

    /// Entries for a package, by unscoped name.
    #[must_use]
    pub fn get(&self, name: &str) -> &[(VersionRange, OverrideRecord)] {
        self.overrides.get(name).map_or(&[], Vec::as_slice)
    }

    /// Apply every override whose range matches the manifest's version.
    ///
    /// Build commands are replaced, exported env and dependencies are merged
    /// with the override winning, and files are appended. The content hash
    /// is folded from the incoming hash and every applied override, in
    /// order. A manifest no override applies to is returned unchanged.
    ///
    /// # Errors
    /// Returns an error if an override cannot be serialized for hashing.
    pub fn apply_override(&self, mut manifest: Manifest) -> Result<Manifest> {
        let entries = self.get(unscoped_name(&manifest.name));
        if entries.is_empty() {
            return Ok(manifest);
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(manifest.content_hash.as_bytes());
        let mut applied = 0usize;

        for (range, record) in entries {
            if !range.matches_opam(&manifest.version) {
                continue;
            }
            debug!(package = %manifest.name, version = %manifest.version, range = range.as_str(), "applying override");

            if let Some(build) = &record.build {
                manifest.esy.build.clone_from(build);
            }
            manifest
                .esy
                .exported_env
                .extend(record.exported_env.iter().map(|(k, v)| (k.clone(), v.clone())));
            manifest.opam.files.extend(record.opam.files.iter().cloned());
            if let Some(deps) = &record.dependencies {
                manifest
                    .dependencies
                    .extend(deps.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            if let Some(url) = &record.opam.url {
                manifest.opam.url = Some(url.clone());
                manifest.opam.checksum.clone_from(&record.opam.checksum);
            }

            hasher.update(&serde_json::to_vec(record)?);
            applied += 1;
        }

        if applied > 0 {
            manifest.content_hash = hasher.finalize().to_hex().to_string();
        }
        Ok(manifest)
    }
}

/// Read one entry directory. `None` when it has no descriptor.
async fn read_override(dir: PathBuf) -> Result<Option<OverrideRecord>> {
    let yaml_path = dir.join("package.yaml");
    let json_path = dir.join("package.json");

    let mut record: OverrideRecord = if tokio::fs::try_exists(&yaml_path).await? {
        let data = tokio::fs::read_to_string(&yaml_path).await?;
        serde_yaml_ng::from_str(&data).map_err(|e| OpamError::parse(&yaml_path, e.to_string()))?
    } else if tokio::fs::try_exists(&json_path).await? {
        let data = tokio::fs::read_to_string(&json_path).await?;
        serde_json::from_str(&data).map_err(|e| OpamError::parse(&json_path, e.to_string()))?
    } else {
        debug!(path = %dir.display(), "override entry without descriptor");
        return Ok(None);
    };

    let files_dir = dir.join("files");
    if tokio::fs::try_exists(&files_dir).await? {
        record.opam.files.extend(read_loose_files(files_dir).await?);
    }
    Ok(Some(record))
}

/// Every regular file under `dir`, named by its `/`-separated relative path.
pub(crate) async fn read_loose_files(dir: PathBuf) -> Result<Vec<File>> {
    let files = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<File>> {
        opamfetch_util::fs::list_files(&dir)?
            .into_iter()
            .map(|rel| {
                let content = opamfetch_util::fs::read_to_string_lossy(&dir.join(&rel))?;
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                Ok(File { name, content })
            })
            .collect()
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))??;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
build:
  - [make, all]
  - make install
exportedEnv:
  FOO_LIB:
    val: "$cur__lib"
    scope: global
dependencies:
  "@opam/conf-m4": "*"
"#;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let packages = dir.path().join("packages");
        write(&packages.join("foo.1.x/package.yaml"), YAML);
        write(
            &packages.join("foo/package.json"),
            r#"{"build": "./configure", "exportedEnv": {"FOO_LIB": {"val": "old"}, "FOO_BIN": {"val": "bin"}}}"#,
        );
        write(&packages.join("foo.1.x/files/foo.install"), "lib: [\"foo.cma\"]\n");
        write(&packages.join("foo.2.x/package.json"), r#"{"dependencies": {"@opam/bar": "^2"}}"#);
        std::fs::create_dir_all(packages.join("nodescriptor.1.0.0")).unwrap();
        dir
    }

    #[test]
    fn test_parse_override_spec() {
        assert_eq!(
            parse_override_spec("foo.1.x"),
            ("foo".to_string(), "1.x".to_string())
        );
        assert_eq!(
            parse_override_spec("foo.>=1.0.0_<2.0.0"),
            ("foo".to_string(), ">=1.0.0 <2.0.0".to_string())
        );
        assert_eq!(
            parse_override_spec("foo"),
            ("foo".to_string(), MATCH_ALL.to_string())
        );
    }

    #[tokio::test]
    async fn test_load_normalizes_entries() {
        let dir = fixture();
        let store = OverrideStore::load(dir.path().to_path_buf()).await.unwrap();

        let foo = store.get("foo");
        let ranges: Vec<&str> = foo.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(ranges, vec!["x.x.x", "1.x", "2.x"]);

        let (_, yaml) = &foo[1];
        assert_eq!(
            yaml.build.as_ref().unwrap(),
            &vec![
                Command::Argv(vec!["make".to_string(), "all".to_string()]),
                Command::Shell("make install".to_string()),
            ]
        );
        assert_eq!(yaml.opam.files.len(), 1);
        assert_eq!(yaml.opam.files[0].name, "foo.install");

        let (_, only_deps) = &foo[2];
        assert!(only_deps.build.is_none());
        assert!(only_deps.exported_env.is_empty());
        assert!(only_deps.opam.files.is_empty());

        assert!(store.get("nodescriptor").is_empty());
    }

    #[tokio::test]
    async fn test_range_directory_matches_stripped_version() {
        let dir = fixture();
        let store = OverrideStore::load(dir.path().to_path_buf()).await.unwrap();

        for version in ["1.2.0", "1.2.0-beta"] {
            let mut manifest = Manifest::new("foo", version);
            manifest.seal().unwrap();
            let out = store.apply_override(manifest).unwrap();
            assert_eq!(out.dependencies["@opam/conf-m4"], "*", "{version}");
            assert!(!out.dependencies.contains_key("@opam/bar"));
        }
    }

    #[tokio::test]
    async fn test_apply_order_and_merge() {
        let dir = fixture();
        let store = OverrideStore::load(dir.path().to_path_buf()).await.unwrap();
        let mut manifest = Manifest::new("foo", "1.0.0");
        manifest
            .dependencies
            .insert("@opam/conf-m4".to_string(), ">=1.0.0".to_string());
        manifest.seal().unwrap();

        let out = store.apply_override(manifest).unwrap();
        // "foo" applies before "foo.1.x", so the later build and env win
        assert_eq!(out.esy.build.len(), 2);
        assert_eq!(out.esy.exported_env["FOO_LIB"].value, "$cur__lib");
        assert_eq!(out.esy.exported_env["FOO_BIN"].value, "bin");
        assert_eq!(out.dependencies["@opam/conf-m4"], "*");
        assert_eq!(out.opam.files.len(), 1);
    }

    #[test]
    fn test_hash_is_deterministic_and_tracks_overrides() {
        let record = OverrideRecord {
            build: Some(vec![Command::Shell("make".to_string())]),
            ..OverrideRecord::default()
        };
        let store = |record: OverrideRecord| {
            OverrideStore::from_entries(
                PathBuf::new(),
                [("foo".to_string(), VersionRange::parse("1.x").unwrap(), record)],
            )
        };
        let mut base = Manifest::new("foo", "1.2.0");
        base.seal().unwrap();

        let a = store(record.clone()).apply_override(base.clone()).unwrap();
        let b = store(record.clone()).apply_override(base.clone()).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, base.content_hash);

        let mut changed = record;
        changed.build = Some(vec![Command::Shell("make all".to_string())]);
        let c = store(changed).apply_override(base.clone()).unwrap();
        assert_ne!(c.content_hash, a.content_hash);

        let mut other = Manifest::new("foo", "2.0.0");
        other.seal().unwrap();
        let hash = other.content_hash.clone();
        let untouched = store(OverrideRecord::default()).apply_override(other).unwrap();
        assert_eq!(untouched.content_hash, hash);
    }

    #[test]
    fn test_url_override_replaces_source() {
        let record: OverrideRecord = serde_json::from_str(
            r#"{"opam": {"url": "https://example.com/foo.tgz", "checksum": "0123456789abcdef0123456789abcdef"}}"#,
        )
        .unwrap();
        let store = OverrideStore::from_entries(
            PathBuf::new(),
            [("foo".to_string(), VersionRange::parse(MATCH_ALL).unwrap(), record)],
        );
        let mut manifest = Manifest::new("foo", "1.0");
        manifest.opam.url = Some("https://old.example.com/foo.tgz".to_string());
        let out = store.apply_override(manifest).unwrap();
        assert_eq!(out.opam.url.as_deref(), Some("https://example.com/foo.tgz"));
        assert_eq!(
            out.opam.checksum.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_fixed_checkout_skips_sync() {
        let dir = fixture();
        let runner = crate::process::testing::MockRunner::new(|_, _, _| {
            panic!("no git expected");
        });
        let config = OpamConfig::new(dir.path().join("cache"))
            .with_override_checkout(Some(dir.path().to_path_buf()));
        let layout = CacheLayout::new(config.cache_root.clone());

        let store = OverrideStore::init(&runner, &config, &layout).await.unwrap();
        assert_eq!(store.checkout_path(), dir.path());
        assert_eq!(store.get("foo").len(), 3);
    }
}
