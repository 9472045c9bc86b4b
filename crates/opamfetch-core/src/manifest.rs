//! Package-manager-native manifest produced for each opam package version.

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Registry scope under which opam packages are exposed.
pub const OPAM_SCOPE: &str = "opam";

/// Name of the peer dependency carrying the compiler constraint.
pub const OCAML_PEER: &str = "ocaml";

/// Normalized manifest of one opam package version.
///
/// Every optional section is always present (possibly empty), so consumers
/// never need to default missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Scoped name, e.g. `@opam/lwt`.
    pub name: String,
    /// Opam version string, kept verbatim.
    pub version: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub esy: EsyConfig,
    #[serde(default)]
    pub opam: OpamSource,
    /// Digest over the final manifest content; the fetch cache identity.
    #[serde(rename = "_uid", default)]
    pub content_hash: String,
    #[serde(rename = "_remote", default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteInfo>,
}

/// Build recipe and environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsyConfig {
    #[serde(default, deserialize_with = "deserialize_commands")]
    pub build: Vec<Command>,
    #[serde(default)]
    pub exported_env: BTreeMap<String, ExportedEnvVar>,
}

/// One build command: an argv list or a shell string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedEnvVar {
    #[serde(rename = "val", alias = "value")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<EnvScope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvScope {
    Global,
    Local,
}

/// Where the package content comes from, plus blobs written at fetch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpamSource {
    #[serde(default)]
    pub url: Option<String>,
    /// Expected md5 of the archive at `url`.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub version: String,
}

/// Extra file written into the package root at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub content: String,
}

/// Patch applied to the package root at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub name: String,
    pub content: String,
}

/// How the package manager locates this package again when fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub reference: String,
    #[serde(default)]
    pub hash: Option<String>,
}

impl Manifest {
    /// Create an empty manifest for an opam package.
    #[must_use]
    pub fn new(opam_name: &str, version: &str) -> Self {
        Self {
            name: scoped_name(opam_name),
            version: version.to_string(),
            dependencies: BTreeMap::new(),
            peer_dependencies: BTreeMap::new(),
            esy: EsyConfig::default(),
            opam: OpamSource {
                version: version.to_string(),
                ..OpamSource::default()
            },
            content_hash: String::new(),
            remote: None,
        }
    }

    /// Name without the `@opam/` scope.
    #[must_use]
    pub fn opam_name(&self) -> &str {
        unscoped_name(&self.name)
    }

    /// `name@version`, used as the fetch reference.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Fill fields that are derived from others and drop duplicate files.
    pub fn normalize(&mut self) {
        if self.opam.version.is_empty() {
            self.opam.version.clone_from(&self.version);
        }
        let mut seen = std::collections::HashSet::new();
        self.opam.files.retain(|f| seen.insert(f.name.clone()));
    }

    /// Digest of the canonical JSON form, ignoring the hash and remote fields.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be serialized.
    pub fn compute_content_hash(&self) -> Result<String> {
        let mut canonical = self.clone();
        canonical.content_hash.clear();
        canonical.remote = None;
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(opamfetch_util::hash::blake3_bytes(&bytes))
    }

    /// Recompute and store the content hash.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be serialized.
    pub fn seal(&mut self) -> Result<()> {
        self.content_hash = self.compute_content_hash()?;
        Ok(())
    }

    /// Attach the remote descriptor the fetcher uses to find this package.
    pub fn attach_remote(&mut self) {
        self.remote = Some(RemoteInfo {
            kind: OPAM_SCOPE.to_string(),
            reference: self.reference(),
            hash: self.opam.checksum.clone(),
        });
    }
}

/// `lwt` -> `@opam/lwt`.
#[must_use]
pub fn scoped_name(opam_name: &str) -> String {
    format!("@{OPAM_SCOPE}/{opam_name}")
}

/// `@opam/lwt` -> `lwt`; names without the scope are returned as-is.
#[must_use]
pub fn unscoped_name(name: &str) -> &str {
    name.strip_prefix('@')
        .and_then(|rest| rest.strip_prefix(OPAM_SCOPE))
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(name)
}

/// Accept `"cmd"`, `["cmd1", "cmd2"]` and `[["make", "all"]]` for `build`.
pub(crate) fn deserialize_commands<'de, D>(deserializer: D) -> Result<Vec<Command>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<Command>),
        Null(()),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::One(cmd) => vec![Command::Shell(cmd)],
        Raw::Many(cmds) => cmds,
        Raw::Null(()) => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_names() {
        assert_eq!(scoped_name("lwt"), "@opam/lwt");
        assert_eq!(unscoped_name("@opam/lwt"), "lwt");
        assert_eq!(unscoped_name("lwt"), "lwt");
        assert_eq!(unscoped_name("@opamx/lwt"), "@opamx/lwt");
    }

    #[test]
    fn test_build_command_shapes() {
        let esy: EsyConfig = serde_json::from_str(r#"{"build": "make"}"#).unwrap();
        assert_eq!(esy.build, vec![Command::Shell("make".to_string())]);

        let esy: EsyConfig =
            serde_json::from_str(r#"{"build": [["make", "all"], "make install"]}"#).unwrap();
        assert_eq!(
            esy.build,
            vec![
                Command::Argv(vec!["make".to_string(), "all".to_string()]),
                Command::Shell("make install".to_string()),
            ]
        );
        assert!(esy.exported_env.is_empty());
    }

    #[test]
    fn test_exported_env_accepts_val_and_value() {
        let esy: EsyConfig = serde_json::from_str(
            r#"{"exportedEnv": {"A": {"val": "1"}, "B": {"value": "2", "scope": "global"}}}"#,
        )
        .unwrap();
        assert_eq!(esy.exported_env["A"].value, "1");
        assert_eq!(esy.exported_env["B"].scope, Some(EnvScope::Global));
    }

    #[test]
    fn test_content_hash_ignores_uid_and_remote() {
        let mut a = Manifest::new("lwt", "3.1.0");
        let before = a.compute_content_hash().unwrap();
        a.content_hash = "something".to_string();
        a.attach_remote();
        assert_eq!(a.compute_content_hash().unwrap(), before);

        a.dependencies
            .insert("@opam/result".to_string(), "*".to_string());
        assert_ne!(a.compute_content_hash().unwrap(), before);
    }

    #[test]
    fn test_missing_sections_default() {
        let m: Manifest = serde_json::from_str(r#"{"name": "@opam/a", "version": "1.0"}"#).unwrap();
        assert!(m.esy.build.is_empty());
        assert!(m.opam.files.is_empty());
        assert!(m.opam.url.is_none());
    }

    #[test]
    fn test_normalize_dedupes_files() {
        let mut m = Manifest::new("a", "1.0");
        m.opam.version.clear();
        for _ in 0..2 {
            m.opam.files.push(File {
                name: "a.install".to_string(),
                content: String::new(),
            });
        }
        m.normalize();
        assert_eq!(m.opam.files.len(), 1);
        assert_eq!(m.opam.version, "1.0");
    }
}
