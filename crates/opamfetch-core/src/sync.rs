//! Clone-or-update of git mirrors with branch pinning and network policy.

use crate::config::{NetworkMode, DEFAULT_BRANCH};
use crate::error::{OpamError, Result};
use crate::process::{args, CommandRunner};
use std::path::Path;
use tracing::{debug, info, warn};

/// Depth used for every clone and pull.
pub const SHALLOW_DEPTH: u32 = 1;

/// Callback invoked before a clone or an update starts.
pub type Notify<'a> = &'a (dyn Fn() + Send + Sync);

/// Options for [`sync_repository`].
#[derive(Clone, Copy)]
pub struct SyncOptions<'a> {
    pub branch: &'a str,
    pub force_update: bool,
    pub network: NetworkMode,
    pub on_clone: Option<Notify<'a>>,
    pub on_update: Option<Notify<'a>>,
}

impl Default for SyncOptions<'_> {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH,
            force_update: false,
            network: NetworkMode::Online,
            on_clone: None,
            on_update: None,
        }
    }
}

impl std::fmt::Debug for SyncOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("branch", &self.branch)
            .field("force_update", &self.force_update)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// Make `local` a shallow checkout of `remote` at `options.branch`.
///
/// A missing checkout is cloned. An existing checkout on another branch is
/// removed and cloned again. An existing checkout on the right branch is
/// pulled only when the remote tip differs from the local one, and only
/// checked at all when the network policy requires it.
///
/// # Errors
/// - [`OpamError::Offline`] when a clone or forced update is needed offline
/// - [`OpamError::ProcessExecution`] when a git command fails
pub async fn sync_repository(
    runner: &dyn CommandRunner,
    remote: &str,
    local: &Path,
    options: &SyncOptions<'_>,
) -> Result<()> {
    let branch = options.branch;
    let depth = SHALLOW_DEPTH.to_string();

    loop {
        if !tokio::fs::try_exists(local).await? {
            if options.network.is_offline() {
                return Err(OpamError::offline(format!(
                    "cannot clone {remote} into {}: network access is disabled",
                    local.display()
                )));
            }
            match options.on_clone {
                Some(notify) => notify(),
                None => info!(remote, path = %local.display(), "cloning repository"),
            }
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let target = local.to_string_lossy();
            let clone_args = args([
                "clone",
                "--branch",
                branch,
                "--depth",
                depth.as_str(),
                remote,
                &*target,
            ]);
            runner.run("git", &clone_args, None).await?;
            return Ok(());
        }

        let current = runner
            .run("git", &args(["rev-parse", "--abbrev-ref", "HEAD"]), Some(local))
            .await?;
        let current = current.trim();
        if current != branch {
            warn!(
                path = %local.display(),
                current,
                expected = branch,
                "checkout is on the wrong branch, recloning"
            );
            tokio::fs::remove_dir_all(local).await?;
            continue;
        }

        if !options.force_update && options.network.trusts_cache() {
            debug!(path = %local.display(), "using existing checkout");
            return Ok(());
        }
        if options.network.is_offline() {
            return Err(OpamError::offline(format!(
                "cannot update {}: network access is disabled",
                local.display()
            )));
        }

        let local_tip = runner
            .run("git", &args(["rev-parse", "HEAD"]), Some(local))
            .await?;
        let remote_ref = format!("refs/heads/{branch}");
        let remote_out = runner
            .run("git", &args(["ls-remote", remote, remote_ref.as_str()]), None)
            .await?;
        let remote_tip = remote_out.split_whitespace().next().unwrap_or_default();

        if local_tip.trim() == remote_tip {
            debug!(path = %local.display(), tip = remote_tip, "checkout is up to date");
            return Ok(());
        }

        match options.on_update {
            Some(notify) => notify(),
            None => info!(remote, path = %local.display(), "updating repository"),
        }
        let pull_args = args(["pull", "-f", "--depth", depth.as_str(), remote, branch]);
        runner.run("git", &pull_args, Some(local)).await?;
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::MockRunner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const REMOTE: &str = "https://example.com/opam-repository.git";

    /// Fake git: `clone` creates the target, tips come from shared state.
    fn fake_git(branch: &'static str, remote_tip: Arc<Mutex<String>>) -> MockRunner {
        MockRunner::new(move |_, args, _| {
            match args[0].as_str() {
                "clone" => {
                    std::fs::create_dir_all(args.last().unwrap()).unwrap();
                    Ok(String::new())
                }
                "rev-parse" if args[1] == "--abbrev-ref" => Ok(format!("{branch}\n")),
                "rev-parse" => Ok("aaaa\n".to_string()),
                "ls-remote" => Ok(format!(
                    "{}\trefs/heads/master\n",
                    remote_tip.lock().unwrap()
                )),
                "pull" => Ok(String::new()),
                other => panic!("unexpected git {other}"),
            }
        })
    }

    #[tokio::test]
    async fn test_clone_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        let runner = fake_git("master", Arc::new(Mutex::new("aaaa".to_string())));
        let clones = AtomicUsize::new(0);
        let on_clone = || {
            clones.fetch_add(1, Ordering::SeqCst);
        };
        let options = SyncOptions {
            on_clone: Some(&on_clone),
            ..SyncOptions::default()
        };

        sync_repository(&runner, REMOTE, &local, &options).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let target = local.to_string_lossy().into_owned();
        assert_eq!(
            calls[0].args,
            args(["clone", "--branch", "master", "--depth", "1", REMOTE, target.as_str()])
        );
        assert_eq!(clones.load(Ordering::SeqCst), 1);
        assert!(local.exists());
    }

    #[tokio::test]
    async fn test_offline_without_checkout_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = fake_git("master", Arc::new(Mutex::new("aaaa".to_string())));
        let options = SyncOptions {
            network: NetworkMode::Offline,
            ..SyncOptions::default()
        };

        let err = sync_repository(&runner, REMOTE, &dir.path().join("repo"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, OpamError::Offline { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_sync_without_changes_does_not_pull() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        let runner = fake_git("master", Arc::new(Mutex::new("aaaa".to_string())));
        let options = SyncOptions::default();

        sync_repository(&runner, REMOTE, &local, &options).await.unwrap();
        runner.clear();
        sync_repository(&runner, REMOTE, &local, &options).await.unwrap();

        assert_eq!(runner.count("ls-remote"), 1);
        assert_eq!(runner.count("pull"), 0);
        assert_eq!(runner.count("clone"), 0);
    }

    #[tokio::test]
    async fn test_pulls_when_remote_moved() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        std::fs::create_dir_all(&local).unwrap();
        let runner = fake_git("master", Arc::new(Mutex::new("bbbb".to_string())));
        let updates = AtomicUsize::new(0);
        let on_update = || {
            updates.fetch_add(1, Ordering::SeqCst);
        };
        let options = SyncOptions {
            on_update: Some(&on_update),
            ..SyncOptions::default()
        };

        sync_repository(&runner, REMOTE, &local, &options).await.unwrap();

        let pull = runner
            .calls()
            .into_iter()
            .find(|c| c.args[0] == "pull")
            .unwrap();
        assert_eq!(pull.args, vec!["pull", "-f", "--depth", "1", REMOTE, "master"]);
        assert_eq!(pull.cwd.as_deref(), Some(local.as_path()));
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prefer_offline_skips_remote_check() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        std::fs::create_dir_all(&local).unwrap();
        let runner = fake_git("master", Arc::new(Mutex::new("bbbb".to_string())));
        let options = SyncOptions {
            network: NetworkMode::PreferOffline,
            ..SyncOptions::default()
        };

        sync_repository(&runner, REMOTE, &local, &options).await.unwrap();
        assert_eq!(runner.count("ls-remote"), 0);
        assert_eq!(runner.count("pull"), 0);

        // Forcing an update goes to the network even when preferring offline
        let forced = SyncOptions {
            force_update: true,
            ..options
        };
        sync_repository(&runner, REMOTE, &local, &forced).await.unwrap();
        assert_eq!(runner.count("pull"), 1);
    }

    #[tokio::test]
    async fn test_offline_forced_update_fails() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        std::fs::create_dir_all(&local).unwrap();
        let runner = fake_git("master", Arc::new(Mutex::new("aaaa".to_string())));
        let options = SyncOptions {
            network: NetworkMode::Offline,
            force_update: true,
            ..SyncOptions::default()
        };

        let err = sync_repository(&runner, REMOTE, &local, &options)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::codes::OPAM_OFFLINE);
    }

    #[tokio::test]
    async fn test_branch_mismatch_reclones() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("repo");
        std::fs::create_dir_all(local.join("stale")).unwrap();
        let runner = fake_git("old-branch", Arc::new(Mutex::new("aaaa".to_string())));

        sync_repository(&runner, REMOTE, &local, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(runner.count("clone"), 1);
        assert!(local.exists());
        assert!(!local.join("stale").exists());
    }

    #[tokio::test]
    async fn test_git_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|program, _, _| {
            Err(OpamError::ProcessExecution {
                command: program.to_string(),
                code: Some(128),
                stderr: "fatal: repository not found".to_string(),
            })
        });

        let err = sync_repository(
            &runner,
            REMOTE,
            &dir.path().join("repo"),
            &SyncOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("repository not found"));
    }
}
