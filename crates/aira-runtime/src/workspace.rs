//! Per-session git working trees on a shared repository volume.
//!
//! One volume per project holds a single clone. Every session gets its own
//! working tree under `<mount>/.worktrees/<branch>` on a fresh branch, so
//! concurrent sessions never check out over each other. All git commands
//! run in short-lived helper containers that mount the volume.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{ContainerRuntime, CreateOptions, collect_logs};
use crate::error::{Result, RuntimeError};

#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Idempotent; an existing volume is reused.
    async fn ensure_volume(&self, volume: &str) -> Result<()>;

    /// Clone into the volume unless it already holds a repository.
    async fn clone_repo(&self, volume: &str, repo_url: &str) -> Result<()>;

    async fn fetch(&self, volume: &str) -> Result<()>;

    /// Add a working tree on a new `branch` created from `base`; returns
    /// its path inside the mount.
    async fn create_working_tree(&self, volume: &str, branch: &str, base: &str)
    -> Result<String>;

    async fn remove_working_tree(&self, volume: &str, branch: &str) -> Result<()>;

    /// Diff of the branch's working tree against `base`.
    async fn diff(&self, volume: &str, branch: &str, base: &str) -> Result<String>;

    fn mount_path(&self) -> &str;
}

/// Output of a finished helper command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub code: i64,
    pub output: String,
}

pub struct GitWorkspace {
    runtime: Arc<dyn ContainerRuntime>,
    helper_image: String,
    mount_path: String,
}

impl GitWorkspace {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, helper_image: &str, mount_path: &str) -> Self {
        Self {
            runtime,
            helper_image: helper_image.to_string(),
            mount_path: mount_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn tree_path(&self, branch: &str) -> String {
        format!("{}/.worktrees/{}", self.mount_path, branch)
    }

    /// Run `git <args>` in a helper container and return its exit code and
    /// combined output. The helper is removed whatever the outcome.
    async fn run_git(&self, volume: &str, args: &[String]) -> Result<GitOutput> {
        let opts = CreateOptions {
            session_id: format!("git-{}", Uuid::new_v4()),
            image: self.helper_image.clone(),
            volume_name: volume.to_string(),
            mount_path: self.mount_path.clone(),
            work_dir: self.mount_path.clone(),
            branch_name: String::new(),
            entrypoint: Some(vec!["git".to_string()]),
            cmd: args.to_vec(),
            network_mode: Some("bridge".to_string()),
            ..CreateOptions::default()
        };

        let id = self.runtime.create(&opts).await?;
        let result = self.run_helper(&id).await;
        if let Err(e) = self.runtime.remove(&id).await {
            warn!(container_id = %id, "failed to remove git helper: {}", e);
        }
        result
    }

    async fn run_helper(&self, id: &str) -> Result<GitOutput> {
        self.runtime.start(id).await?;
        let code = self.runtime.wait(id).await?;
        let output = collect_logs(self.runtime.stream_logs(id).await?).await;
        Ok(GitOutput { code, output })
    }

    /// Like [`run_git`](Self::run_git) but a non-zero exit is an error.
    async fn git(&self, volume: &str, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        debug!(volume, args = ?args, "git");
        let out = self.run_git(volume, &args).await?;
        if out.code != 0 {
            return Err(RuntimeError::GitCommandFailed {
                command: args.first().cloned().unwrap_or_default(),
                code: out.code,
                output: out.output.trim().to_string(),
            });
        }
        Ok(out.output)
    }
}

#[async_trait]
impl WorkspaceManager for GitWorkspace {
    async fn ensure_volume(&self, volume: &str) -> Result<()> {
        self.runtime.create_volume(volume).await
    }

    async fn clone_repo(&self, volume: &str, repo_url: &str) -> Result<()> {
        let probe = self
            .run_git(
                volume,
                &[
                    "-C".to_string(),
                    self.mount_path.clone(),
                    "rev-parse".to_string(),
                    "--git-dir".to_string(),
                ],
            )
            .await?;
        if probe.code == 0 {
            debug!(volume, "repository already present, skipping clone");
            return Ok(());
        }

        info!(volume, repo_url, "cloning repository");
        self.git(volume, &["clone", repo_url, &self.mount_path])
            .await?;
        Ok(())
    }

    async fn fetch(&self, volume: &str) -> Result<()> {
        self.git(volume, &["-C", &self.mount_path, "fetch", "--all", "--prune"])
            .await?;
        Ok(())
    }

    async fn create_working_tree(
        &self,
        volume: &str,
        branch: &str,
        base: &str,
    ) -> Result<String> {
        let path = self.tree_path(branch);
        self.git(
            volume,
            &["-C", &self.mount_path, "worktree", "add", "-b", branch, &path, base],
        )
        .await?;
        info!(volume, branch, base, path = %path, "working tree created");
        Ok(path)
    }

    async fn remove_working_tree(&self, volume: &str, branch: &str) -> Result<()> {
        let path = self.tree_path(branch);
        self.git(
            volume,
            &["-C", &self.mount_path, "worktree", "remove", "--force", &path],
        )
        .await?;
        Ok(())
    }

    async fn diff(&self, volume: &str, branch: &str, base: &str) -> Result<String> {
        let path = self.tree_path(branch);
        self.git(volume, &["-C", &path, "diff", base]).await
    }

    fn mount_path(&self) -> &str {
        &self.mount_path
    }
}
