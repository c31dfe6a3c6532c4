//! Builtin operation: clone a repository, add one file, commit it.
//!
//! The version-control tool is reached only through
//! [`VersionControlClient`]. [`GitCli`] drives the `git` binary; tests
//! substitute a mock.
//!
//! The clone happens in a staging directory next to the target and is
//! renamed onto the target only after the commit is verified in the log,
//! so a failed step never leaves a half-built repository behind.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::VcsConfig;
use crate::error::{OperationError, Result, VcsStep};
use crate::operations::{required_str, Artifact, Operation, OperationKind};
use crate::sandbox::Sandbox;

/// Name of the repository metadata directory.
const METADATA_DIR: &str = ".git";

/// Narrow capability over an external version-control tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionControlClient: Send + Sync {
    /// Clones `source` into `dest`, which must not exist yet.
    async fn clone_repo(&self, source: &str, dest: &Path) -> Result<()>;

    /// Stages `file_name` (relative to `repo`) and commits it.
    async fn commit_file(&self, repo: &Path, file_name: &str, message: &str) -> Result<()>;

    /// Full commit messages of the checked-out branch, newest first.
    async fn log(&self, repo: &Path) -> Result<String>;
}

/// [`VersionControlClient`] backed by the `git` command line.
pub struct GitCli {
    program: String,
    author_name: String,
    author_email: String,
}

impl GitCli {
    pub fn new(config: &VcsConfig) -> Self {
        Self {
            program: config.program.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    /// Runs one git invocation and returns its stdout. Non-zero exit is
    /// `SubprocessFailed` for `step`.
    async fn run<I, S>(&self, step: VcsStep, repo: Option<&Path>, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email));
        if let Some(dir) = repo {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null());

        let output = cmd
            .output()
            .await
            .map_err(|e| OperationError::SubprocessFailed {
                step,
                reason: format!("failed to spawn {}: {e}", self.program),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OperationError::SubprocessFailed {
                step,
                reason: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VersionControlClient for GitCli {
    async fn clone_repo(&self, source: &str, dest: &Path) -> Result<()> {
        self.run(
            VcsStep::Clone,
            None,
            [OsStr::new("clone"), OsStr::new("--"), OsStr::new(source), dest.as_os_str()],
        )
        .await
        .map(|_| ())
    }

    async fn commit_file(&self, repo: &Path, file_name: &str, message: &str) -> Result<()> {
        self.run(VcsStep::Add, Some(repo), ["add", "--", file_name]).await?;
        self.run(VcsStep::Commit, Some(repo), ["commit", "-m", message]).await?;
        Ok(())
    }

    async fn log(&self, repo: &Path) -> Result<String> {
        self.run(VcsStep::Log, Some(repo), ["log", "--format=%B"]).await
    }
}

/// Checks that `file_name` is a plain relative path that stays inside the
/// working tree and does not touch repository metadata.
fn validate_file_name(file_name: &str) -> Result<PathBuf> {
    let normalized = file_name.replace('\\', "/");
    let path = Path::new(&normalized);
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => relative.push(name),
            Component::CurDir => {}
            _ => {
                return Err(OperationError::InvalidParameters(format!(
                    "fileName must be a relative path inside the repository, got {file_name}"
                )))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(OperationError::InvalidParameters(
            "fileName must not be empty".to_string(),
        ));
    }
    if relative.starts_with(METADATA_DIR) {
        return Err(OperationError::InvalidParameters(format!(
            "fileName must not point into {METADATA_DIR}"
        )));
    }
    Ok(relative)
}

fn write_failed(e: impl std::fmt::Display) -> OperationError {
    OperationError::SubprocessFailed {
        step: VcsStep::Write,
        reason: e.to_string(),
    }
}

/// `VersionControlCommit`: clone `repoUrl` into `targetDir`, write
/// `fileName` with `fileContent`, and commit it with `commitMessage`.
pub struct VcsCommitOperation {
    sandbox: Arc<Sandbox>,
    client: Arc<dyn VersionControlClient>,
}

impl VcsCommitOperation {
    pub fn new(sandbox: Arc<Sandbox>, client: Arc<dyn VersionControlClient>) -> Self {
        Self { sandbox, client }
    }
}

#[async_trait]
impl Operation for VcsCommitOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::VersionControlCommit
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let repo_url = required_str(params, "repoUrl")?;
        let target_dir = required_str(params, "targetDir")?;
        let file_name = required_str(params, "fileName")?;
        let file_content = required_str(params, "fileContent")?;
        let message = required_str(params, "commitMessage")?;
        let relative = validate_file_name(file_name)?;

        // Reading from an external repository is this operation's contract;
        // only the destination is confined.
        let source = repo_url.strip_prefix("file://").unwrap_or(repo_url);
        let target = self.sandbox.admit(target_dir)?;
        let target_str = target.as_path().to_string_lossy().into_owned();
        self.sandbox
            .admit(&format!("{target_str}/{}", relative.display()))?;

        let target_path = target.as_path();
        if tokio::fs::symlink_metadata(target_path).await.is_ok()
            && !is_empty_dir(target_path).await
        {
            return Err(OperationError::SubprocessFailed {
                step: VcsStep::Clone,
                reason: format!(
                    "destination {} already exists and is not an empty directory",
                    target_path.display()
                ),
            });
        }

        let parent = target_path
            .parent()
            .ok_or_else(|| write_failed("target has no parent directory"))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await.map_err(write_failed)?;
        let staging = tempfile::Builder::new()
            .prefix(".taskbox-clone-")
            .tempdir_in(&parent)
            .map_err(write_failed)?;
        let work = staging.path().join("repo");

        info!("Cloning {source} into {}", target_path.display());
        self.client.clone_repo(source, &work).await?;
        if !work.join(METADATA_DIR).is_dir() {
            return Err(OperationError::SubprocessFailed {
                step: VcsStep::Clone,
                reason: format!("clone produced no {METADATA_DIR} directory"),
            });
        }

        // The working tree now holds untrusted content; a committed symlink
        // must not redirect the write.
        reject_symlinks(&work, &relative, self.sandbox.root()).await?;
        let file_path = self
            .sandbox
            .admit(&work.join(&relative).to_string_lossy())?
            .into_path_buf();
        if let Some(dir) = file_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(write_failed)?;
        }
        tokio::fs::write(&file_path, file_content)
            .await
            .map_err(write_failed)?;
        debug!("Wrote {} ({} bytes)", relative.display(), file_content.len());

        let relative_str = relative.to_string_lossy();
        self.client.commit_file(&work, &relative_str, message).await?;

        let log = self.client.log(&work).await?;
        if !normalize_message(&log).contains(&normalize_message(message)) {
            return Err(OperationError::SubprocessFailed {
                step: VcsStep::Log,
                reason: "commit message not found in repository history".to_string(),
            });
        }

        tokio::fs::rename(&work, target_path)
            .await
            .map_err(|e| OperationError::Write(format!("{}: {e}", target_path.display())))?;
        info!("Committed {} in {}", relative.display(), target_path.display());

        Ok(Artifact::file(target.into_path_buf()))
    }
}

/// Fails if any existing component of `relative` under `work` is a
/// symlink. Checked after the clone, before anything is written.
async fn reject_symlinks(work: &Path, relative: &Path, root: &Path) -> Result<()> {
    let mut current = work.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(OperationError::OutOfBoundsPath {
                    path: relative.to_path_buf(),
                    root: root.to_path_buf(),
                })
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

/// Applies git's whitespace cleanup for `-m` messages: trailing
/// whitespace removed, blank runs collapsed, edge blank lines dropped.
fn normalize_message(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() && matches!(lines.last(), None | Some(&"")) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

async fn is_empty_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}
