//! Ephemeral workspace management.
//!
//! Every step runs in its own directory under the workspace root, one per
//! `(run, step)`; matrix workers get `worker-<index>` directories under
//! their parent step's workspace. The source repository is never modified
//! in place: read-only mounts are symlinked, read-write mounts are copied
//! in. Workspaces persist until an explicit `clean` so failure forensics
//! stay possible.
//!
//! Lifecycle: create -> mount/inject -> (adapter runs) -> register
//! outputs -> stay on disk -> explicit clean.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::WaveError;
use crate::manifest::SkillMount;
use crate::pipeline::{ArtifactInjection, Mount, MountAccess, WorkspaceConfig};
use crate::types::RunId;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    /// Root for all workspaces, `.wave/workspaces` by default.
    root: PathBuf,
    /// Project root mount sources resolve against.
    project_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            project_root: project_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one `(run, step)`.
    pub fn step_dir(&self, run_id: &RunId, step_id: &str) -> PathBuf {
        self.root.join(run_id.as_str()).join(step_id)
    }

    /// Sibling directory for one matrix worker, named by index.
    pub fn worker_dir(&self, run_id: &RunId, step_id: &str, index: usize) -> PathBuf {
        self.step_dir(run_id, step_id).join(format!("worker-{index}"))
    }

    /// Create the step workspace and apply its mounts and the project's
    /// skill mounts. Idempotent so retries and relay restarts reuse the
    /// same directory.
    pub fn prepare(
        &self,
        run_id: &RunId,
        step_id: &str,
        config: &WorkspaceConfig,
        skill_mounts: &[SkillMount],
    ) -> Result<PathBuf, WaveError> {
        let dir = self.step_dir(run_id, step_id);
        self.prepare_at(&dir, config, skill_mounts)?;
        Ok(dir)
    }

    /// Create a matrix worker workspace with the parent step's mounts.
    pub fn prepare_worker(
        &self,
        run_id: &RunId,
        step_id: &str,
        index: usize,
        config: &WorkspaceConfig,
        skill_mounts: &[SkillMount],
    ) -> Result<PathBuf, WaveError> {
        let dir = self.worker_dir(run_id, step_id, index);
        self.prepare_at(&dir, config, skill_mounts)?;
        Ok(dir)
    }

    fn prepare_at(
        &self,
        dir: &Path,
        config: &WorkspaceConfig,
        skill_mounts: &[SkillMount],
    ) -> Result<(), WaveError> {
        fs::create_dir_all(dir)
            .map_err(|e| WaveError::workspace(format!("create {}: {e}", dir.display())))?;

        for mount in &config.mounts {
            self.apply_mount(dir, mount)?;
        }
        for skill in skill_mounts {
            let target = dir.join(".wave-skills").join(&skill.name);
            let source = self.resolve_source(&skill.path);
            link_readonly(&source, &target)?;
        }
        Ok(())
    }

    fn resolve_source(&self, source: &Path) -> PathBuf {
        if source.is_absolute() {
            source.to_path_buf()
        } else {
            self.project_root.join(source)
        }
    }

    fn apply_mount(&self, workspace: &Path, mount: &Mount) -> Result<(), WaveError> {
        let source = self.resolve_source(&mount.source);
        if !source.exists() {
            return Err(WaveError::workspace(format!(
                "mount source not found: {}",
                source.display()
            )));
        }

        let target_name = match &mount.target {
            Some(name) => name.clone(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    WaveError::workspace(format!(
                        "mount source has no file name: {}",
                        source.display()
                    ))
                })?,
        };
        let target = workspace.join(&target_name);
        ensure_inside(workspace, &target)?;

        match mount.access {
            MountAccess::Ro => link_readonly(&source, &target),
            MountAccess::Rw => copy_recursive(&source, &target),
        }
    }

    /// Materialize an upstream artifact inside the workspace before the
    /// adapter starts.
    pub fn inject_artifact(
        &self,
        workspace: &Path,
        source: &Path,
        injection: &ArtifactInjection,
    ) -> Result<PathBuf, WaveError> {
        if !source.exists() {
            return Err(WaveError::workspace(format!(
                "artifact '{}' missing at {}",
                injection.artifact,
                source.display()
            )));
        }
        let target = workspace.join(injection.target_path());
        ensure_inside(workspace, &target)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WaveError::workspace(format!("create {}: {e}", parent.display())))?;
        }
        copy_recursive(source, &target)?;
        Ok(target)
    }

    /// Runs that currently have workspaces on disk, newest-name first.
    pub fn list_runs(&self) -> Result<Vec<String>, WaveError> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort_unstable_by(|a, b| b.cmp(a));
        Ok(runs)
    }

    /// Delete one run's workspaces. Only `clean` calls this; nothing is
    /// ever auto-deleted on step completion.
    pub fn remove_run(&self, run_id: &str) -> Result<(), WaveError> {
        let dir = self.root.join(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| WaveError::workspace(format!("remove {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

/// Refuse targets that escape the workspace (`..` in declared paths).
fn ensure_inside(workspace: &Path, target: &Path) -> Result<(), WaveError> {
    let mut depth: i64 = 0;
    for component in target
        .strip_prefix(workspace)
        .unwrap_or(target)
        .components()
    {
        use std::path::Component;
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(WaveError::workspace(format!(
                "path escapes workspace: {}",
                target.display()
            )));
        }
    }
    Ok(())
}

fn link_readonly(source: &Path, target: &Path) -> Result<(), WaveError> {
    if target.exists() || target.is_symlink() {
        return Ok(()); // already mounted on a previous attempt
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| WaveError::workspace(format!("create {}: {e}", parent.display())))?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(source, target).map_err(|e| {
        WaveError::workspace(format!(
            "symlink {} -> {}: {e}",
            source.display(),
            target.display()
        ))
    })?;
    #[cfg(not(unix))]
    copy_recursive(source, target)?;
    Ok(())
}

fn copy_recursive(source: &Path, target: &Path) -> Result<(), WaveError> {
    let copy_err = |e: std::io::Error, path: &Path| {
        WaveError::workspace(format!("copy {}: {e}", path.display()))
    };

    if source.is_file() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| copy_err(e, parent))?;
        }
        fs::copy(source, target).map_err(|e| copy_err(e, source))?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| WaveError::workspace(format!("walk: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| WaveError::workspace(format!("strip prefix: {e}")))?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| copy_err(e, &dest))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| copy_err(e, parent))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| copy_err(e, entry.path()))?;
        }
    }
    Ok(())
}
