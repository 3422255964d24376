//! Sandbox manager: isolated copies of the target project.
//!
//! One persistent *workspace* sandbox per run holds the evolving test
//! suite; ephemeral *target* sandboxes exist for a single mutant evaluation
//! and are removed on all exit paths via a scoped guard. Mutations never
//! touch the workspace.

use crate::error::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories never copied into a sandbox.
const IGNORED_DIRS: [&str; 5] = ["target", ".git", ".idea", "node_modules", "__pycache__"];

/// File extensions never copied into a sandbox.
const IGNORED_EXTENSIONS: [&str; 2] = ["class", "pyc"];

const WORKSPACE_DIR: &str = "workspace";
const TARGET_SANDBOX_PREFIX: &str = "mutant_";

/// Creates and tracks sandboxes under a single root directory.
#[derive(Clone)]
pub struct SandboxManager {
    root: PathBuf,
}

/// The persistent per-run project copy.
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// An ephemeral per-mutant project copy. Removing the directory happens in
/// `Drop`, so every exit path (including panics and early returns) cleans
/// up.
#[derive(Debug)]
pub struct TargetSandbox {
    path: PathBuf,
}

impl TargetSandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetSandbox {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if self.path.exists() {
                tracing::warn!(
                    "failed to clean target sandbox {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::new(ErrorKind::SandboxIo, format!("sandbox root: {e}")))?;
        Ok(Self { root })
    }

    /// Create the workspace sandbox, replacing any leftover from a previous
    /// run at the same root.
    pub async fn create_workspace(&self, project_path: &Path) -> Result<Workspace> {
        let workspace_path = self.root.join(WORKSPACE_DIR);
        if workspace_path.exists() {
            tracing::warn!("replacing existing workspace at {}", workspace_path.display());
            tokio::fs::remove_dir_all(&workspace_path).await?;
        }

        copy_tree(project_path.to_path_buf(), workspace_path.clone()).await?;
        tracing::info!("workspace sandbox created at {}", workspace_path.display());
        Ok(Workspace {
            path: workspace_path,
        })
    }

    /// Reopen an existing workspace (resume path).
    pub fn open_workspace(&self) -> Result<Workspace> {
        let workspace_path = self.root.join(WORKSPACE_DIR);
        if !workspace_path.is_dir() {
            return Err(Error::new(
                ErrorKind::SandboxIo,
                format!("no workspace sandbox at {}", workspace_path.display()),
            ));
        }
        Ok(Workspace {
            path: workspace_path,
        })
    }

    /// Copy the workspace into a fresh sandbox named after the mutant.
    pub async fn acquire_target_sandbox(
        &self,
        workspace: &Workspace,
        mutant_id: i64,
    ) -> Result<TargetSandbox> {
        self.acquire_named_sandbox(workspace, &format!("{TARGET_SANDBOX_PREFIX}{mutant_id}"))
            .await
    }

    /// Copy the workspace into a fresh sandbox with an arbitrary unique
    /// name (preprocessing workers).
    pub async fn acquire_named_sandbox(
        &self,
        workspace: &Workspace,
        name: &str,
    ) -> Result<TargetSandbox> {
        let path = self.root.join(name);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }

        copy_tree(workspace.path().to_path_buf(), path.clone()).await?;
        Ok(TargetSandbox { path })
    }

    /// Count of ephemeral sandboxes currently on disk. Zero at steady state
    /// between rounds.
    pub fn target_sandbox_count(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy() != WORKSPACE_DIR)
                    .filter(|e| e.path().is_dir())
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Recursive copy skipping build output and VCS directories. Runs on the
/// blocking pool; project trees can be large.
async fn copy_tree(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst))
        .await
        .map_err(|e| Error::new(ErrorKind::SandboxIo, format!("copy task: {e}")))?
}

fn copy_tree_blocking(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::new(
            ErrorKind::SandboxIo,
            format!("source is not a directory: {}", src.display()),
        ));
    }

    for entry in WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| !is_ignored(e.path()))
    {
        let entry =
            entry.map_err(|e| Error::new(ErrorKind::SandboxIo, format!("walk: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::new(ErrorKind::SandboxIo, format!("strip prefix: {e}")))?;
        let destination = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &destination)?;
        }
    }

    Ok(())
}

fn is_ignored(path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if path.is_dir() && IGNORED_DIRS.contains(&name) {
            return true;
        }
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if IGNORED_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_project(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("src/main/java/com/example")).unwrap();
        std::fs::create_dir_all(root.join("src/test/java")).unwrap();
        std::fs::create_dir_all(root.join("target/classes")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("pom.xml"), "<project/>").unwrap();
        std::fs::write(
            root.join("src/main/java/com/example/Calculator.java"),
            "public class Calculator {}",
        )
        .unwrap();
        std::fs::write(root.join("target/classes/Calculator.class"), "junk").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        root
    }

    #[tokio::test]
    async fn test_workspace_copy_skips_ignored() {
        let dir = TempDir::new().unwrap();
        let project = fake_project(&dir);
        let manager = SandboxManager::new(dir.path().join("sandbox")).unwrap();

        let workspace = manager.create_workspace(&project).await.unwrap();
        assert!(workspace.path().join("pom.xml").exists());
        assert!(workspace
            .path()
            .join("src/main/java/com/example/Calculator.java")
            .exists());
        assert!(!workspace.path().join("target").exists());
        assert!(!workspace.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_target_sandbox_cleaned_on_drop() {
        let dir = TempDir::new().unwrap();
        let project = fake_project(&dir);
        let manager = SandboxManager::new(dir.path().join("sandbox")).unwrap();
        let workspace = manager.create_workspace(&project).await.unwrap();

        let sandbox_path;
        {
            let sandbox = manager
                .acquire_target_sandbox(&workspace, 7)
                .await
                .unwrap();
            sandbox_path = sandbox.path().to_path_buf();
            assert!(sandbox_path.join("pom.xml").exists());
            assert!(sandbox_path.ends_with("mutant_7"));
            assert_eq!(manager.target_sandbox_count(), 1);
        }

        assert!(!sandbox_path.exists());
        assert_eq!(manager.target_sandbox_count(), 0);
    }

    #[tokio::test]
    async fn test_mutating_sandbox_leaves_workspace_untouched() {
        let dir = TempDir::new().unwrap();
        let project = fake_project(&dir);
        let manager = SandboxManager::new(dir.path().join("sandbox")).unwrap();
        let workspace = manager.create_workspace(&project).await.unwrap();

        let sandbox = manager
            .acquire_target_sandbox(&workspace, 1)
            .await
            .unwrap();
        let mutated = sandbox
            .path()
            .join("src/main/java/com/example/Calculator.java");
        std::fs::write(&mutated, "public class Calculator { /* mutated */ }").unwrap();

        let original = std::fs::read_to_string(
            workspace
                .path()
                .join("src/main/java/com/example/Calculator.java"),
        )
        .unwrap();
        assert_eq!(original, "public class Calculator {}");
    }

    #[tokio::test]
    async fn test_open_workspace_requires_existing() {
        let dir = TempDir::new().unwrap();
        let manager = SandboxManager::new(dir.path().join("sandbox")).unwrap();
        assert!(manager.open_workspace().is_err());

        let project = fake_project(&dir);
        manager.create_workspace(&project).await.unwrap();
        assert!(manager.open_workspace().is_ok());
    }

    #[tokio::test]
    async fn test_sandbox_names_unique_per_mutant() {
        let dir = TempDir::new().unwrap();
        let project = fake_project(&dir);
        let manager = SandboxManager::new(dir.path().join("sandbox")).unwrap();
        let workspace = manager.create_workspace(&project).await.unwrap();

        let a = manager.acquire_target_sandbox(&workspace, 1).await.unwrap();
        let b = manager.acquire_target_sandbox(&workspace, 2).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(manager.target_sandbox_count(), 2);
    }
}
