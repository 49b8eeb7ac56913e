//! Per-submission workspaces.
//!
//! A workspace is a host directory tree with a fixed schema, created when a
//! submission is pulled and removed when its pipeline finishes. In debug mode
//! an anomalous workspace is archived instead of deleted.

use std::io;
use std::path::{Path, PathBuf};

use err_derive::Error;
use futures::future::BoxFuture;
use futures::prelude::*;
use tokio::fs;
use tracing::{debug, error};

use crate::util::path_security;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(display = "workspace root {} is not a writable directory: {}", root, source)]
    BadRoot {
        root: String,
        #[error(source)]
        source: io::Error,
    },

    #[error(display = "path escapes the workspace: {}", _0)]
    Escape(String),

    #[error(display = "filesystem error: {}", _0)]
    Io(#[error(source)] io::Error),
}

/// Subdirectories of every workspace.
///
/// `submission/` holds unpacked student sources, `problem/` the test inputs
/// and expected outputs, `lib/` auxiliary files staged for compilation,
/// `build/` compiler output, `run/` per-test scratch space and `logs/` the
/// captured stage logs.
pub const SUBDIRS: [&str; 6] = ["submission", "problem", "lib", "build", "run", "logs"];

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates the directory skeleton for one submission under `root`.
    /// A stale directory with the same id is wiped first.
    pub async fn acquire(root: &Path, id: &str) -> Result<Workspace, WorkspaceError> {
        let dir = path_security::safe_join(root, id)
            .map_err(|e| WorkspaceError::Escape(e.to_string()))?;
        ensure_removed_dir(&dir).await?;
        fs::create_dir_all(&dir).await.map_err(|e| WorkspaceError::BadRoot {
            root: root.display().to_string(),
            source: e,
        })?;
        for sub in SUBDIRS {
            fs::create_dir(dir.join(sub)).await?;
        }
        debug!(workspace = %dir.display(), "workspace acquired");
        Ok(Workspace { root: dir })
    }

    /// Deletes the workspace, or moves it aside as `<id>_debug` when
    /// `keep_for_debug` is set. A previous debug archive with the same name
    /// is replaced.
    pub async fn release(self, keep_for_debug: bool) -> Result<(), WorkspaceError> {
        if keep_for_debug {
            let mut archived = self.root.as_os_str().to_owned();
            archived.push("_debug");
            let archived = PathBuf::from(archived);
            ensure_removed_dir(&archived).await?;
            fs::rename(&self.root, &archived).await?;
            debug!(archive = %archived.display(), "workspace archived for debugging");
        } else {
            ensure_removed_dir(&self.root).await?;
            debug!(workspace = %self.root.display(), "workspace released");
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn submission_dir(&self) -> PathBuf {
        self.root.join("submission")
    }

    pub fn problem_dir(&self) -> PathBuf {
        self.root.join("problem")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Scratch directory of one test under `run/`.
    pub fn test_run_dir(&self, test_name: &str) -> Result<PathBuf, WorkspaceError> {
        path_security::safe_join(&self.run_dir(), test_name)
            .map_err(|e| WorkspaceError::Escape(e.to_string()))
    }

    /// Containment-checked join of an untrusted file name onto a workspace
    /// subdirectory; verifies no symlinked ancestor sits between the root
    /// and the final path.
    pub async fn resolve(&self, subdir: &str, name: &str) -> Result<PathBuf, WorkspaceError> {
        debug_assert!(SUBDIRS.contains(&subdir));
        let base = self.root.join(subdir);
        let path = path_security::safe_join(&base, name)
            .map_err(|e| WorkspaceError::Escape(e.to_string()))?;
        path_security::assert_no_symlink_within(&self.root, path.parent().unwrap_or(&base))
            .await
            .map_err(|e| WorkspaceError::Escape(e.to_string()))?;
        Ok(path)
    }
}

/// Removes a directory tree, clearing read-only bits that would otherwise
/// make the removal fail. Missing directories are fine.
pub fn ensure_removed_dir(path: &Path) -> BoxFuture<'_, Result<(), WorkspaceError>> {
    async move {
        let entries = match fs::read_dir(path).await {
            Ok(dir) => tokio_stream::wrappers::ReadDirStream::new(dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        entries
            .filter_map(|entry| async move {
                let entry = entry.ok()?;
                let metadata = entry.metadata().await.ok()?;
                let mut permissions = metadata.permissions();
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), permissions).await;
                metadata.file_type().is_dir().then(|| entry.path())
            })
            .map(|dir| async move { ensure_removed_dir(&dir).await })
            .buffered(16usize)
            .for_each(|_| async {})
            .await;
        fs::remove_dir_all(path).await.map_err(|e| {
            error!(path = %path.display(), "cannot remove directory: {}", e);
            e.into()
        })
    }
    .boxed()
}

/// Startup probe: the workspace root must exist (created if missing) and be
/// writable by this process.
pub async fn assert_writable_root(root: &Path) -> Result<(), WorkspaceError> {
    let bad_root = |source: io::Error| WorkspaceError::BadRoot {
        root: root.display().to_string(),
        source,
    };
    fs::create_dir_all(root).await.map_err(bad_root)?;
    let probe = root.join(".write-probe");
    fs::write(&probe, b"probe").await.map_err(bad_root)?;
    fs::remove_file(&probe).await.map_err(bad_root)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_the_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(tmp.path(), "sub-1").await.unwrap();
        for sub in SUBDIRS {
            assert!(ws.root().join(sub).is_dir(), "{} missing", sub);
        }
        ws.release(false).await.unwrap();
        assert!(!tmp.path().join("sub-1").exists());
    }

    #[tokio::test]
    async fn release_keep_for_debug_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(tmp.path(), "sub-2").await.unwrap();
        tokio::fs::write(ws.logs_dir().join("worker.log"), b"log").await.unwrap();
        ws.release(true).await.unwrap();
        assert!(!tmp.path().join("sub-2").exists());
        assert!(tmp.path().join("sub-2_debug/logs/worker.log").is_file());
    }

    #[tokio::test]
    async fn resolve_rejects_escaping_names() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(tmp.path(), "sub-3").await.unwrap();
        assert!(matches!(
            ws.resolve("problem", "../../etc/passwd").await,
            Err(WorkspaceError::Escape(_))
        ));
        assert!(matches!(
            ws.resolve("problem", "/etc/passwd").await,
            Err(WorkspaceError::Escape(_))
        ));
        let ok = ws.resolve("problem", "t1.in").await.unwrap();
        assert!(ok.starts_with(ws.root()));
        ws.release(false).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_rejects_escaping_ids() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            Workspace::acquire(tmp.path(), "../evil").await,
            Err(WorkspaceError::Escape(_))
        ));
    }
}
