//! Containment checks for paths written on behalf of a submission.
//!
//! Everything the worker writes during one submission must stay inside that
//! submission's workspace. Archive entries and problem file names come from
//! the outside world, so they are validated here before any filesystem
//! operation happens.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

/// Checks that `path` is relative and never navigates above its starting
/// point. Returns `Err` if it is absolute, has a drive prefix, or any `..`
/// sequence escapes upwards.
pub fn assert_relative_inside(path: &Path) -> io::Result<()> {
    let mut depth: i64 = 0;
    for part in path.components() {
        match part {
            Component::Prefix(_) | Component::RootDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "path {} is absolute, which is not allowed",
                        path.to_string_lossy()
                    ),
                ));
            }
            Component::CurDir => {}
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
        }
        if depth < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "path {} navigates into its parent, which is not allowed",
                    path.to_string_lossy()
                ),
            ));
        }
    }
    Ok(())
}

/// Joins an untrusted `name` onto `root`, refusing names that would land
/// outside `root`.
pub fn safe_join(root: &Path, name: impl AsRef<Path>) -> io::Result<PathBuf> {
    let name = name.as_ref();
    assert_relative_inside(name)?;
    Ok(root.join(name))
}

/// Checks that no ancestor of `path`, up to and including `root`, is a
/// symbolic link. Paths that do not exist yet are fine.
pub async fn assert_no_symlink_within(root: &Path, path: &Path) -> io::Result<()> {
    for ancestor in path.ancestors() {
        assert_not_symlink(ancestor).await?;
        if ancestor == root {
            break;
        }
    }
    Ok(())
}

async fn assert_not_symlink(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            warn!(path = %path.to_string_lossy(), "cannot stat path while checking for symlinks: {}", e);
            return Ok(());
        }
        Ok(m) => m,
    };
    if metadata.file_type().is_symlink() {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {} is a symbolic link", path.to_string_lossy()),
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_paths_pass() {
        assert_relative_inside("main.c".as_ref()).unwrap();
        assert_relative_inside("./main.c".as_ref()).unwrap();
        assert_relative_inside("src/lib/queue.h".as_ref()).unwrap();
        assert_relative_inside("src/a/../b/queue.h".as_ref()).unwrap();
    }

    #[test]
    fn escaping_paths_fail() {
        assert_relative_inside("/etc/passwd".as_ref()).unwrap_err();
        assert_relative_inside("../secret".as_ref()).unwrap_err();
        assert_relative_inside("a/../../secret".as_ref()).unwrap_err();
        assert_relative_inside("./a/../../b".as_ref()).unwrap_err();
    }

    #[test]
    fn safe_join_keeps_root() {
        let joined = safe_join("/work/sub".as_ref(), "tests/t1.in").unwrap();
        assert_eq!(joined, PathBuf::from("/work/sub/tests/t1.in"));
        safe_join("/work/sub".as_ref(), "../other").unwrap_err();
    }
}
