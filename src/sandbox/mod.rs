//! Confinement guard.
//!
//! Every path an operation writes to goes through [`Sandbox::admit`]
//! before any I/O happens. A path is admitted only if, after separator
//! normalization, `.`/`..` resolution and symlink resolution, it lies
//! beneath the confinement root.
//!
//! The root is canonicalized once when the sandbox is built and never
//! changes afterwards. Handlers receive the sandbox at construction
//! time, so tests can run any number of independent roots side by side.

mod atomic;

pub use atomic::{write_atomic, write_atomic_blocking};

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{OperationError, Result};

/// A destination that passed the confinement check.
///
/// Only [`Sandbox::admit`] constructs these, so holding one is proof the
/// location is strictly beneath the root and so is its parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedPath(PathBuf);

impl AdmittedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for AdmittedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// The confinement root plus the read-side policy.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    confine_sources: bool,
}

impl Sandbox {
    /// Builds a sandbox rooted at `root`, which must already exist.
    ///
    /// Source paths are confined by default; see
    /// [`with_source_confinement`](Self::with_source_confinement).
    pub fn new(root: &Path) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("confinement root {} is not a directory", root.display()),
            ));
        }
        Ok(Self {
            root,
            confine_sources: true,
        })
    }

    /// When disabled, [`admit_source`](Self::admit_source) only normalizes.
    pub fn with_source_confinement(mut self, confine: bool) -> Self {
        self.confine_sources = confine;
        self
    }

    /// The canonical confinement root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn confines_sources(&self) -> bool {
        self.confine_sources
    }

    /// Checks that `raw` resolves to the root or somewhere beneath it.
    ///
    /// Relative paths are taken relative to the root. Malformed but
    /// in-bounds input (mixed separators, `./`, redundant `..`) is
    /// normalized, not rejected.
    pub fn confine(&self, raw: &str) -> Result<PathBuf> {
        let resolved = self.resolve(raw)?;
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(self.out_of_bounds(raw))
        }
    }

    /// Admits a destination path. It must lie strictly beneath the root:
    /// the root itself cannot be replaced by a file, and its parent is
    /// where a write-then-rename would stage.
    pub fn admit(&self, raw: &str) -> Result<AdmittedPath> {
        let resolved = self.confine(raw)?;
        if resolved == self.root {
            return Err(OperationError::InvalidParameters(format!(
                "destination {raw} is the confinement root itself"
            )));
        }
        debug!("Admitted {raw} as {}", resolved.display());
        Ok(AdmittedPath(resolved))
    }

    /// Admits a path the operation only reads from.
    ///
    /// Confined like a destination (the root itself included) unless
    /// source confinement was turned off, in which case the path is
    /// just normalized.
    pub fn admit_source(&self, raw: &str) -> Result<PathBuf> {
        if self.confine_sources {
            return self.confine(raw);
        }
        self.resolve(raw)
    }

    fn out_of_bounds(&self, raw: &str) -> OperationError {
        OperationError::OutOfBoundsPath {
            path: PathBuf::from(raw),
            root: self.root.clone(),
        }
    }

    /// Normalizes `raw` into an absolute path with every existing
    /// symlink along the way resolved.
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        if raw.trim().is_empty() {
            return Err(OperationError::InvalidParameters(
                "path must not be empty".to_string(),
            ));
        }

        let normalized = raw.replace('\\', "/");
        let candidate = Path::new(&normalized);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let mut resolved = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => resolved.push(component),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => {
                    resolved.push(name);
                    let is_symlink = fs::symlink_metadata(&resolved)
                        .map(|meta| meta.file_type().is_symlink())
                        .unwrap_or(false);
                    if is_symlink {
                        // Dangling links cannot be shown to stay inside.
                        resolved =
                            fs::canonicalize(&resolved).map_err(|_| self.out_of_bounds(raw))?;
                    }
                }
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn test_root_itself_is_not_a_destination() {
        let (_dir, sandbox) = sandbox();
        let root = sandbox.root().to_string_lossy().into_owned();
        for raw in [root.as_str(), ".", "./", "a/..", "sub/../."] {
            let err = sandbox.admit(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameters, "{raw}");
        }
        // Still inside the bounds for reads.
        assert_eq!(sandbox.confine(&root).unwrap(), sandbox.root());
        assert_eq!(sandbox.admit_source(".").unwrap(), sandbox.root());
    }

    #[test]
    fn test_confine_rejects_outside() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.confine("../outside.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
    }

    #[test]
    fn test_admits_nonexistent_descendant() {
        let (_dir, sandbox) = sandbox();
        let raw = format!("{}/out/new/file.txt", sandbox.root().display());
        let admitted = sandbox.admit(&raw).unwrap();
        assert_eq!(admitted.as_path(), sandbox.root().join("out/new/file.txt"));
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let (_dir, sandbox) = sandbox();
        let admitted = sandbox.admit("reports/summary.txt").unwrap();
        assert_eq!(admitted.as_path(), sandbox.root().join("reports/summary.txt"));
    }

    #[test]
    fn test_rejects_absolute_path_outside_root() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.admit("/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
    }

    #[test]
    fn test_rejects_traversal_escape() {
        let (_dir, sandbox) = sandbox();
        let raw = format!("{}/a/../../escape.txt", sandbox.root().display());
        let err = sandbox.admit(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);

        let err = sandbox.admit("../../../../tmp/escape.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
    }

    #[test]
    fn test_traversal_that_stays_inside_is_normalized() {
        let (_dir, sandbox) = sandbox();
        let raw = format!("{}/a/b/../c/./d.txt", sandbox.root().display());
        let admitted = sandbox.admit(&raw).unwrap();
        assert_eq!(admitted.as_path(), sandbox.root().join("a/c/d.txt"));
    }

    #[test]
    fn test_mixed_separators_are_normalized() {
        let (_dir, sandbox) = sandbox();
        let raw = format!("{}\\sub\\file.txt", sandbox.root().display());
        let admitted = sandbox.admit(&raw).unwrap();
        assert_eq!(admitted.as_path(), sandbox.root().join("sub/file.txt"));
    }

    #[test]
    fn test_sibling_with_common_prefix_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("data");
        let sibling = parent.path().join("data2");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&sibling).unwrap();
        let sandbox = Sandbox::new(&root).unwrap();

        let raw = format!("{}/file.txt", fs::canonicalize(&sibling).unwrap().display());
        let err = sandbox.admit(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escape() {
        let (_dir, sandbox) = sandbox();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.root().join("link")).unwrap();

        let raw = format!("{}/link/stolen.txt", sandbox.root().display());
        let err = sandbox.admit(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
    }

    #[cfg(unix)]
    #[test]
    fn test_admits_symlink_pointing_inside() {
        let (_dir, sandbox) = sandbox();
        fs::create_dir(sandbox.root().join("real")).unwrap();
        std::os::unix::fs::symlink(sandbox.root().join("real"), sandbox.root().join("alias"))
            .unwrap();

        let admitted = sandbox.admit("alias/file.txt").unwrap();
        assert_eq!(admitted.as_path(), sandbox.root().join("real/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_dangling_symlink() {
        let (_dir, sandbox) = sandbox();
        std::os::unix::fs::symlink("/nonexistent/target", sandbox.root().join("dangling"))
            .unwrap();
        let err = sandbox.admit("dangling").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
    }

    #[test]
    fn test_empty_path_is_invalid_parameters() {
        let (_dir, sandbox) = sandbox();
        let err = sandbox.admit("  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    }

    #[test]
    fn test_admit_source_respects_policy() {
        let (_dir, sandbox) = sandbox();
        let outside = tempfile::tempdir().unwrap();
        let raw = outside.path().join("input.txt").to_string_lossy().into_owned();

        let err = sandbox.admit_source(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);

        let relaxed = sandbox.clone().with_source_confinement(false);
        assert!(!relaxed.confines_sources());
        assert!(relaxed.admit_source(&raw).is_ok());
        // Destinations stay confined either way.
        assert!(relaxed.admit(&raw).is_err());
    }

    #[test]
    fn test_new_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Sandbox::new(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_new_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(Sandbox::new(&file).is_err());
    }
}
