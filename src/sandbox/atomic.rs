//! Write-then-rename for admitted destinations.
//!
//! The temp file lives in the destination's own directory so the final
//! rename never crosses a filesystem. A reader sees either the previous
//! file or the complete new one.

use std::fs;
use std::io::Write;

use tempfile::NamedTempFile;
use tracing::debug;

use super::AdmittedPath;
use crate::error::{OperationError, Result};

fn write_error(dest: &AdmittedPath, e: impl std::fmt::Display) -> OperationError {
    OperationError::Write(format!("{}: {e}", dest.as_path().display()))
}

/// Atomically replaces `dest` with `contents`, creating missing parent
/// directories (which are inside the root, since `dest` is).
pub fn write_atomic_blocking(dest: &AdmittedPath, contents: &[u8]) -> Result<()> {
    let parent = dest
        .as_path()
        .parent()
        .ok_or_else(|| write_error(dest, "destination has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| write_error(dest, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| write_error(dest, e))?;
    tmp.write_all(contents).map_err(|e| write_error(dest, e))?;
    tmp.as_file().sync_all().map_err(|e| write_error(dest, e))?;
    tmp.persist(dest.as_path())
        .map_err(|e| write_error(dest, e.error))?;

    debug!("Wrote {} bytes to {}", contents.len(), dest.as_path().display());
    Ok(())
}

/// Async wrapper around [`write_atomic_blocking`].
pub async fn write_atomic(dest: &AdmittedPath, contents: Vec<u8>) -> Result<()> {
    let target = dest.clone();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &contents))
        .await
        .map_err(|e| write_error(dest, e))?
}
