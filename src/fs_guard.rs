//! Defensive file I/O guard -- single source of truth for untrusted
//! metadata reads.
//!
//! Every location in scw that reads an untrusted metadata file (layouts,
//! links, key files) routes through [`read_validated`]. This module
//! enforces two invariants:
//!
//! 1. **Symlink rejection**: Files that are symlinks are refused before any
//!    content is read. This prevents an attacker from using a symlink to
//!    point the verifier at an arbitrary file outside the evidence
//!    directory.
//!
//! 2. **Size bounding**: Files larger than the caller-specified `max_bytes`
//!    limit are refused. This prevents denial-of-service via oversized
//!    inputs.
//!
//! Artifact *hashing* intentionally does not route through here: artifacts
//! may be large and symlinks among them are governed by the resolver's
//! follow policy instead.
//!
//! ## Known Limitation: TOCTOU Window
//!
//! There is a time-of-check-to-time-of-use gap between `symlink_metadata()`
//! and `fs::read()`. An attacker with local filesystem write access could
//! swap a regular file for a symlink between the check and the read. This
//! is an accepted risk: the threat model treats the local filesystem as
//! trusted infrastructure -- an attacker who can race the filesystem
//! already has local code execution.

use std::{fs, path::Path};

use crate::error::{Error, Result};

/// Reads a file after verifying it is not a symlink and is within
/// `max_bytes`.
///
/// # Errors
///
/// Returns [`Error::Io`] if:
/// - The path does not exist or is not readable.
/// - The path is a symlink (security: prevents path traversal).
/// - The file exceeds `max_bytes` (security: prevents memory exhaustion).
pub fn read_validated(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(path, &e))?;
    if meta.file_type().is_symlink() {
        return Err(Error::Io {
            path: path.into(),
            reason: "refusing to read symlink".into(),
        });
    }
    if meta.len() > max_bytes {
        return Err(Error::Io {
            path: path.into(),
            reason: format!(
                "file too large ({} bytes, max {max_bytes} bytes)",
                meta.len()
            ),
        });
    }
    fs::read(path).map_err(|e| Error::io(path, &e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn reads_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        std::fs::write(&path, b"{}").unwrap();
        assert_eq!(read_validated(&path, 1024).unwrap(), b"{}");
    }

    #[test]
    fn rejects_missing_file() {
        let err = read_validated(Path::new("/nonexistent/x.link"), 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        std::fs::write(&path, vec![b' '; 32]).unwrap();
        let err = read_validated(&path, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("too large"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.json");
        std::fs::write(&target, b"{}").unwrap();
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = read_validated(&link, 1024).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }
}
