//! The `ostree` resolver: records an OSTree commit by its object id.
//!
//! `ostree:REF` resolves the ref under the repository at the base path
//! (first `refs/heads/REF`, then `REF` taken literally as a ref file
//! path) and records the commit checksum as the artifact digest. OSTree
//! object ids are already SHA-256, so no content hashing happens here --
//! the resolver is a pure function of the repository's ref files.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::models::{ArtifactMap, DigestSet};
use crate::resolver::{ResolveContext, Resolver};

/// Resolver for the `ostree` scheme.
pub struct OstreeResolver;

impl Resolver for OstreeResolver {
    fn scheme(&self) -> &'static str {
        "ostree"
    }

    fn resolve(&self, uri: &str, ctx: &ResolveContext) -> Result<ArtifactMap> {
        let reference = uri.strip_prefix("ostree:").ok_or_else(|| {
            Error::schema(
                "ostree resolver",
                format!("'{uri}' is missing the ostree: scheme"),
            )
        })?;
        if reference.is_empty() {
            return Err(Error::schema("ostree resolver", "empty ref"));
        }

        let repo: PathBuf = ctx
            .base_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let candidates = [
            repo.join("refs").join("heads").join(reference),
            repo.join(reference),
        ];
        let ref_file = candidates
            .iter()
            .find(|p| p.is_file())
            .ok_or_else(|| Error::Io {
                path: candidates.first().cloned().unwrap_or_default(),
                reason: format!("ostree ref '{reference}' not found"),
            })?;

        let content = std::fs::read_to_string(ref_file).map_err(|e| Error::io(ref_file, &e))?;
        let checksum = content.trim().to_lowercase();
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::schema(
                "ostree resolver",
                format!("ref '{reference}' does not contain a commit checksum"),
            ));
        }

        let mut digests = DigestSet::new();
        digests.insert("sha256".into(), checksum);

        let mut out = ArtifactMap::new();
        out.insert(uri.to_string(), digests);
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const COMMIT: &str = "7e3da54bf3d0300d1f27fe1c7cbd2e8d68f2a7e2a9d04c9a0c9b7dd61e8f2b41";

    fn repo_ctx(dir: &TempDir) -> ResolveContext {
        ResolveContext {
            base_path: Some(dir.path().to_path_buf()),
            ..ResolveContext::default()
        }
    }

    #[test]
    fn resolves_ref_under_refs_heads() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        fs::write(dir.path().join("refs/heads/stable"), format!("{COMMIT}\n")).unwrap();

        let artifacts = OstreeResolver
            .resolve("ostree:stable", &repo_ctx(&dir))
            .unwrap();
        assert_eq!(
            artifacts.get("ostree:stable").unwrap().get("sha256"),
            Some(&COMMIT.to_string())
        );
    }

    #[test]
    fn resolves_literal_ref_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("my-ref"), COMMIT).unwrap();

        let artifacts = OstreeResolver
            .resolve("ostree:my-ref", &repo_ctx(&dir))
            .unwrap();
        assert!(artifacts.contains_key("ostree:my-ref"));
    }

    #[test]
    fn missing_ref_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = OstreeResolver
            .resolve("ostree:nope", &repo_ctx(&dir))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn garbage_checksum_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad"), "not a checksum").unwrap();
        let err = OstreeResolver
            .resolve("ostree:bad", &repo_ctx(&dir))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }
}
