//! The built-in `file` resolver: hashes files and directory trees.
//!
//! A URI is a plain path or `file:PATH`, resolved relative to the
//! configured base path. Directories are walked recursively; recorded keys
//! are `/`-normalized with the base path stripped. Missing paths are
//! skipped with a warning rather than failing the recording -- a declared
//! material that a step never produced is a policy question for the rule
//! engine, not an I/O error.

use std::path::PathBuf;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::ArtifactMap;
use crate::resolver::{hash_file, normalize_uri_path, ResolveContext, Resolver};

/// Resolver for the `file` scheme (and schemeless paths).
pub struct FileResolver;

impl Resolver for FileResolver {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn resolve(&self, uri: &str, ctx: &ResolveContext) -> Result<ArtifactMap> {
        let path_part = uri.strip_prefix("file:").unwrap_or(uri);
        resolve_path(path_part, ctx)
    }
}

/// Shared path-hashing core, also used by the `dir` resolver.
pub(crate) fn resolve_path(path_part: &str, ctx: &ResolveContext) -> Result<ArtifactMap> {
    let mut artifacts = ArtifactMap::new();

    let had_trailing_separator = path_part.ends_with('/') || path_part.ends_with('\\');
    let key_prefix = normalize_uri_path(path_part);

    let disk_root: PathBuf = match &ctx.base_path {
        Some(base) => base.join(&key_prefix),
        // A bare "." (or empty) URI without a base path means the
        // current directory.
        None if key_prefix.is_empty() => PathBuf::from("."),
        None => PathBuf::from(&key_prefix),
    };

    let root_meta = match std::fs::metadata(&disk_root) {
        Ok(meta) => meta,
        Err(_) => {
            warn!(path = %disk_root.display(), "artifact path does not exist, skipping");
            return Ok(artifacts);
        }
    };

    if root_meta.is_file() {
        if had_trailing_separator {
            return Err(Error::schema(
                "artifact path",
                format!("'{path_part}' has a trailing separator but is a file"),
            ));
        }
        if !ctx.exclude.is_match(&key_prefix, false) {
            artifacts.insert(
                key_prefix,
                hash_file(
                    &disk_root,
                    &ctx.hash_algorithms,
                    ctx.normalize_line_endings,
                )?,
            );
        }
        return Ok(artifacts);
    }

    if ctx.exclude.is_match(&key_prefix, true) {
        return Ok(artifacts);
    }

    let mut walker = WalkDir::new(&disk_root)
        .follow_links(ctx.follow_symlink_dirs)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        // Symlink loops (with follow enabled) and permission failures
        // surface here.
        let entry = entry.map_err(|e| Error::Io {
            path: e.path().map_or_else(|| disk_root.clone(), PathBuf::from),
            reason: e.to_string(),
        })?;

        let rel = entry
            .path()
            .strip_prefix(&disk_root)
            .map_err(|e| Error::Io {
                path: entry.path().into(),
                reason: e.to_string(),
            })?;
        let rel = normalize_uri_path(&rel.to_string_lossy());
        let key = if key_prefix.is_empty() {
            rel
        } else {
            format!("{key_prefix}/{rel}")
        };

        if entry.file_type().is_dir() {
            if ctx.exclude.is_match(&key, true) {
                // A directory match excludes its contents recursively.
                walker.skip_current_dir();
            }
            continue;
        }

        if ctx.exclude.is_match(&key, false) {
            continue;
        }

        if entry.file_type().is_file() {
            artifacts.insert(
                key,
                hash_file(
                    entry.path(),
                    &ctx.hash_algorithms,
                    ctx.normalize_line_endings,
                )?,
            );
        } else if entry.file_type().is_symlink() {
            // File symlinks are followed; broken ones are skipped.
            match std::fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => {
                    artifacts.insert(
                        key,
                        hash_file(
                            entry.path(),
                            &ctx.hash_algorithms,
                            ctx.normalize_line_endings,
                        )?,
                    );
                }
                _ => {
                    debug!(path = %entry.path().display(), "skipping symlink");
                }
            }
        }
    }

    Ok(artifacts)
}
