//! The `dir` resolver: one synthetic digest per directory tree.
//!
//! `dir:PATH` hashes the tree like the `file` resolver would, then folds
//! the sorted `path digest` listing into a single digest per algorithm.
//! Useful when a step's product is "this whole tree" and per-file entries
//! would bloat the link.

use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};
use crate::models::{ArtifactMap, DigestSet};
use crate::resolver::{file, HashAlgorithm, ResolveContext, Resolver};

/// Resolver for the `dir` scheme.
pub struct DirResolver;

impl Resolver for DirResolver {
    fn scheme(&self) -> &'static str {
        "dir"
    }

    fn resolve(&self, uri: &str, ctx: &ResolveContext) -> Result<ArtifactMap> {
        let path_part = uri.strip_prefix("dir:").ok_or_else(|| {
            Error::schema("dir resolver", format!("'{uri}' is missing the dir: scheme"))
        })?;

        let tree = file::resolve_path(path_part, ctx)?;

        // The tree map is ordered, so the listing is already sorted by
        // path; digest order inside an entry is fixed by the algorithm
        // list below.
        let mut digests = DigestSet::new();
        for algo in &ctx.hash_algorithms {
            let digest = match algo {
                HashAlgorithm::Sha256 => {
                    let mut hasher = Sha256::new();
                    fold_listing(&mut hasher, &tree, *algo);
                    hex::encode(hasher.finalize())
                }
                HashAlgorithm::Sha512 => {
                    let mut hasher = Sha512::new();
                    fold_listing(&mut hasher, &tree, *algo);
                    hex::encode(hasher.finalize())
                }
            };
            digests.insert(algo.name().into(), digest);
        }

        let mut out = ArtifactMap::new();
        out.insert(uri.to_string(), digests);
        Ok(out)
    }
}

fn fold_listing<H: Digest>(hasher: &mut H, tree: &ArtifactMap, algo: HashAlgorithm) {
    for (path, digests) in tree {
        if let Some(digest) = digests.get(algo.name()) {
            hasher.update(path.as_bytes());
            hasher.update(b" ");
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
    }
}
