//! Payload data model: layouts, links, artifact rules, and their signed
//! wrappers.
//!
//! Everything that can be signed or verified lives here. Validation runs
//! both on construction and on load -- a payload that deserializes but
//! violates an invariant (duplicate step name, unknown keyid, malformed
//! rule) is rejected with [`crate::error::Error::Schema`] before any
//! cryptographic work happens.

pub mod layout;
pub mod link;
pub mod metadata;
pub mod rule;

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Per-artifact digests: algorithm name (`sha256`, `sha512`) to lowercase
/// hex digest. Ordered so serialization is stable.
pub type DigestSet = BTreeMap<String, String>;

/// Recorded artifacts: normalized `/`-separated path (or URI) to digest set.
pub type ArtifactMap = BTreeMap<String, DigestSet>;

/// Validates a step or inspection name.
///
/// Names become link file names (`<name>.<keyid8>.link`) and sublayout
/// directory names, so path separators and dot-navigation are rejected.
///
/// # Errors
///
/// Returns [`Error::Schema`] naming the offending character or form.
pub fn validate_item_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::schema("item name", "name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(Error::schema(
            "item name",
            format!("'{name}' is not a valid name"),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::schema(
            "item name",
            format!("'{name}' must not contain path separators"),
        ));
    }
    Ok(())
}

/// Returns `true` when two digest sets agree: at least one algorithm is
/// present in both and every shared algorithm has an equal digest.
pub fn digest_sets_equal(a: &DigestSet, b: &DigestSet) -> bool {
    let mut shared = false;
    for (algo, digest) in a {
        if let Some(other) = b.get(algo) {
            if other != digest {
                return false;
            }
            shared = true;
        }
    }
    shared
}
