//! Queue-based artifact-rule engine.
//!
//! For one side (materials or products) of one item's link, the engine
//! holds a **queue** of not-yet-authorized artifact paths and the
//! immutable **full set** the queue started from. Rules apply in order;
//! each either consumes queue entries or fails verification:
//!
//! - `MATCH` consumes entries whose digests agree with the referenced
//!   step's link; entries that find no counterpart stay queued.
//! - `ALLOW`, `CREATE`, `DELETE`, `MODIFY` consume what they match.
//! - `DISALLOW` fails if anything it matches is still queued.
//! - `REQUIRE` checks the full set and consumes nothing.
//!
//! A nonempty queue after the last rule is *not* an error: enforcement is
//! opt-in by ending the rule list with `DISALLOW *`.

use std::collections::BTreeMap;

use globset::GlobMatcher;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::link::Link;
use crate::models::rule::{ArtifactRule, ArtifactSide};
use crate::models::{digest_sets_equal, ArtifactMap};
use crate::resolver::compile_glob;

fn matcher_for(pattern: &str) -> Result<GlobMatcher> {
    Ok(compile_glob(pattern)?.compile_matcher())
}

/// Strips `prefix` (plus the separating `/`) from `path`, if present.
fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    path.strip_prefix(prefix)?.strip_prefix('/')
}

fn join_prefix(prefix: &str, path: &str) -> String {
    format!("{}/{path}", prefix.trim_end_matches('/'))
}

/// Applies the ordered rule list of one item side.
///
/// `links` maps item names (steps *and* inspections) to the link being
/// used as their evidence; `item_name` must be present in it.
///
/// # Errors
///
/// Returns [`Error::Rule`] with the failing rule's index, or
/// [`Error::Schema`] for an uncompilable pattern.
pub fn verify_item_rules(
    item_name: &str,
    side: ArtifactSide,
    rules: &[ArtifactRule],
    links: &BTreeMap<String, Link>,
) -> Result<()> {
    let link = links.get(item_name).ok_or_else(|| Error::Schema {
        context: "rule evaluation".into(),
        reason: format!("no link loaded for item '{item_name}'"),
    })?;

    let (own, other): (&ArtifactMap, &ArtifactMap) = match side {
        ArtifactSide::Materials => (&link.materials, &link.products),
        ArtifactSide::Products => (&link.products, &link.materials),
    };
    let full_set = own;
    let mut queue: Vec<String> = own.keys().cloned().collect();

    let fail = |rule_index: usize, reason: String| Error::Rule {
        step: item_name.into(),
        side: side.as_str(),
        rule_index,
        reason,
    };

    for (rule_index, rule) in rules.iter().enumerate() {
        debug!(item = item_name, side = side.as_str(), rule = %rule, queued = queue.len(),
               "applying rule");
        match rule {
            ArtifactRule::Allow { pattern } => {
                let matcher = matcher_for(pattern)?;
                queue.retain(|path| !matcher.is_match(path));
            }

            ArtifactRule::Disallow { pattern } => {
                let matcher = matcher_for(pattern)?;
                let offending: Vec<&String> =
                    queue.iter().filter(|p| matcher.is_match(p)).collect();
                if !offending.is_empty() {
                    return Err(fail(
                        rule_index,
                        format!("disallowed artifacts still queued: {offending:?}"),
                    ));
                }
            }

            ArtifactRule::Require { filename } => {
                if !full_set.contains_key(filename) {
                    return Err(fail(
                        rule_index,
                        format!("required artifact '{filename}' is not recorded"),
                    ));
                }
            }

            ArtifactRule::Create { pattern } => {
                // Only meaningful for products: something created must not
                // have existed as a material.
                if side == ArtifactSide::Products {
                    let matcher = matcher_for(pattern)?;
                    queue.retain(|path| !(matcher.is_match(path) && !other.contains_key(path)));
                }
            }

            ArtifactRule::Delete { pattern } => {
                // Only meaningful for materials: something deleted must
                // not reappear as a product.
                if side == ArtifactSide::Materials {
                    let matcher = matcher_for(pattern)?;
                    queue.retain(|path| !(matcher.is_match(path) && !other.contains_key(path)));
                }
            }

            ArtifactRule::Modify { pattern } => {
                let matcher = matcher_for(pattern)?;
                queue.retain(|path| {
                    let modified = matcher.is_match(path)
                        && matches!(
                            (full_set.get(path), other.get(path)),
                            (Some(a), Some(b)) if !digest_sets_equal(a, b)
                        );
                    !modified
                });
            }

            ArtifactRule::Match {
                pattern,
                source_prefix,
                dest_side,
                dest_prefix,
                dest_step,
            } => {
                let matcher = matcher_for(pattern)?;
                let dest_artifacts: Option<&ArtifactMap> =
                    links.get(dest_step).map(|dest| match dest_side {
                        ArtifactSide::Materials => &dest.materials,
                        ArtifactSide::Products => &dest.products,
                    });

                queue.retain(|path| {
                    // Strip the optional source prefix; paths outside the
                    // prefix are not candidates for this rule.
                    let remainder = match source_prefix {
                        Some(prefix) => match strip_prefix(path, prefix) {
                            Some(r) => r,
                            None => return true,
                        },
                        None => path.as_str(),
                    };
                    if !matcher.is_match(remainder) {
                        return true;
                    }

                    let Some(dest_artifacts) = dest_artifacts else {
                        // Unknown destination link: nothing to agree
                        // with, entry stays queued for DISALLOW to flag.
                        return true;
                    };

                    let dest_path = match dest_prefix {
                        Some(prefix) => join_prefix(prefix, remainder),
                        None => remainder.to_string(),
                    };

                    let consumed = matches!(
                        (full_set.get(path), dest_artifacts.get(&dest_path)),
                        (Some(src), Some(dst)) if digest_sets_equal(src, dst)
                    );
                    !consumed
                });
            }
        }
    }

    debug!(item = item_name, side = side.as_str(), remaining = queue.len(),
           "rule list exhausted");
    Ok(())
}
