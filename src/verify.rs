//! Verification pipeline -- checks that a pipeline ran as its layout
//! declares.
//!
//! The sequence is fixed; any step's failure is terminal:
//!
//! 1. Layout signature check against the owner keys.
//! 2. Expiry check.
//! 3. Parameter substitution (`{NAME}` tokens) on a working copy.
//! 4. Link loading per step: candidate files, signature filtering,
//!    threshold clustering, sublayout recursion.
//! 5. Command alignment (warning only).
//! 6. Rule evaluation, materials then products, per step in order.
//! 7. Inspection execution and rule evaluation.
//!
//! Non-fatal findings (misaligned commands, ignored link files) are
//! collected as warnings and logged; the first fatal error per step ends
//! the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::crypto::registry::Registry;
use crate::crypto::{Key, VerificationResult};
use crate::error::{Error, Result};
use crate::models::layout::{Inspection, Layout, Step};
use crate::models::link::Link;
use crate::models::metadata::{Metadata, Payload};
use crate::models::rule::{ArtifactRule, ArtifactSide};
use crate::resolver::{ExcludeFilter, ResolveContext, ResolverSet};
use crate::rules::verify_item_rules;
use crate::runner::{CommandRunner, ProcessRunner};

/// Hard cap on sublayout nesting. A malicious layout chain referencing
/// itself must terminate as a schema failure, not a stack overflow.
const MAX_SUBLAYOUT_DEPTH: u32 = 16;

/// Everything one verification run needs. Owned by the caller; no global
/// state.
pub struct VerificationRequest {
    /// Path to the signed layout file.
    pub layout_path: PathBuf,
    /// Project owner public keys used to verify the layout signature.
    pub layout_keys: Vec<Key>,
    /// Directory holding the link evidence (defaults to the layout's
    /// directory).
    pub evidence_dir: PathBuf,
    /// `{NAME}` substitution values.
    pub substitutions: BTreeMap<String, String>,
    /// Minimum number of owner keys that must have validly signed the
    /// layout.
    pub min_owner_sigs: u32,
    /// Clock override for deterministic verification; defaults to now.
    pub now: Option<OffsetDateTime>,
    /// Signature scheme registry.
    pub registry: Arc<Registry>,
    /// Artifact resolvers for inspections.
    pub resolvers: ResolverSet,
    /// Exclude patterns applied when inspections snapshot the evidence
    /// directory.
    pub exclude_patterns: Vec<String>,
    /// Timeout for inspection commands.
    pub inspection_timeout: Option<Duration>,
    /// Child-process executor for inspections.
    pub runner: Box<dyn CommandRunner>,
}

impl VerificationRequest {
    /// Creates a request with defaults for `layout_path` and its
    /// directory as the evidence directory.
    pub fn new(layout_path: impl Into<PathBuf>, layout_keys: Vec<Key>) -> Self {
        let layout_path: PathBuf = layout_path.into();
        // A bare filename has an empty parent; both mean "here".
        let evidence_dir = layout_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            layout_path,
            layout_keys,
            evidence_dir,
            substitutions: BTreeMap::new(),
            min_owner_sigs: 1,
            now: None,
            registry: crate::crypto::registry::default_registry(),
            resolvers: ResolverSet::with_builtins(),
            exclude_patterns: Vec::new(),
            inspection_timeout: None,
            runner: Box::new(ProcessRunner),
        }
    }
}

/// Outcome of a passed verification: the non-fatal findings.
#[derive(Debug, Default)]
pub struct VerificationReport {
    /// Human-readable warnings (misaligned commands, ignored links).
    pub warnings: Vec<String>,
}

/// Verifies a final product against its layout and evidence.
///
/// # Errors
///
/// Returns the first fatal [`Error`] in pipeline order; the kind tag
/// distinguishes policy violations from invalid input.
pub fn verify(request: &VerificationRequest) -> Result<VerificationReport> {
    let mut owner_keys = request.layout_keys.clone();
    for key in &mut owner_keys {
        key.ensure_keyid().map_err(|source| Error::Crypto {
            context: "owner key".into(),
            source,
        })?;
    }

    let metadata = Metadata::load(&request.layout_path)?;
    let mut pipeline = Pipeline {
        request,
        now: request.now.unwrap_or_else(OffsetDateTime::now_utc),
        warnings: Vec::new(),
    };
    pipeline.verify_layout_metadata(
        &metadata,
        &owner_keys,
        &request.evidence_dir,
        request.min_owner_sigs,
        0,
    )?;
    Ok(VerificationReport {
        warnings: pipeline.warnings,
    })
}

/// Shared state for one verification run, including sublayout recursion.
struct Pipeline<'a> {
    request: &'a VerificationRequest,
    now: OffsetDateTime,
    warnings: Vec<String>,
}

impl Pipeline<'_> {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Verifies one (sub)layout and returns the summary link standing in
    /// for it: materials of the first step, products of the last.
    fn verify_layout_metadata(
        &mut self,
        metadata: &Metadata,
        owner_keys: &[Key],
        evidence_dir: &Path,
        min_owner_sigs: u32,
        depth: u32,
    ) -> Result<Link> {
        if depth > MAX_SUBLAYOUT_DEPTH {
            return Err(Error::schema(
                "sublayout recursion",
                format!("nesting exceeds {MAX_SUBLAYOUT_DEPTH} levels"),
            ));
        }

        // 1. Signatures before anything else; an unsigned layout is not a
        //    policy.
        self.check_layout_signatures(metadata, owner_keys, min_owner_sigs)?;

        let Payload::Layout(layout) = metadata.payload()? else {
            return Err(Error::schema("layout", "payload is not a layout"));
        };

        // 2. Expiry.
        let expires = layout.parse_expires()?;
        if self.now >= expires {
            return Err(Error::Expired {
                expires: layout.expires.clone(),
            });
        }

        // 3. Substitution on a working copy; the signed original is never
        //    mutated.
        let layout = substitute_layout(&layout, &self.request.substitutions)?;

        // 4. Load evidence for every step before any rule runs: MATCH may
        //    reference any step.
        let mut links: BTreeMap<String, Link> = BTreeMap::new();
        for step in &layout.steps {
            let link = self.load_step_evidence(&layout, step, evidence_dir, depth)?;
            links.insert(step.name.clone(), link);
        }

        // 5. Command alignment, warning only.
        for step in &layout.steps {
            if let Some(link) = links.get(&step.name) {
                if link.command != step.expected_command {
                    self.warn(format!(
                        "step '{}' ran {:?}, layout expects {:?}",
                        step.name, link.command, step.expected_command
                    ));
                }
            }
        }

        // 6. Step rules, materials then products, in declared order.
        for step in &layout.steps {
            debug!(step = %step.name, "evaluating step rules");
            verify_item_rules(
                &step.name,
                ArtifactSide::Materials,
                &step.expected_materials,
                &links,
            )?;
            verify_item_rules(
                &step.name,
                ArtifactSide::Products,
                &step.expected_products,
                &links,
            )?;
        }

        // 7. Inspections, in declared order, each evaluated right after
        //    it runs.
        for inspection in &layout.inspect {
            let link = self.run_inspection(inspection, evidence_dir)?;
            links.insert(inspection.name.clone(), link);
            verify_item_rules(
                &inspection.name,
                ArtifactSide::Materials,
                &inspection.expected_materials,
                &links,
            )?;
            verify_item_rules(
                &inspection.name,
                ArtifactSide::Products,
                &inspection.expected_products,
                &links,
            )?;
        }

        Ok(summary_link(&layout, &links))
    }

    fn check_layout_signatures(
        &self,
        metadata: &Metadata,
        owner_keys: &[Key],
        min_owner_sigs: u32,
    ) -> Result<()> {
        let message = metadata.signed_bytes()?;
        let signatures = metadata.signatures()?;

        let mut valid_owners: BTreeSet<&str> = BTreeSet::new();
        for key in owner_keys {
            for signature in &signatures {
                let Some(signing_key) = key.resolve_signing_key(&signature.keyid) else {
                    continue;
                };
                match self
                    .request
                    .registry
                    .verify_signature(signing_key, &message, signature)
                {
                    Ok(VerificationResult::Valid) => {
                        valid_owners.insert(key.keyid.as_str());
                    }
                    Ok(VerificationResult::Invalid { reason }) => {
                        debug!(keyid = %signature.keyid, reason, "layout signature invalid");
                    }
                    Err(e) => {
                        debug!(keyid = %signature.keyid, error = %e, "layout signature unverifiable");
                    }
                }
            }
        }

        if (valid_owners.len() as u32) < min_owner_sigs.max(1) {
            return Err(Error::Crypto {
                context: "layout signature verification".into(),
                source: crate::crypto::CryptoError::VerificationFailed {
                    scheme: "layout".into(),
                    reason: format!(
                        "{} of {} required owner signature(s) verified",
                        valid_owners.len(),
                        min_owner_sigs.max(1)
                    ),
                },
            });
        }
        Ok(())
    }

    /// Finds, filters, and clusters a step's candidate link files,
    /// recursing into sublayouts.
    fn load_step_evidence(
        &mut self,
        layout: &Layout,
        step: &Step,
        evidence_dir: &Path,
        depth: u32,
    ) -> Result<Link> {
        let authorized: Vec<&Key> = step
            .pubkeys
            .iter()
            .filter_map(|keyid| layout.keys.get(keyid))
            .collect();

        let mut candidates = candidate_files(evidence_dir, &step.name)?;
        candidates.sort();

        // One agreement cluster per distinct (command, materials,
        // products); candidates land in the cluster their payload hashes
        // to.
        struct Cluster {
            link: Link,
            functionaries: BTreeSet<String>,
            signatures: usize,
        }
        let mut clusters: BTreeMap<Vec<u8>, Cluster> = BTreeMap::new();

        for path in &candidates {
            let metadata = match Metadata::load(path) {
                Ok(m) => m,
                Err(e) => {
                    self.warn(format!("ignoring unreadable link {}: {e}", path.display()));
                    continue;
                }
            };

            // Signature filtering: discard, never fail, on bad evidence.
            let signers = match self.valid_functionaries(&metadata, &authorized) {
                Ok(signers) => signers,
                Err(e) => {
                    self.warn(format!("ignoring undecodable link {}: {e}", path.display()));
                    continue;
                }
            };
            if signers.is_empty() {
                self.warn(format!(
                    "ignoring link {} with no authorized valid signature",
                    path.display()
                ));
                continue;
            }

            let link = match metadata.payload() {
                Ok(Payload::Link(link)) if link.name == step.name => link,
                Ok(Payload::Link(link)) => {
                    self.warn(format!(
                        "ignoring link {} attesting step '{}'",
                        path.display(),
                        link.name
                    ));
                    continue;
                }
                Ok(Payload::Layout(_)) => {
                    // A sublayout: verify it recursively; its summary
                    // stands in as this candidate's link.
                    let sub_dir = sublayout_evidence_dir(evidence_dir, path);
                    let sub_owner_keys: Vec<Key> =
                        authorized.iter().map(|k| (*k).clone()).collect();
                    debug!(step = %step.name, dir = %sub_dir.display(), "descending into sublayout");
                    let mut summary = self.verify_layout_metadata(
                        &metadata,
                        &sub_owner_keys,
                        &sub_dir,
                        1,
                        depth + 1,
                    )?;
                    summary.name = step.name.clone();
                    summary
                }
                Err(e) => {
                    self.warn(format!("ignoring malformed link {}: {e}", path.display()));
                    continue;
                }
            };

            let key = agreement_key(&link)?;
            let entry = clusters.entry(key).or_insert_with(|| Cluster {
                link: link.clone(),
                functionaries: BTreeSet::new(),
                signatures: 0,
            });
            entry.signatures += signers.len();
            entry.functionaries.extend(signers);
        }

        // Pick the qualifying cluster with the most valid signatures;
        // break ties on the lexicographically smallest sorted keyid list.
        let threshold = step.threshold as usize;
        let mut best: Option<Cluster> = None;
        let mut found_max = 0usize;
        for cluster in clusters.into_values() {
            found_max = found_max.max(cluster.functionaries.len());
            if cluster.functionaries.len() < threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    cluster.signatures > current.signatures
                        || (cluster.signatures == current.signatures
                            && cluster.functionaries < current.functionaries)
                }
            };
            if better {
                best = Some(cluster);
            }
        }

        match best {
            Some(cluster) => Ok(cluster.link),
            None => Err(Error::Threshold {
                step: step.name.clone(),
                required: step.threshold,
                found: found_max,
                reason: format!(
                    "{} candidate file(s) in {}",
                    candidates.len(),
                    evidence_dir.display()
                ),
            }),
        }
    }

    /// Returns the primary keyids of authorized functionaries with a
    /// valid signature on `metadata`. Sub-key signatures count for their
    /// primary, and each primary counts once.
    fn valid_functionaries(
        &self,
        metadata: &Metadata,
        authorized: &[&Key],
    ) -> Result<BTreeSet<String>> {
        let message = metadata.signed_bytes()?;
        let signatures = metadata.signatures()?;

        let mut valid = BTreeSet::new();
        for key in authorized {
            if valid.contains(&key.keyid) {
                continue;
            }
            for signature in &signatures {
                let Some(signing_key) = key.resolve_signing_key(&signature.keyid) else {
                    continue;
                };
                if matches!(
                    self.request
                        .registry
                        .verify_signature(signing_key, &message, signature),
                    Ok(VerificationResult::Valid)
                ) {
                    valid.insert(key.keyid.clone());
                    break;
                }
            }
        }
        Ok(valid)
    }

    /// Runs one inspection in the evidence directory and synthesizes its
    /// in-memory link.
    fn run_inspection(&mut self, inspection: &Inspection, evidence_dir: &Path) -> Result<Link> {
        debug!(inspection = %inspection.name, "executing inspection");
        let resolve = ResolveContext {
            base_path: Some(evidence_dir.to_path_buf()),
            exclude: ExcludeFilter::new(&self.request.exclude_patterns)?,
            ..ResolveContext::default()
        };

        let (link, timed_out) = crate::record::snapshot_run(
            &inspection.name,
            &[".".to_string()],
            &inspection.run,
            evidence_dir,
            self.request.inspection_timeout,
            &self.request.resolvers,
            &resolve,
            self.request.runner.as_ref(),
        )?;

        if timed_out {
            return Err(Error::Timeout {
                context: format!("inspection '{}'", inspection.name),
                timeout_secs: self
                    .request
                    .inspection_timeout
                    .map(|t| t.as_secs())
                    .unwrap_or_default(),
            });
        }
        match link.byproducts.return_value {
            Some(0) => Ok(link),
            other => Err(Error::Runtime {
                context: format!("inspection '{}'", inspection.name),
                reason: format!(
                    "command {:?} returned {other:?}, expected 0",
                    inspection.run
                ),
            }),
        }
    }
}

/// Candidate link files for a step: `<name>.<8 hex>.link`.
fn candidate_files(evidence_dir: &Path, step_name: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(evidence_dir).map_err(|e| Error::io(evidence_dir, &e))?;
    let prefix = format!("{step_name}.");
    let mut out = Vec::new();
    for entry in entries.filter_map(std::result::Result::ok) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(middle) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".link"))
        else {
            continue;
        };
        if middle.len() == 8 && middle.chars().all(|c| c.is_ascii_hexdigit()) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

/// The evidence subdirectory for a sublayout candidate: the link file
/// path minus its `.link` suffix.
fn sublayout_evidence_dir(evidence_dir: &Path, link_path: &Path) -> PathBuf {
    let base = link_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".link"))
        .unwrap_or_default();
    evidence_dir.join(base)
}

/// Bytes two links must share to sit in the same agreement cluster.
fn agreement_key(link: &Link) -> Result<Vec<u8>> {
    crate::canonical::encode_canonical(&serde_json::json!({
        "command": link.command,
        "materials": link.materials,
        "products": link.products,
    }))
}

/// The link a verified sublayout contributes to its parent: materials of
/// the first step, products of the last.
fn summary_link(layout: &Layout, links: &BTreeMap<String, Link>) -> Link {
    let mut summary = Link {
        type_: "link".into(),
        name: String::new(),
        command: Vec::new(),
        materials: BTreeMap::new(),
        products: BTreeMap::new(),
        byproducts: crate::models::link::ByProducts::default(),
        environment: BTreeMap::new(),
    };
    if let Some(first) = layout.steps.first() {
        if let Some(link) = links.get(&first.name) {
            summary.materials = link.materials.clone();
        }
    }
    if let Some(last) = layout.steps.last() {
        if let Some(link) = links.get(&last.name) {
            summary.products = link.products.clone();
        }
    }
    summary
}

static SUBSTITUTION_TOKEN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn token_regex() -> &'static Regex {
    SUBSTITUTION_TOKEN.get_or_init(|| {
        // The pattern is a compile-time constant.
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\{([a-zA-Z0-9_-]+)\}").unwrap();
        re
    })
}

fn substitute_string(input: &str, substitutions: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for captures in token_regex().captures_iter(input) {
        let whole = captures.get(0).map_or("", |m| m.as_str());
        let name = captures.get(1).map_or("", |m| m.as_str());
        let start = captures.get(0).map_or(0, |m| m.start());
        let value = substitutions.get(name).ok_or_else(|| {
            Error::schema(
                "parameter substitution",
                format!("undefined parameter '{name}'"),
            )
        })?;
        out.push_str(input.get(last..start).unwrap_or_default());
        out.push_str(value);
        last = start + whole.len();
    }
    out.push_str(input.get(last..).unwrap_or_default());
    Ok(out)
}

fn substitute_rules(
    rules: &[ArtifactRule],
    substitutions: &BTreeMap<String, String>,
) -> Result<Vec<ArtifactRule>> {
    rules
        .iter()
        .map(|rule| {
            let tokens: Vec<String> = rule
                .to_tokens()
                .iter()
                .map(|t| substitute_string(t, substitutions))
                .collect::<Result<_>>()?;
            ArtifactRule::from_tokens(&tokens)
        })
        .collect()
}

/// Applies `{NAME}` substitutions to a deep copy of the layout:
/// expected commands, rule operands, and inspection run vectors.
fn substitute_layout(
    layout: &Layout,
    substitutions: &BTreeMap<String, String>,
) -> Result<Layout> {
    let mut out = layout.clone();
    for step in &mut out.steps {
        step.expected_command = step
            .expected_command
            .iter()
            .map(|a| substitute_string(a, substitutions))
            .collect::<Result<_>>()?;
        step.expected_materials = substitute_rules(&step.expected_materials, substitutions)?;
        step.expected_products = substitute_rules(&step.expected_products, substitutions)?;
    }
    for inspection in &mut out.inspect {
        inspection.run = inspection
            .run
            .iter()
            .map(|a| substitute_string(a, substitutions))
            .collect::<Result<_>>()?;
        inspection.expected_materials =
            substitute_rules(&inspection.expected_materials, substitutions)?;
        inspection.expected_products =
            substitute_rules(&inspection.expected_products, substitutions)?;
    }
    Ok(out)
}
