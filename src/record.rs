//! Recording engine -- produces signed link evidence for a step.
//!
//! Three modes, all funneling into the same link assembly:
//!
//! 1. **Wrap-and-run** ([`run_step`]): hash materials, execute the
//!    command, capture byproducts, hash products, sign, write
//!    `<name>.<keyid8>.link`.
//! 2. **Record-start / record-stop** ([`record_start`], [`record_stop`]):
//!    split recording around a manually executed step, bridged by a
//!    `.<name>.link-unfinished` side file.
//! 3. **Mock** ([`mock_run`]): like wrap-and-run but unsigned, written to
//!    `<name>.link`.
//!
//! Ordering guarantee: material hashing strictly precedes command
//! execution; product hashing strictly follows it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::crypto::Signer;
use crate::error::{Error, Result};
use crate::models::link::{ByProducts, Link};
use crate::models::metadata::{
    link_filename, unfinished_link_filename, Metadata, MetadataFormat, Payload,
};
use crate::models::validate_item_name;
use crate::resolver::{ResolveContext, ResolverSet};
use crate::runner::{CommandRunner, ProcessRunner};

/// Everything one recording invocation needs. Owned by the caller; the
/// engine itself keeps no state between calls.
pub struct RecordContext {
    /// URIs to record as materials.
    pub materials: Vec<String>,
    /// URIs to record as products.
    pub products: Vec<String>,
    /// Signers for the final link; the first signer's keyid names the
    /// output file.
    pub signers: Vec<Box<dyn Signer>>,
    /// Scheme registry for artifact hashing.
    pub resolvers: ResolverSet,
    /// Exclude patterns, base path, hash algorithms, normalization.
    pub resolve: ResolveContext,
    /// Working directory for the wrapped command.
    pub workdir: Option<PathBuf>,
    /// Command timeout; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Capture stdout/stderr into byproducts.
    pub capture_streams: bool,
    /// Treat a timeout as fatal instead of recording it in byproducts.
    pub fail_on_timeout: bool,
    /// Record the working directory into the link's environment.
    pub record_environment: bool,
    /// Wrapper shape for the written link.
    pub format: MetadataFormat,
    /// Directory link files are written to.
    pub out_dir: PathBuf,
    /// Child-process executor.
    pub runner: Box<dyn CommandRunner>,
}

impl Default for RecordContext {
    fn default() -> Self {
        Self {
            materials: Vec::new(),
            products: Vec::new(),
            signers: Vec::new(),
            resolvers: ResolverSet::with_builtins(),
            resolve: ResolveContext::default(),
            workdir: None,
            timeout: None,
            capture_streams: true,
            fail_on_timeout: false,
            record_environment: false,
            format: MetadataFormat::default(),
            out_dir: PathBuf::from("."),
            runner: Box::new(ProcessRunner),
        }
    }
}

impl RecordContext {
    fn require_signers(&self, operation: &str) -> Result<()> {
        if self.signers.is_empty() {
            return Err(Error::schema(
                operation,
                "at least one signer is required",
            ));
        }
        Ok(())
    }

    fn environment(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        let mut env = std::collections::BTreeMap::new();
        if self.record_environment {
            let workdir = self
                .workdir
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_default();
            env.insert(
                "workdir".to_string(),
                serde_json::Value::String(workdir.display().to_string()),
            );
        }
        env
    }

    fn sign_and_dump(&self, link: Link, filename: &str) -> Result<PathBuf> {
        let mut metadata = Metadata::new(&Payload::Link(link), self.format)?;
        for signer in &self.signers {
            metadata.sign_with(signer.as_ref())?;
        }
        let path = self.out_dir.join(filename);
        metadata.dump(&path)?;
        Ok(path)
    }
}

/// Records a full step: materials, wrapped command, products, signature.
///
/// Returns the path of the written link file.
///
/// # Errors
///
/// - [`Error::Runtime`] if the command cannot be started (no link is
///   written).
/// - [`Error::Timeout`] if the command times out and the context says
///   timeouts are fatal; otherwise the timeout lands in byproducts.
/// - [`Error::Schema`] for an invalid step name or missing signers.
pub fn run_step(name: &str, argv: &[String], ctx: &RecordContext) -> Result<PathBuf> {
    validate_item_name(name)?;
    ctx.require_signers("run")?;
    let link = assemble_link(name, argv, ctx)?;
    let keyid = ctx
        .signers
        .first()
        .map(|s| s.keyid().to_string())
        .unwrap_or_default();
    ctx.sign_and_dump(link, &link_filename(name, &keyid))
}

/// Records a step without signing, writing `<name>.link`.
///
/// # Errors
///
/// Same as [`run_step`], minus the signer requirement.
pub fn mock_run(name: &str, argv: &[String], ctx: &RecordContext) -> Result<PathBuf> {
    validate_item_name(name)?;
    let link = assemble_link(name, argv, ctx)?;
    let metadata = Metadata::new(&Payload::Link(link), MetadataFormat::Classic)?;
    let path = ctx.out_dir.join(format!("{name}.link"));
    metadata.dump(&path)?;
    Ok(path)
}

fn assemble_link(name: &str, argv: &[String], ctx: &RecordContext) -> Result<Link> {
    // Materials strictly before the command runs.
    debug!(step = name, "hashing materials");
    let materials = ctx.resolvers.resolve_all(&ctx.materials, &ctx.resolve)?;

    let mut byproducts = ByProducts::default();
    if !argv.is_empty() {
        let outcome = ctx.runner.run(
            argv,
            ctx.workdir.as_deref(),
            ctx.timeout,
            ctx.capture_streams,
        )?;
        if outcome.timed_out && ctx.fail_on_timeout {
            return Err(Error::Timeout {
                context: format!("step '{name}'"),
                timeout_secs: ctx.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        byproducts.return_value = outcome.return_value;
        if ctx.capture_streams {
            byproducts.stdout = Some(outcome.stdout);
            byproducts.stderr = Some(outcome.stderr);
        }
        if outcome.timed_out {
            byproducts.timeout = Some(true);
        }
    }

    // Products strictly after the command finished.
    debug!(step = name, "hashing products");
    let products = ctx.resolvers.resolve_all(&ctx.products, &ctx.resolve)?;

    let mut link = Link::new(name)?;
    link.command = argv.to_vec();
    link.materials = materials;
    link.products = products;
    link.byproducts = byproducts;
    link.environment = ctx.environment();
    Ok(link)
}

/// Hashes materials and parks them in an in-progress side file. No
/// command runs.
///
/// # Errors
///
/// Returns resolver or I/O errors; signing errors if signers are present
/// (the side file is signed when it can be).
pub fn record_start(name: &str, ctx: &RecordContext) -> Result<PathBuf> {
    validate_item_name(name)?;
    let materials = ctx.resolvers.resolve_all(&ctx.materials, &ctx.resolve)?;

    let mut link = Link::new(name)?;
    link.materials = materials;
    link.environment = ctx.environment();

    let mut metadata = Metadata::new(&Payload::Link(link), MetadataFormat::Classic)?;
    for signer in &ctx.signers {
        metadata.sign_with(signer.as_ref())?;
    }
    let path = ctx.out_dir.join(unfinished_link_filename(name));
    metadata.dump(&path)?;
    Ok(path)
}

/// Completes a record-start: merges its materials with freshly hashed
/// products, signs, writes the final link, and removes the side file.
///
/// A missing side file is recoverable: recording proceeds with empty
/// materials and a warning.
///
/// # Errors
///
/// Returns [`Error::Schema`] for missing signers or a corrupt side file,
/// plus resolver and I/O errors.
pub fn record_stop(name: &str, ctx: &RecordContext) -> Result<PathBuf> {
    validate_item_name(name)?;
    ctx.require_signers("record stop")?;

    let side_path = ctx.out_dir.join(unfinished_link_filename(name));
    let mut link = if side_path.exists() {
        let metadata = Metadata::load(&side_path)?;
        match metadata.payload()? {
            Payload::Link(link) if link.name == name => link,
            Payload::Link(link) => {
                return Err(Error::schema(
                    "record stop",
                    format!(
                        "in-progress link is for step '{}', expected '{name}'",
                        link.name
                    ),
                ));
            }
            Payload::Layout(_) => {
                return Err(Error::schema(
                    "record stop",
                    "in-progress file holds a layout, not a link",
                ));
            }
        }
    } else {
        warn!(step = name, "no in-progress link found, recording products only");
        Link::new(name)?
    };

    link.products = ctx.resolvers.resolve_all(&ctx.products, &ctx.resolve)?;

    let keyid = ctx
        .signers
        .first()
        .map(|s| s.keyid().to_string())
        .unwrap_or_default();
    let path = ctx.sign_and_dump(link, &link_filename(name, &keyid))?;

    if side_path.exists() {
        std::fs::remove_file(&side_path).map_err(|e| Error::io(&side_path, &e))?;
    }
    Ok(path)
}

/// Convenience for tests and the verifier: assembles an in-memory link
/// for `name` by snapshotting `uris` before and after running `argv` in
/// `workdir`.
///
/// # Errors
///
/// Propagates resolver and runner errors.
pub fn snapshot_run(
    name: &str,
    uris: &[String],
    argv: &[String],
    workdir: &Path,
    timeout: Option<Duration>,
    resolvers: &ResolverSet,
    resolve: &ResolveContext,
    runner: &dyn CommandRunner,
) -> Result<(Link, bool)> {
    let materials = resolvers.resolve_all(uris, resolve)?;
    let outcome = runner.run(argv, Some(workdir), timeout, true)?;
    let products = resolvers.resolve_all(uris, resolve)?;

    let mut link = Link::new(name)?;
    link.command = argv.to_vec();
    link.materials = materials;
    link.products = products;
    link.byproducts = ByProducts {
        return_value: outcome.return_value,
        stdout: Some(outcome.stdout),
        stderr: Some(outcome.stderr),
        timeout: outcome.timed_out.then_some(true),
    };
    Ok((link, outcome.timed_out))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::crypto::registry::default_registry;
    use crate::crypto::{Key, KeySigner, KeyVal, PrivateKey};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn test_signer(seed: u8) -> (Box<dyn Signer>, Key) {
        let seed = [seed; 32];
        let sk = ed25519_dalek::SigningKey::from_bytes(&seed);
        let mut key = Key {
            keyid: String::new(),
            keytype: "ed25519".into(),
            scheme: "ed25519".into(),
            keyid_hash_algorithms: None,
            keyval: KeyVal {
                public: hex::encode(sk.verifying_key().to_bytes()),
                private: Some(PrivateKey(hex::encode(seed))),
            },
            subkeys: BTreeMap::new(),
        };
        key.ensure_keyid().unwrap();
        let signer = KeySigner::new(key.clone(), default_registry()).unwrap();
        (Box::new(signer), key.strip_private())
    }

    fn ctx_in(dir: &TempDir, seed: u8) -> (RecordContext, Key) {
        let (signer, key) = test_signer(seed);
        let ctx = RecordContext {
            signers: vec![signer],
            resolve: ResolveContext {
                base_path: Some(dir.path().to_path_buf()),
                ..ResolveContext::default()
            },
            workdir: Some(dir.path().to_path_buf()),
            out_dir: dir.path().to_path_buf(),
            ..RecordContext::default()
        };
        (ctx, key)
    }

    fn load_link(path: &Path) -> Link {
        match Metadata::load(path).unwrap().payload().unwrap() {
            Payload::Link(link) => link,
            Payload::Layout(_) => panic!("expected a link"),
        }
    }

    #[test]
    fn run_step_records_materials_command_products() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), b"input").unwrap();

        let (mut ctx, key) = ctx_in(&dir, 0x21);
        ctx.materials = vec!["in.txt".into()];
        ctx.products = vec!["out.txt".into()];

        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cp in.txt out.txt".to_string(),
        ];
        let path = run_step("build", &argv, &ctx).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            link_filename("build", &key.keyid)
        );

        let link = load_link(&path);
        assert_eq!(link.command, argv);
        assert!(link.materials.contains_key("in.txt"));
        assert!(link.products.contains_key("out.txt"));
        assert_eq!(link.byproducts.return_value, Some(0));
        // Same content, same digest.
        assert_eq!(
            link.materials.get("in.txt").unwrap().get("sha256"),
            link.products.get("out.txt").unwrap().get("sha256"),
        );
    }

    #[test]
    fn run_step_signature_verifies() {
        let dir = TempDir::new().unwrap();
        let (ctx, key) = ctx_in(&dir, 0x22);
        let path = run_step("noop", &["true".to_string()], &ctx).unwrap();

        let metadata = Metadata::load(&path).unwrap();
        let sigs = metadata.signatures().unwrap();
        assert_eq!(sigs.len(), 1);
        let result = default_registry()
            .verify_signature(&key, &metadata.signed_bytes().unwrap(), &sigs[0])
            .unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn run_step_without_signer_fails() {
        let dir = TempDir::new().unwrap();
        let (mut ctx, _) = ctx_in(&dir, 0x23);
        ctx.signers.clear();
        let err = run_step("x", &["true".to_string()], &ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn failed_start_writes_no_link() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = ctx_in(&dir, 0x24);
        let err = run_step("x", &["scw-no-such-binary-xyz".to_string()], &ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Runtime);
        let links: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "link"))
            .collect();
        assert!(links.is_empty());
    }

    #[test]
    fn empty_command_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = ctx_in(&dir, 0x25);
        let path = run_step("record-only", &[], &ctx).unwrap();
        let link = load_link(&path);
        assert!(link.command.is_empty());
        assert_eq!(link.byproducts, ByProducts::default());
    }

    #[test]
    fn timeout_recorded_in_byproducts() {
        let dir = TempDir::new().unwrap();
        let (mut ctx, _) = ctx_in(&dir, 0x26);
        ctx.timeout = Some(Duration::from_millis(100));
        let path = run_step("slow", &["sleep".to_string(), "30".to_string()], &ctx).unwrap();
        let link = load_link(&path);
        assert_eq!(link.byproducts.timeout, Some(true));
        assert_eq!(link.byproducts.return_value, None);
    }

    #[test]
    fn timeout_fatal_when_configured() {
        let dir = TempDir::new().unwrap();
        let (mut ctx, _) = ctx_in(&dir, 0x27);
        ctx.timeout = Some(Duration::from_millis(100));
        ctx.fail_on_timeout = true;
        let err = run_step("slow", &["sleep".to_string(), "30".to_string()], &ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[test]
    fn record_start_stop_roundtrip() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("src.c"), b"int main(){}").unwrap();

        let (mut ctx, _) = ctx_in(&dir, 0x28);
        ctx.materials = vec!["src.c".into()];
        let side = record_start("compile", &ctx).unwrap();
        assert!(side.file_name().unwrap().to_str().unwrap().starts_with('.'));

        // The "step" happens out of band.
        fs::write(dir.path().join("a.out"), b"\x7fELF").unwrap();

        ctx.products = vec!["a.out".into()];
        let path = record_stop("compile", &ctx).unwrap();

        let link = load_link(&path);
        assert!(link.materials.contains_key("src.c"));
        assert!(link.products.contains_key("a.out"));
        assert!(!side.exists(), "side file must be cleaned up");
    }

    #[test]
    fn record_stop_without_start_recovers() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("out.bin"), b"o").unwrap();

        let (mut ctx, _) = ctx_in(&dir, 0x29);
        ctx.products = vec!["out.bin".into()];
        let path = record_stop("orphan", &ctx).unwrap();
        let link = load_link(&path);
        assert!(link.materials.is_empty());
        assert!(link.products.contains_key("out.bin"));
    }

    #[test]
    fn record_stop_rejects_mismatched_step_name() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = ctx_in(&dir, 0x2a);
        record_start("alpha", &ctx).unwrap();

        // Rename the side file to simulate a mix-up.
        fs::rename(
            dir.path().join(unfinished_link_filename("alpha")),
            dir.path().join(unfinished_link_filename("beta")),
        )
        .unwrap();
        let err = record_stop("beta", &ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn mock_run_is_unsigned_with_plain_filename() {
        let dir = TempDir::new().unwrap();
        let (mut ctx, _) = ctx_in(&dir, 0x2b);
        ctx.signers.clear();
        let path = mock_run("trial", &["true".to_string()], &ctx).unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "trial.link");

        let metadata = Metadata::load(&path).unwrap();
        assert!(metadata.signatures().unwrap().is_empty());
    }

    #[test]
    fn environment_recorded_when_enabled() {
        let dir = TempDir::new().unwrap();
        let (mut ctx, _) = ctx_in(&dir, 0x2c);
        ctx.record_environment = true;
        let path = run_step("env-step", &[], &ctx).unwrap();
        let link = load_link(&path);
        assert!(link.environment.contains_key("workdir"));
    }
}
