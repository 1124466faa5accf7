//! scw CLI binary -- Supply Chain Witness command-line interface.
//!
//! Entry point for `scw run`, `scw record`, `scw verify`, `scw sign`, and
//! `scw mock`. The binary is a thin shell over the library: it parses
//! arguments (via `clap` derive), loads JSON key files, builds the
//! per-invocation context values, and maps errors to exit codes:
//!
//! - `0` -- success.
//! - `1` -- verification failure (policy violation: rule, threshold,
//!   expiry, signature).
//! - `2` -- invalid input (malformed metadata, missing files, command
//!   could not run).
//!
//! Commands are executed via `std::process::Command` with arguments as
//! separate OS strings -- no shell is invoked, so shell injection is
//! structurally impossible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use scw::crypto::registry::default_registry;
use scw::crypto::{Key, KeySigner, Signer};
use scw::error::ErrorKind;
use scw::models::metadata::{Metadata, MetadataFormat};
use scw::record::{self, RecordContext};
use scw::resolver::{ExcludeFilter, HashAlgorithm, ResolveContext};
use scw::verify::{verify, VerificationRequest};

/// Maximum size for JSON key files. Public-key descriptors are tiny;
/// anything larger is not a key file.
const MAX_KEY_BYTES: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "scw", about = "Supply Chain Witness", version)]
struct Cli {
    /// Verbose pipeline logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WrapperFormat {
    Classic,
    Envelope,
}

impl From<WrapperFormat> for MetadataFormat {
    fn from(value: WrapperFormat) -> Self {
        match value {
            WrapperFormat::Classic => Self::Classic,
            WrapperFormat::Envelope => Self::Envelope,
        }
    }
}

/// Recording knobs shared by `run`, `record`, and `mock`.
#[derive(Args)]
struct RecordingArgs {
    /// Step name the link attests.
    #[arg(short, long)]
    name: String,

    /// Material path or URI (repeatable).
    #[arg(short, long = "materials")]
    materials: Vec<String>,

    /// Product path or URI (repeatable).
    #[arg(short, long = "products")]
    products: Vec<String>,

    /// Gitignore-style exclude pattern (repeatable).
    #[arg(long = "exclude")]
    exclude_patterns: Vec<String>,

    /// Record artifact paths relative to this directory.
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Hash algorithms to record (sha256, sha512).
    #[arg(long = "hash-algorithm", default_values = ["sha256"])]
    hash_algorithms: Vec<String>,

    /// Follow symlinked directories while hashing.
    #[arg(long)]
    follow_symlink_dirs: bool,

    /// Normalize \r\n to \n before hashing (text artifacts).
    #[arg(long)]
    normalize_line_endings: bool,

    /// Directory to write the link file to.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

impl RecordingArgs {
    fn resolve_context(&self) -> Result<ResolveContext> {
        let mut algorithms = Vec::new();
        for name in &self.hash_algorithms {
            algorithms.push(
                HashAlgorithm::from_name(name)
                    .ok_or_else(|| anyhow!("unsupported hash algorithm '{name}'"))?,
            );
        }
        Ok(ResolveContext {
            hash_algorithms: algorithms,
            exclude: ExcludeFilter::new(&self.exclude_patterns)?,
            base_path: self.base_path.clone(),
            follow_symlink_dirs: self.follow_symlink_dirs,
            normalize_line_endings: self.normalize_line_endings,
        })
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Record a step: hash materials, run the command, hash products,
    /// sign, and write the link file.
    Run {
        #[command(flatten)]
        recording: RecordingArgs,

        /// Signing key file (JSON descriptor with private material,
        /// repeatable; the first key names the output file).
        #[arg(short, long = "key", required = true)]
        keys: Vec<PathBuf>,

        /// Command timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Treat a timeout as fatal instead of recording it.
        #[arg(long)]
        fail_on_timeout: bool,

        /// Do not capture stdout/stderr into byproducts.
        #[arg(long)]
        no_capture: bool,

        /// Record the working directory into the link's environment.
        #[arg(long)]
        record_environment: bool,

        /// Wrapper shape for the written link.
        #[arg(long, value_enum, default_value_t = WrapperFormat::Classic)]
        format: WrapperFormat,

        /// Working directory for the command.
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// The command to wrap.
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Split recording around a manually executed step.
    Record {
        #[command(subcommand)]
        phase: RecordPhase,
    },

    /// Verify a final product against a signed layout and its evidence.
    Verify {
        /// Path to the signed layout.
        #[arg(short, long)]
        layout: PathBuf,

        /// Project owner public key file (repeatable).
        #[arg(short = 'k', long = "layout-key", required = true)]
        layout_keys: Vec<PathBuf>,

        /// Evidence directory (defaults to the layout's directory).
        #[arg(short, long)]
        evidence_dir: Option<PathBuf>,

        /// Parameter substitution NAME=VALUE (repeatable).
        #[arg(long = "sub")]
        substitutions: Vec<String>,

        /// Minimum number of owner keys that must have signed the layout.
        #[arg(long, default_value_t = 1)]
        min_owner_sigs: u32,

        /// Exclude pattern applied when inspections snapshot the
        /// evidence directory (repeatable).
        #[arg(long = "exclude")]
        exclude_patterns: Vec<String>,

        /// Timeout in seconds for each inspection command.
        #[arg(long)]
        inspection_timeout: Option<u64>,
    },

    /// Re-sign a metadata file.
    Sign {
        /// Metadata file to sign.
        #[arg(short, long)]
        file: PathBuf,

        /// Signing key file (repeatable).
        #[arg(short, long = "key", required = true)]
        keys: Vec<PathBuf>,

        /// Append to existing signatures instead of replacing them.
        #[arg(short, long)]
        append: bool,

        /// Output path (defaults to signing in place).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Like `run`, but unsigned: a dry-run link for layout authoring.
    Mock {
        #[command(flatten)]
        recording: RecordingArgs,

        /// The command to wrap.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RecordPhase {
    /// Hash materials into an in-progress side file.
    Start {
        #[command(flatten)]
        recording: RecordingArgs,

        /// Signing key file (repeatable).
        #[arg(short, long = "key", required = true)]
        keys: Vec<PathBuf>,
    },
    /// Hash products, merge with the side file, sign the final link.
    Stop {
        #[command(flatten)]
        recording: RecordingArgs,

        /// Signing key file (repeatable).
        #[arg(short, long = "key", required = true)]
        keys: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let is_verify = matches!(cli.cmd, Cmd::Verify { .. });
    match dispatch(cli.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("✗ {err:#}");
            ExitCode::from(exit_code_for(&err, is_verify))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "scw=debug" } else { "scw=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Maps an error chain to the exit-code contract. Policy violations are
/// `1` but only where policy was being evaluated (`verify`); every
/// failure while producing evidence is an input problem (`2`).
fn exit_code_for(err: &anyhow::Error, is_verify: bool) -> u8 {
    if !is_verify {
        return 2;
    }
    match err.downcast_ref::<scw::Error>().map(scw::Error::kind) {
        Some(
            ErrorKind::Rule
            | ErrorKind::Threshold
            | ErrorKind::Expired
            | ErrorKind::Crypto
            | ErrorKind::Runtime
            | ErrorKind::Timeout,
        ) => 1,
        _ => 2,
    }
}

fn dispatch(cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Run {
            recording,
            keys,
            timeout,
            fail_on_timeout,
            no_capture,
            record_environment,
            format,
            workdir,
            command,
        } => {
            let ctx = RecordContext {
                materials: recording.materials.clone(),
                products: recording.products.clone(),
                signers: load_signers(&keys)?,
                resolve: recording.resolve_context()?,
                workdir,
                timeout: timeout.map(Duration::from_secs),
                capture_streams: !no_capture,
                fail_on_timeout,
                record_environment,
                format: format.into(),
                out_dir: recording.out_dir.clone(),
                ..RecordContext::default()
            };
            let path = record::run_step(&recording.name, &command, &ctx)?;
            println!("→ Link: {}", path.display());
            Ok(())
        }

        Cmd::Record { phase } => match phase {
            RecordPhase::Start { recording, keys } => {
                let ctx = RecordContext {
                    materials: recording.materials.clone(),
                    signers: load_signers(&keys)?,
                    resolve: recording.resolve_context()?,
                    out_dir: recording.out_dir.clone(),
                    ..RecordContext::default()
                };
                let path = record::record_start(&recording.name, &ctx)?;
                println!("→ In-progress link: {}", path.display());
                Ok(())
            }
            RecordPhase::Stop { recording, keys } => {
                let ctx = RecordContext {
                    products: recording.products.clone(),
                    signers: load_signers(&keys)?,
                    resolve: recording.resolve_context()?,
                    out_dir: recording.out_dir.clone(),
                    ..RecordContext::default()
                };
                let path = record::record_stop(&recording.name, &ctx)?;
                println!("→ Link: {}", path.display());
                Ok(())
            }
        },

        Cmd::Verify {
            layout,
            layout_keys,
            evidence_dir,
            substitutions,
            min_owner_sigs,
            exclude_patterns,
            inspection_timeout,
        } => {
            let mut request = VerificationRequest::new(
                layout,
                layout_keys
                    .iter()
                    .map(|p| load_key(p))
                    .collect::<Result<Vec<_>>>()?,
            );
            if let Some(dir) = evidence_dir {
                request.evidence_dir = dir;
            }
            request.substitutions = parse_substitutions(&substitutions)?;
            request.min_owner_sigs = min_owner_sigs;
            request.exclude_patterns = exclude_patterns;
            request.inspection_timeout = inspection_timeout.map(Duration::from_secs);

            let report = verify(&request)?;
            for warning in &report.warnings {
                eprintln!("⚠ {warning}");
            }
            println!("✓ verification passed");
            Ok(())
        }

        Cmd::Sign {
            file,
            keys,
            append,
            output,
        } => {
            let mut metadata = Metadata::load(&file)?;
            if !append {
                metadata.clear_signatures();
            }
            for signer in load_signers(&keys)? {
                metadata.sign_with(signer.as_ref())?;
            }
            let target = output.unwrap_or(file);
            metadata.dump(&target)?;
            println!("→ Signed: {}", target.display());
            Ok(())
        }

        Cmd::Mock { recording, command } => {
            let ctx = RecordContext {
                materials: recording.materials.clone(),
                products: recording.products.clone(),
                resolve: recording.resolve_context()?,
                out_dir: recording.out_dir.clone(),
                ..RecordContext::default()
            };
            let path = record::mock_run(&recording.name, &command, &ctx)?;
            println!("→ Unsigned link: {}", path.display());
            Ok(())
        }
    }
}

/// Loads a JSON key descriptor, deriving its keyid if absent.
fn load_key(path: &Path) -> Result<Key> {
    let bytes = scw::fs_guard::read_validated(path, MAX_KEY_BYTES)
        .with_context(|| format!("loading key {}", path.display()))?;
    let mut key: Key = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing key {}", path.display()))?;
    key.ensure_keyid()
        .map_err(|e| anyhow!("deriving keyid for {}: {e}", path.display()))?;
    Ok(key)
}

fn load_signers(paths: &[PathBuf]) -> Result<Vec<Box<dyn Signer>>> {
    let registry = default_registry();
    let mut signers: Vec<Box<dyn Signer>> = Vec::with_capacity(paths.len());
    for path in paths {
        let key = load_key(path)?;
        let signer = KeySigner::new(key, registry.clone())
            .map_err(|e| anyhow!("unusable signing key {}: {e}", path.display()))?;
        signers.push(Box::new(signer));
    }
    Ok(signers)
}

fn parse_substitutions(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("substitution '{pair}' is not NAME=VALUE"))?;
        out.insert(name.to_string(), value.to_string());
    }
    Ok(out)
}
