//! # scw -- Supply Chain Witness
//!
//! Recording and verification of software supply chain evidence. A
//! project owner signs a **layout** declaring the pipeline's steps, the
//! functionary keys authorized to perform them, and artifact rules over
//! each step's inputs (materials) and outputs (products). Functionaries
//! record each step under an instrumentation wrapper that hashes
//! artifacts and signs the resulting **link**. A verifier replays the
//! policy: signatures, thresholds, artifact rules, inspections, and
//! nested sublayouts.
//!
//! ## Security Properties
//!
//! - **`#![forbid(unsafe_code)]`**: No `unsafe` blocks anywhere in scw.
//! - **Canonical signing bytes**: Signatures are made and checked over
//!   the deterministic encoding in [`canonical`], never over whatever
//!   happened to be on disk.
//! - **Defensive input handling**: All metadata file I/O is
//!   symlink-checked and size-bounded via [`fs_guard::read_validated`].
//! - **No shell**: Recorded commands and inspections run via
//!   `std::process::Command` with an argument vector; no shell is ever
//!   invoked.
//! - **Delegated crypto primitives**: Signing and verification use the
//!   `ed25519-dalek` and RustCrypto (`rsa`, `p256`, `p384`) crates; scw
//!   itself only orchestrates scheme dispatch and keyid derivation.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`canonical`] | Deterministic byte encoding for signing |
//! | [`crypto`] | Signer/verifier adapter, keyids, scheme registry |
//! | [`models`] | Layout, link, rule, and wrapper data model |
//! | [`resolver`] | Artifact hashing: file/dir/ostree schemes, excludes |
//! | [`record`] | Recording engine: run, record-start/stop, mock |
//! | [`rules`] | Queue-based artifact-rule engine |
//! | [`verify`] | Verification pipeline incl. sublayout recursion |
//! | [`runner`] | Child-process execution with timeout and capture |
//! | [`fs_guard`] | Symlink-safe, size-bounded metadata reads |
//! | [`error`] | Stable error taxonomy with machine tags |

#![forbid(unsafe_code)]

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod fs_guard;
pub mod models;
pub mod record;
pub mod resolver;
pub mod rules;
pub mod runner;
pub mod verify;

pub use error::{Error, ErrorKind, Result};
