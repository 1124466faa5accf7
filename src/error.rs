//! Error taxonomy for scw -- stable machine tags over every failure mode.
//!
//! Every fatal condition in recording or verification maps to exactly one
//! [`ErrorKind`]. The kind is the machine-readable contract: callers (and the
//! CLI exit-code policy) dispatch on it, while the `Display` output carries
//! the human message and structural context (step name, rule index, path).
//!
//! Messages never include key material or signature bytes. What failed is
//! described; the secret inputs that failed are not echoed.

use std::fmt;
use std::path::PathBuf;

use crate::crypto::CryptoError;

/// Machine tag for an [`Error`]. Stable across releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Signature invalid, key unknown, or key malformed.
    Crypto,
    /// Fewer than `threshold` agreeing valid links for a step.
    Threshold,
    /// An artifact rule directed failure.
    Rule,
    /// Layout past its expiration timestamp.
    Expired,
    /// Payload failed model validation (unknown rule, bad types, bad names).
    Schema,
    /// Evidence or artifact file missing or unreadable.
    Io,
    /// Child process failed to start or returned non-zero where zero was required.
    Runtime,
    /// A command exceeded its configured timeout.
    Timeout,
}

impl ErrorKind {
    /// Returns the stable lowercase tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::Threshold => "threshold",
            Self::Rule => "rule",
            Self::Expired => "expired",
            Self::Schema => "schema",
            Self::Io => "io",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Errors produced by scw recording and verification.
///
/// Variants carry the structural context needed to act on the failure
/// without parsing the message text.
#[derive(Debug)]
pub enum Error {
    /// A cryptographic operation failed in a way that is fatal for the
    /// caller (layout signature rejected, signer failure). Per-link
    /// verification failures are *not* surfaced here; they only discard
    /// the link and may later cause [`Error::Threshold`].
    Crypto {
        /// What was being signed or verified.
        context: String,
        /// Underlying crypto error.
        source: CryptoError,
    },

    /// A step has fewer than `threshold` agreeing valid links.
    Threshold {
        /// Step name.
        step: String,
        /// Required number of agreeing links.
        required: u32,
        /// Agreeing valid links actually found.
        found: usize,
        /// Human-readable detail (e.g. why candidates were discarded).
        reason: String,
    },

    /// An artifact rule directed failure.
    Rule {
        /// Step or inspection name the rule belongs to.
        step: String,
        /// `"materials"` or `"products"`.
        side: &'static str,
        /// Zero-based index of the failing rule in its list.
        rule_index: usize,
        /// Human-readable detail including the offending paths.
        reason: String,
    },

    /// The layout is past its expiration timestamp.
    Expired {
        /// The layout's `expires` value as recorded.
        expires: String,
    },

    /// Payload failed model validation.
    Schema {
        /// What was being validated (file, field, rule).
        context: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A file was missing or unreadable.
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O detail.
        reason: String,
    },

    /// A child process failed to start or exited non-zero where success
    /// was required (inspections).
    Runtime {
        /// Step or inspection name, or the command context.
        context: String,
        /// What happened.
        reason: String,
    },

    /// A command exceeded its configured timeout.
    Timeout {
        /// Step or inspection name.
        context: String,
        /// Configured timeout in seconds.
        timeout_secs: u64,
    },
}

impl Error {
    /// Returns the machine tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto { .. } => ErrorKind::Crypto,
            Self::Threshold { .. } => ErrorKind::Threshold,
            Self::Rule { .. } => ErrorKind::Rule,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Io { .. } => ErrorKind::Io,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Shorthand constructor for schema violations.
    pub fn schema(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand constructor for I/O failures.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto { context, source } => {
                write!(f, "[crypto] {context}: {source}")
            }
            Self::Threshold {
                step,
                required,
                found,
                reason,
            } => {
                write!(
                    f,
                    "[threshold] step '{step}' requires {required} agreeing authorized links, found {found}: {reason}"
                )
            }
            Self::Rule {
                step,
                side,
                rule_index,
                reason,
            } => {
                write!(
                    f,
                    "[rule] step '{step}' {side} rule #{rule_index} failed: {reason}"
                )
            }
            Self::Expired { expires } => {
                write!(f, "[expired] layout expired at {expires}")
            }
            Self::Schema { context, reason } => {
                write!(f, "[schema] {context}: {reason}")
            }
            Self::Io { path, reason } => {
                write!(f, "[io] {}: {reason}", path.display())
            }
            Self::Runtime { context, reason } => {
                write!(f, "[runtime] {context}: {reason}")
            }
            Self::Timeout {
                context,
                timeout_secs,
            } => {
                write!(f, "[timeout] {context}: exceeded {timeout_secs}s")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;
