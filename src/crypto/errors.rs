//! Cryptographic error types for scw's signing and verification layer.
//!
//! All errors from the crypto subsystem are represented by [`CryptoError`],
//! which is designed to be informative for operators without leaking
//! sensitive internal state (no key material in error messages).

use std::fmt;

/// Errors produced by scw cryptographic operations.
///
/// These errors describe *what* failed (scheme mismatch, verification
/// failure) but never include raw key bytes or signature data in their
/// `Display` output. This prevents accidental leakage via logs or reports.
#[derive(Debug, Clone)]
pub enum CryptoError {
    /// The requested signature scheme has no registered provider.
    UnsupportedScheme(String),

    /// Signature verification failed (signature is invalid for the given
    /// message and public key). This is a *normal* outcome for tampered
    /// data and must not be treated as a bug.
    VerificationFailed {
        /// Which scheme was used.
        scheme: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Signing failed (missing private key, provider failure).
    SigningFailed {
        /// Which scheme was used.
        scheme: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Key material is malformed (wrong length, invalid encoding).
    InvalidKeyMaterial(String),

    /// A signature value could not be decoded (bad hex/base64, wrong size).
    InvalidSignatureEncoding(String),

    /// An internal provider error that doesn't fit other categories.
    ProviderError(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedScheme(scheme) => {
                write!(f, "unsupported signature scheme: {scheme}")
            }
            Self::VerificationFailed { scheme, reason } => {
                write!(f, "verification failed ({scheme}): {reason}")
            }
            Self::SigningFailed { scheme, reason } => {
                write!(f, "signing failed ({scheme}): {reason}")
            }
            Self::InvalidKeyMaterial(msg) => {
                write!(f, "invalid key material: {msg}")
            }
            Self::InvalidSignatureEncoding(msg) => {
                write!(f, "invalid signature encoding: {msg}")
            }
            Self::ProviderError(msg) => write!(f, "provider error: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}
