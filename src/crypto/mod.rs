//! Signing and verification layer for scw metadata.
//!
//! Layouts and links are signed wrappers; this module owns everything
//! between "bytes to sign" and "signature checks out":
//!
//! - The [`Key`] descriptor -- the public-key shape embedded in layouts,
//!   including OpenPGP primary/sub-key association.
//! - Keyid derivation: the hex SHA-256 of the canonical encoding of the
//!   public-key descriptor. OpenPGP keys carry their 40-hex fingerprint
//!   instead.
//! - The [`Signer`] capability handed to the recording engine, and the
//!   [`SignatureProvider`] trait concrete backends implement.
//!
//! Scheme selection is data-driven: a key names its scheme, the
//! [`registry::Registry`] routes the operation to the matching provider.
//! Nothing in the rest of the crate calls an algorithm-specific function
//! directly.

#![forbid(unsafe_code)]

pub mod errors;
pub mod providers;
pub mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use errors::CryptoError;

/// Opaque wrapper for decoded signature bytes. Does not implement `Display`
/// to keep raw signature data out of logs.
#[derive(Clone)]
pub struct SignatureBytes(pub Vec<u8>);

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureBytes([{} bytes])", self.0.len())
    }
}

/// Private key material, hex or PEM encoded. Zeroized on drop and redacted
/// in `Debug` output. Never serialized back into metadata.
#[derive(Clone, PartialEq, Eq, Deserialize, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
#[serde(transparent)]
pub struct PrivateKey(pub String);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// Public (and optionally private) key value as carried in metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    /// Encoded public key: hex for ed25519, PEM (or base64 DER) for RSA
    /// and ECDSA.
    pub public: String,
    /// Private half, present only on keys loaded for signing. Never
    /// written back out.
    #[serde(default, skip_serializing)]
    pub private: Option<PrivateKey>,
}

/// A public-key descriptor as it appears in a layout's `keys` table or a
/// key file on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Hex fingerprint identifying this key. Computed from the descriptor
    /// for non-PGP keys; the 40-hex OpenPGP fingerprint otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keyid: String,
    /// Key family: `rsa`, `ed25519`, `ecdsa`.
    pub keytype: String,
    /// Signature scheme, e.g. `rsassa-pss-sha256`, `ed25519`,
    /// `ecdsa-sha2-nistp256`, `pgp+eddsa-ed25519`.
    pub scheme: String,
    /// Hash algorithms the issuer used for keyid derivation. Carried
    /// through canonicalization so keyids recompute identically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyid_hash_algorithms: Option<Vec<String>>,
    /// The key material.
    pub keyval: KeyVal,
    /// OpenPGP sub-keys attached to this primary, keyed by their own
    /// fingerprint. Empty for non-PGP keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subkeys: BTreeMap<String, Key>,
}

impl Key {
    /// Returns `true` for OpenPGP key descriptors, which carry externally
    /// assigned fingerprints instead of computed keyids.
    pub fn is_pgp(&self) -> bool {
        self.scheme.starts_with("pgp+")
    }

    /// Computes the keyid for this descriptor: the lowercase-hex SHA-256 of
    /// the canonical encoding of the public portion.
    ///
    /// OpenPGP keys do not derive their id; for those the stored 40-hex
    /// fingerprint is returned (or an error if absent).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] for a PGP key without a
    /// fingerprint or a descriptor that cannot be canonically encoded.
    pub fn compute_keyid(&self) -> Result<String, CryptoError> {
        if self.is_pgp() {
            if self.keyid.len() == 40 && self.keyid.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(self.keyid.to_lowercase());
            }
            return Err(CryptoError::InvalidKeyMaterial(
                "pgp key requires a 40-hex fingerprint as keyid".into(),
            ));
        }

        // The private half is represented as the empty string in the
        // canonical form so that public-only and signing copies of the
        // same key derive the same id.
        let mut descriptor = serde_json::json!({
            "keytype": self.keytype,
            "scheme": self.scheme,
            "keyval": { "public": self.keyval.public, "private": "" },
        });
        if let (Some(obj), Some(algos)) =
            (descriptor.as_object_mut(), &self.keyid_hash_algorithms)
        {
            obj.insert("keyid_hash_algorithms".into(), serde_json::json!(algos));
        }

        let bytes = crate::canonical::encode_canonical(&descriptor)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Fills in `keyid` from [`Key::compute_keyid`] if it is empty, and
    /// returns the id.
    ///
    /// # Errors
    ///
    /// Propagates [`Key::compute_keyid`] failures.
    pub fn ensure_keyid(&mut self) -> Result<String, CryptoError> {
        if self.keyid.is_empty() {
            self.keyid = self.compute_keyid()?;
        }
        Ok(self.keyid.clone())
    }

    /// Resolves a signature keyid against this key: returns the descriptor
    /// to verify with if `keyid` names this key or one of its sub-keys.
    ///
    /// A sub-key signature satisfies an authorization that names the
    /// primary, which is why resolution starts here rather than in a flat
    /// keyid table.
    pub fn resolve_signing_key(&self, keyid: &str) -> Option<&Key> {
        if self.keyid == keyid {
            return Some(self);
        }
        self.subkeys.get(keyid)
    }

    /// Returns a copy of this key with all private material removed, for
    /// embedding in a layout.
    pub fn strip_private(&self) -> Key {
        let mut out = self.clone();
        out.keyval.private = None;
        for sub in out.subkeys.values_mut() {
            sub.keyval.private = None;
        }
        out
    }
}

/// A single signature over a metadata payload.
///
/// `sig` is lowercase hex in the classic wrapper; the envelope wrapper
/// transcodes to base64 on disk but this in-memory form is always hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Keyid of the public key that verifies this signature.
    pub keyid: String,
    /// Hex-encoded signature bytes.
    pub sig: String,
    /// Optional signing certificate (PEM), carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
}

/// Result of a signature verification operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationResult {
    /// Signature is valid.
    Valid,
    /// Signature is well-formed but does not match the message and key.
    Invalid {
        /// Human-readable reason for the failure.
        reason: String,
    },
}

impl VerificationResult {
    /// Returns `true` if the verification passed.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Concrete backend for one or more signature schemes.
///
/// Providers are registered with the [`registry::Registry`] at startup and
/// selected by the scheme named in the key descriptor.
pub trait SignatureProvider: Send + Sync {
    /// Unique identifier for this provider (e.g. `"ed25519-dalek"`).
    fn provider_id(&self) -> &'static str;

    /// Scheme identifiers this provider handles.
    fn schemes(&self) -> &'static [&'static str];

    /// Verifies `signature` over `message` with the public half of `key`.
    ///
    /// Returns `Ok(VerificationResult::Invalid { .. })` for a well-formed
    /// but non-matching signature; `Err` only when the operation itself
    /// cannot be carried out (bad key material, unsupported scheme).
    fn verify(
        &self,
        key: &Key,
        message: &[u8],
        signature: &SignatureBytes,
    ) -> Result<VerificationResult, CryptoError>;

    /// Signs `message` with the private half of `key`.
    fn sign(&self, key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError>;
}

/// Capability to sign metadata payload bytes, as handed to the recording
/// engine. One signer per functionary key.
pub trait Signer: Send + Sync {
    /// Keyid of the key this signer uses.
    fn keyid(&self) -> &str;

    /// Signs the payload bytes, returning a wire [`Signature`].
    fn sign(&self, message: &[u8]) -> Result<Signature, CryptoError>;
}

/// [`Signer`] backed by a [`Key`] with private material and a provider
/// registry.
pub struct KeySigner {
    key: Key,
    registry: std::sync::Arc<registry::Registry>,
}

impl KeySigner {
    /// Builds a signer from a key descriptor carrying private material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SigningFailed`] if the key has no private
    /// half, or key material errors from keyid derivation.
    pub fn new(
        mut key: Key,
        registry: std::sync::Arc<registry::Registry>,
    ) -> Result<Self, CryptoError> {
        if key.keyval.private.is_none() {
            return Err(CryptoError::SigningFailed {
                scheme: key.scheme.clone(),
                reason: "key has no private material".into(),
            });
        }
        key.ensure_keyid()?;
        Ok(Self { key, registry })
    }

    /// The public portion of the signing key.
    pub fn public_key(&self) -> Key {
        self.key.strip_private()
    }
}

impl Signer for KeySigner {
    fn keyid(&self) -> &str {
        &self.key.keyid
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, CryptoError> {
        let sig = self.registry.sign(&self.key, message)?;
        Ok(Signature {
            keyid: self.key.keyid.clone(),
            sig: hex::encode(&sig.0),
            cert: None,
        })
    }
}
