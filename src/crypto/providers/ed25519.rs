//! Ed25519 signing and verification provider using `ed25519-dalek`.
//!
//! Handles the `ed25519` scheme and its OpenPGP variant
//! `pgp+eddsa-ed25519` (same curve, same wire verification; the variant
//! differs only in how the key is identified). Key material is hex:
//! 32-byte public keys, 32-byte private seeds.
//!
//! ## Security
//!
//! Uses `verify_strict()` which rejects weak public keys and non-canonical
//! signatures. This is the recommended verification mode for new
//! applications.

use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, VerifyingKey};

use crate::crypto::errors::CryptoError;
use crate::crypto::{Key, SignatureBytes, SignatureProvider, VerificationResult};

/// Ed25519 provider backed by `ed25519-dalek`.
pub struct Ed25519Provider;

const SCHEMES: &[&str] = &["ed25519", "pgp+eddsa-ed25519"];

fn decode_hex_32(field: &str, value: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(value)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("{field} is not hex: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKeyMaterial(format!(
            "{field} must be 32 bytes, got {}",
            bytes.len()
        ))
    })
}

impl SignatureProvider for Ed25519Provider {
    fn provider_id(&self) -> &'static str {
        "ed25519-dalek"
    }

    fn schemes(&self) -> &'static [&'static str] {
        SCHEMES
    }

    fn verify(
        &self,
        key: &Key,
        message: &[u8],
        signature: &SignatureBytes,
    ) -> Result<VerificationResult, CryptoError> {
        let pk_bytes = decode_hex_32("ed25519 public key", &key.keyval.public)?;
        let vk = VerifyingKey::from_bytes(&pk_bytes).map_err(|e| {
            CryptoError::InvalidKeyMaterial(format!("invalid ed25519 public key: {e}"))
        })?;

        let sig = DalekSignature::try_from(signature.0.as_slice()).map_err(|e| {
            CryptoError::InvalidSignatureEncoding(format!("malformed ed25519 signature: {e}"))
        })?;

        // Strict verification rejects weak keys and non-canonical
        // signatures; the final point comparison is constant-time.
        match vk.verify_strict(message, &sig) {
            Ok(()) => Ok(VerificationResult::Valid),
            Err(_) => Ok(VerificationResult::Invalid {
                reason: "ed25519 signature verification failed".into(),
            }),
        }
    }

    fn sign(&self, key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
        let private = key.keyval.private.as_ref().ok_or_else(|| {
            CryptoError::SigningFailed {
                scheme: key.scheme.clone(),
                reason: "key has no private material".into(),
            }
        })?;
        let seed = decode_hex_32("ed25519 private key", &private.0)?;
        let sk = SigningKey::from_bytes(&seed);
        let sig = sk.sign(message);
        Ok(SignatureBytes(sig.to_bytes().to_vec()))
    }
}
