//! RustCrypto-backed provider for RSA-PSS and ECDSA schemes.
//!
//! Implements signing and verification for:
//! - **RSASSA-PSS / SHA-256** (`rsassa-pss-sha256`, `pgp+rsa-pss`)
//! - **ECDSA P-256 / SHA-256** (`ecdsa-sha2-nistp256`)
//! - **ECDSA P-384 / SHA-384** (`ecdsa-sha2-nistp384`)
//!
//! All implementations are pure Rust with no C FFI and no `unsafe` code.
//! Key material arrives as PEM (SPKI public, PKCS#8 private) or base64
//! DER in the key descriptor's `keyval`; full key-file formats remain the
//! caller's concern.
//!
//! ECDSA signatures are DER-encoded on the wire; fixed-size encodings are
//! accepted on verify for interoperability.

use base64::Engine as _;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use signature::{RandomizedSigner, SignatureEncoding, Signer as _, Verifier};

use crate::crypto::errors::CryptoError;
use crate::crypto::{Key, SignatureBytes, SignatureProvider, VerificationResult};

/// RustCrypto provider for RSA-PSS and ECDSA.
pub struct RustCryptoProvider;

const SCHEMES: &[&str] = &[
    "rsassa-pss-sha256",
    "pgp+rsa-pss",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
];

/// Decodes a `keyval` entry into DER bytes: PEM bodies are passed to the
/// key parsers directly (`None`), anything else is treated as base64 DER.
fn der_or_pem(value: &str) -> Result<Option<Vec<u8>>, CryptoError> {
    if value.contains("-----BEGIN") {
        return Ok(None);
    }
    let cleaned: String = value.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map(Some)
        .map_err(|e| {
            CryptoError::InvalidKeyMaterial(format!("key is neither PEM nor base64 DER: {e}"))
        })
}

fn rsa_public(key: &Key) -> Result<RsaPublicKey, CryptoError> {
    match der_or_pem(&key.keyval.public)? {
        None => RsaPublicKey::from_public_key_pem(&key.keyval.public),
        Some(der) => RsaPublicKey::from_public_key_der(&der),
    }
    .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid rsa public key: {e}")))
}

fn rsa_private(key: &Key) -> Result<RsaPrivateKey, CryptoError> {
    let private = key
        .keyval
        .private
        .as_ref()
        .ok_or_else(|| CryptoError::SigningFailed {
            scheme: key.scheme.clone(),
            reason: "key has no private material".into(),
        })?;
    let parsed = match der_or_pem(&private.0)? {
        None => RsaPrivateKey::from_pkcs8_pem(&private.0)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&private.0))
            .map_err(|e| e.to_string()),
        Some(der) => RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid rsa private key: {e}")))
}

fn verify_rsa_pss(
    key: &Key,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<VerificationResult, CryptoError> {
    let vk = rsa::pss::VerifyingKey::<Sha256>::new(rsa_public(key)?);
    let sig = rsa::pss::Signature::try_from(signature.0.as_slice()).map_err(|e| {
        CryptoError::InvalidSignatureEncoding(format!("malformed rsa-pss signature: {e}"))
    })?;
    match vk.verify(message, &sig) {
        Ok(()) => Ok(VerificationResult::Valid),
        Err(_) => Ok(VerificationResult::Invalid {
            reason: "rsa-pss signature verification failed".into(),
        }),
    }
}

fn sign_rsa_pss(key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
    // Blinded signing protects the private key from timing side channels;
    // the salt length defaults to the digest size.
    let sk = rsa::pss::BlindedSigningKey::<Sha256>::new(rsa_private(key)?);
    let sig = sk.sign_with_rng(&mut rand::thread_rng(), message);
    Ok(SignatureBytes(sig.to_vec()))
}

fn verify_p256(
    key: &Key,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<VerificationResult, CryptoError> {
    let vk = match der_or_pem(&key.keyval.public)? {
        None => p256::ecdsa::VerifyingKey::from_public_key_pem(&key.keyval.public),
        Some(der) => p256::ecdsa::VerifyingKey::from_public_key_der(&der),
    }
    .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid p-256 public key: {e}")))?;

    let sig = p256::ecdsa::Signature::from_der(&signature.0)
        .or_else(|_| p256::ecdsa::Signature::from_slice(&signature.0))
        .map_err(|e| {
            CryptoError::InvalidSignatureEncoding(format!("malformed p-256 signature: {e}"))
        })?;
    match vk.verify(message, &sig) {
        Ok(()) => Ok(VerificationResult::Valid),
        Err(_) => Ok(VerificationResult::Invalid {
            reason: "ecdsa p-256 signature verification failed".into(),
        }),
    }
}

fn sign_p256(key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
    let private = key
        .keyval
        .private
        .as_ref()
        .ok_or_else(|| CryptoError::SigningFailed {
            scheme: key.scheme.clone(),
            reason: "key has no private material".into(),
        })?;
    let sk = match der_or_pem(&private.0)? {
        None => p256::ecdsa::SigningKey::from_pkcs8_pem(&private.0),
        Some(der) => p256::ecdsa::SigningKey::from_pkcs8_der(&der),
    }
    .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid p-256 private key: {e}")))?;
    // RFC 6979 deterministic nonces; SHA-256 is the curve's paired digest.
    let sig: p256::ecdsa::Signature = sk.sign(message);
    Ok(SignatureBytes(sig.to_der().as_bytes().to_vec()))
}

fn verify_p384(
    key: &Key,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<VerificationResult, CryptoError> {
    let vk = match der_or_pem(&key.keyval.public)? {
        None => p384::ecdsa::VerifyingKey::from_public_key_pem(&key.keyval.public),
        Some(der) => p384::ecdsa::VerifyingKey::from_public_key_der(&der),
    }
    .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid p-384 public key: {e}")))?;

    let sig = p384::ecdsa::Signature::from_der(&signature.0)
        .or_else(|_| p384::ecdsa::Signature::from_slice(&signature.0))
        .map_err(|e| {
            CryptoError::InvalidSignatureEncoding(format!("malformed p-384 signature: {e}"))
        })?;
    match vk.verify(message, &sig) {
        Ok(()) => Ok(VerificationResult::Valid),
        Err(_) => Ok(VerificationResult::Invalid {
            reason: "ecdsa p-384 signature verification failed".into(),
        }),
    }
}

fn sign_p384(key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
    let private = key
        .keyval
        .private
        .as_ref()
        .ok_or_else(|| CryptoError::SigningFailed {
            scheme: key.scheme.clone(),
            reason: "key has no private material".into(),
        })?;
    let sk = match der_or_pem(&private.0)? {
        None => p384::ecdsa::SigningKey::from_pkcs8_pem(&private.0),
        Some(der) => p384::ecdsa::SigningKey::from_pkcs8_der(&der),
    }
    .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid p-384 private key: {e}")))?;
    let sig: p384::ecdsa::Signature = sk.sign(message);
    Ok(SignatureBytes(sig.to_der().as_bytes().to_vec()))
}

impl SignatureProvider for RustCryptoProvider {
    fn provider_id(&self) -> &'static str {
        "rustcrypto"
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
        match key.scheme.as_str() {
            "rsassa-pss-sha256" | "pgp+rsa-pss" => verify_rsa_pss(key, message, signature),
            "ecdsa-sha2-nistp256" => verify_p256(key, message, signature),
            "ecdsa-sha2-nistp384" => verify_p384(key, message, signature),
            other => Err(CryptoError::UnsupportedScheme(other.into())),
        }
    }

    fn sign(&self, key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
        match key.scheme.as_str() {
            "rsassa-pss-sha256" | "pgp+rsa-pss" => sign_rsa_pss(key, message),
            "ecdsa-sha2-nistp256" => sign_p256(key, message),
            "ecdsa-sha2-nistp384" => sign_p384(key, message),
            other => Err(CryptoError::UnsupportedScheme(other.into())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::{KeyVal, PrivateKey};
    use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use std::collections::BTreeMap;

    fn p256_signing_key() -> Key {
        // Deterministic scalar for reproducible tests.
        let sk = p256::ecdsa::SigningKey::from_slice(&[0x17; 32]).unwrap();
        let public = sk
            .verifying_key()
            .to_public_key_pem(Default::default())
            .unwrap();
        let private = sk.to_pkcs8_pem(Default::default()).unwrap().to_string();
        Key {
            keyid: String::new(),
            keytype: "ecdsa".into(),
            scheme: "ecdsa-sha2-nistp256".into(),
            keyid_hash_algorithms: None,
            keyval: KeyVal {
                public,
                private: Some(PrivateKey(private)),
            },
            subkeys: BTreeMap::new(),
        }
    }

    #[test]
    fn p256_sign_then_verify_roundtrip() {
        let provider = RustCryptoProvider;
        let key = p256_signing_key();
        let message = b"supply chain evidence";

        let sig = provider.sign(&key, message).unwrap();
        assert!(provider.verify(&key, message, &sig).unwrap().is_valid());
    }

    #[test]
    fn p256_reject_wrong_message() {
        let provider = RustCryptoProvider;
        let key = p256_signing_key();
        let sig = provider.sign(&key, b"original").unwrap();
        assert!(!provider.verify(&key, b"tampered", &sig).unwrap().is_valid());
    }

    #[test]
    fn p256_signature_is_der() {
        let provider = RustCryptoProvider;
        let key = p256_signing_key();
        let sig = provider.sign(&key, b"msg").unwrap();
        // DER SEQUENCE tag.
        assert_eq!(sig.0.first(), Some(&0x30));
    }

    #[test]
    fn unknown_scheme_rejected() {
        let provider = RustCryptoProvider;
        let mut key = p256_signing_key();
        key.scheme = "rsassa-pkcs1v15".into();
        let err = provider.verify(&key, b"msg", &SignatureBytes(vec![0; 64]));
        assert!(err.is_err());
    }

    #[test]
    fn garbage_key_material_rejected() {
        let provider = RustCryptoProvider;
        let mut key = p256_signing_key();
        key.keyval.public = "not a key at all !!".into();
        let result = provider.verify(&key, b"msg", &SignatureBytes(vec![0; 64]));
        assert!(result.is_err());
    }

    #[test]
    fn rsa_sign_without_private_fails() {
        let provider = RustCryptoProvider;
        let key = Key {
            keyid: String::new(),
            keytype: "rsa".into(),
            scheme: "rsassa-pss-sha256".into(),
            keyid_hash_algorithms: None,
            keyval: KeyVal {
                public: "-----BEGIN PUBLIC KEY-----\nMA==\n-----END PUBLIC KEY-----\n".into(),
                private: None,
            },
            subkeys: BTreeMap::new(),
        };
        assert!(provider.sign(&key, b"msg").is_err());
    }
}
