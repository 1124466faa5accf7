//! Scheme registry for scw's signing and verification layer.
//!
//! The `Registry` is the central dispatch table that maps signature scheme
//! identifiers to [`SignatureProvider`] implementations. The data model
//! selects schemes by name (from key descriptors), and the registry routes
//! operations to the correct backend.
//!
//! ## Thread Safety
//!
//! The registry is `Send + Sync` and designed to be created once at
//! startup, then shared immutably across recording and verification
//! operations.

use std::collections::HashMap;
use std::sync::Arc;

use super::errors::CryptoError;
use super::{Key, Signature, SignatureBytes, SignatureProvider, VerificationResult};

/// Central registry mapping scheme identifiers to provider implementations.
///
/// Providers are registered at startup. The registry holds `Arc` references
/// so providers can be shared across registries.
pub struct Registry {
    providers: HashMap<String, Arc<dyn SignatureProvider>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registers a provider for every scheme it declares.
    pub fn register(&mut self, provider: Arc<dyn SignatureProvider>) {
        for scheme in provider.schemes() {
            self.providers
                .insert((*scheme).to_string(), Arc::clone(&provider));
        }
    }

    /// Returns `true` if the given scheme has a registered provider.
    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.providers.contains_key(scheme)
    }

    fn provider_for(&self, key: &Key) -> Result<&Arc<dyn SignatureProvider>, CryptoError> {
        self.providers
            .get(&key.scheme)
            .ok_or_else(|| CryptoError::UnsupportedScheme(key.scheme.clone()))
    }

    /// Verifies a wire [`Signature`] (hex-encoded) over `message` with the
    /// public half of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error for unregistered schemes, undecodable signature
    /// encodings, or malformed key material. A well-formed signature that
    /// simply does not match yields `Ok(VerificationResult::Invalid)`.
    pub fn verify_signature(
        &self,
        key: &Key,
        message: &[u8],
        signature: &Signature,
    ) -> Result<VerificationResult, CryptoError> {
        let provider = self.provider_for(key)?;
        let bytes = hex::decode(&signature.sig)
            .map_err(|e| CryptoError::InvalidSignatureEncoding(format!("sig is not hex: {e}")))?;
        provider.verify(key, message, &SignatureBytes(bytes))
    }

    /// Signs `message` with the private half of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error for unregistered schemes, missing private material,
    /// or provider failures.
    pub fn sign(&self, key: &Key, message: &[u8]) -> Result<SignatureBytes, CryptoError> {
        self.provider_for(key)?.sign(key, message)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a registry with all built-in providers.
///
/// This is the main entry point for creating a fully-loaded registry:
/// the Ed25519 provider and the RustCrypto RSA-PSS/ECDSA provider.
pub fn default_registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register(Arc::new(super::providers::ed25519::Ed25519Provider));
    registry.register(Arc::new(super::providers::rustcrypto::RustCryptoProvider));
    Arc::new(registry)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::{KeyVal, PrivateKey, Signer};
    use std::collections::BTreeMap;

    fn ed25519_key() -> Key {
        let seed = [0x42u8; 32];
        let sk = ed25519_dalek::SigningKey::from_bytes(&seed);
        Key {
            keyid: String::new(),
            keytype: "ed25519".into(),
            scheme: "ed25519".into(),
            keyid_hash_algorithms: None,
            keyval: KeyVal {
                public: hex::encode(sk.verifying_key().to_bytes()),
                private: Some(PrivateKey(hex::encode(seed))),
            },
            subkeys: BTreeMap::new(),
        }
    }

    #[test]
    fn default_registry_supports_spec_schemes() {
        let reg = default_registry();
        for scheme in [
            "ed25519",
            "rsassa-pss-sha256",
            "ecdsa-sha2-nistp256",
            "ecdsa-sha2-nistp384",
            "pgp+rsa-pss",
            "pgp+eddsa-ed25519",
        ] {
            assert!(reg.supports_scheme(scheme), "missing scheme {scheme}");
        }
    }

    #[test]
    fn unregistered_scheme_is_an_error() {
        let reg = Registry::new();
        let key = ed25519_key();
        let sig = Signature {
            keyid: "ab".into(),
            sig: "00".into(),
            cert: None,
        };
        assert!(reg.verify_signature(&key, b"msg", &sig).is_err());
    }

    #[test]
    fn sign_and_verify_through_registry() {
        let reg = default_registry();
        let key = ed25519_key();
        let signer = crate::crypto::KeySigner::new(key.clone(), Arc::clone(&reg)).unwrap();

        let sig = signer.sign(b"payload bytes").unwrap();
        assert_eq!(sig.keyid, signer.keyid());

        let result = reg.verify_signature(&key, b"payload bytes", &sig).unwrap();
        assert!(result.is_valid());

        let result = reg.verify_signature(&key, b"other bytes", &sig).unwrap();
        assert!(!result.is_valid());
    }

    #[test]
    fn non_hex_signature_rejected() {
        let reg = default_registry();
        let key = ed25519_key();
        let sig = Signature {
            keyid: "ab".into(),
            sig: "zz-not-hex".into(),
            cert: None,
        };
        assert!(reg.verify_signature(&key, b"msg", &sig).is_err());
    }
}
