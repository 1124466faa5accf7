//! Concrete [`crate::crypto::SignatureProvider`] implementations.

pub mod ed25519;
pub mod rustcrypto;
