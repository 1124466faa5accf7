//! Signed metadata wrappers and their disk representation.
//!
//! Two wrapper shapes exist in the wild and both must verify:
//!
//! - **Classic:** `{ "signed": <payload>, "signatures": [..] }`. The bytes
//!   signed are the canonical encoding of the payload.
//! - **Envelope:** `{ "payload": <b64>, "payloadType": <tag>,
//!   "signatures": [..] }`. The bytes signed are `PAE(type, payload)`.
//!
//! Readers sniff the shape from the top-level keys; writers choose via
//! [`MetadataFormat`]. The wrapper keeps the payload as the *parsed JSON
//! value*, not the typed model: re-serializing a typed struct could drop
//! unknown fields a foreign implementation signed over, which would break
//! signature verification on perfectly valid metadata.

use std::path::Path;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{encode_canonical, pae};
use crate::crypto::{Signature, Signer};
use crate::error::{Error, Result};
use crate::models::layout::Layout;
use crate::models::link::Link;

/// Payload type tag written into new envelopes.
pub const ENVELOPE_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Upper bound for metadata files read from disk. Layouts and links are
/// small; anything near this size is hostile or broken.
const MAX_METADATA_BYTES: u64 = 50 * 1024 * 1024;

/// Length of the keyid prefix used in link file and sublayout directory
/// names.
const KEYID_PREFIX_LEN: usize = 8;

/// Returns `<step>.<keyid8>.link`.
pub fn link_filename(step: &str, keyid: &str) -> String {
    let prefix: String = keyid.chars().take(KEYID_PREFIX_LEN).collect();
    format!("{step}.{prefix}.link")
}

/// Returns `<step>.<keyid8>`, the directory holding a sublayout's links.
pub fn sublayout_dir_name(step: &str, keyid: &str) -> String {
    let prefix: String = keyid.chars().take(KEYID_PREFIX_LEN).collect();
    format!("{step}.{prefix}")
}

/// Returns the side-file name used between record-start and record-stop.
pub fn unfinished_link_filename(step: &str) -> String {
    format!(".{step}.link-unfinished")
}

/// A metadata payload, discriminated by its `_type` tag.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A policy document.
    Layout(Layout),
    /// Step evidence.
    Link(Link),
}

impl Payload {
    /// The `_type` tag of this payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Layout(_) => "layout",
            Self::Link(_) => "link",
        }
    }

    /// Serializes to a JSON value tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if serialization fails (cannot happen for
    /// well-formed models, but the conversion is fallible by type).
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Layout(l) => serde_json::to_value(l),
            Self::Link(l) => serde_json::to_value(l),
        };
        value.map_err(|e| Error::schema("payload", e.to_string()))
    }

    /// Parses and validates a payload from a JSON value, dispatching on
    /// `_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for a missing/unknown `_type` or any
    /// model-validation failure.
    pub fn from_value(value: &Value) -> Result<Self> {
        let type_ = value
            .get("_type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::schema("payload", "missing '_type' discriminator"))?;
        match type_ {
            "layout" => {
                let layout: Layout = serde_json::from_value(value.clone())
                    .map_err(|e| Error::schema("layout payload", e.to_string()))?;
                layout.validate()?;
                Ok(Self::Layout(layout))
            }
            "link" => {
                let link: Link = serde_json::from_value(value.clone())
                    .map_err(|e| Error::schema("link payload", e.to_string()))?;
                link.validate()?;
                Ok(Self::Link(link))
            }
            other => Err(Error::schema(
                "payload",
                format!("unknown _type '{other}'"),
            )),
        }
    }
}

/// Classic signed wrapper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metablock {
    /// The payload as parsed (or constructed) JSON.
    pub signed: Value,
    /// Signatures over the canonical encoding of `signed`.
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

/// A signature entry in the envelope wrapper; `sig` is base64 on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    /// Keyid of the signing key.
    pub keyid: String,
    /// Base64-encoded signature bytes.
    pub sig: String,
    /// Optional signing certificate (PEM), carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
}

/// Envelope wrapper: payload bytes and type tag signed as `PAE(type,
/// payload)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Base64-encoded payload bytes.
    pub payload: String,
    /// Payload type tag, bound into the signature by PAE.
    #[serde(rename = "payloadType")]
    pub payload_type: String,
    /// Signatures over the PAE of (type, payload).
    #[serde(default)]
    pub signatures: Vec<EnvelopeSignature>,
}

/// Which wrapper shape to produce on write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MetadataFormat {
    /// `{ signed, signatures }` with hex signatures.
    #[default]
    Classic,
    /// `{ payload, payloadType, signatures }` with base64 signatures.
    Envelope,
}

/// A signed metadata file in either wrapper shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Metadata {
    /// Classic wrapper.
    Classic(Metablock),
    /// Envelope wrapper.
    Envelope(Envelope),
}

impl Metadata {
    /// Wraps a payload, unsigned, in the requested format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if the payload cannot be serialized or
    /// canonically encoded.
    pub fn new(payload: &Payload, format: MetadataFormat) -> Result<Self> {
        let value = payload.to_value()?;
        match format {
            MetadataFormat::Classic => Ok(Self::Classic(Metablock {
                signed: value,
                signatures: Vec::new(),
            })),
            MetadataFormat::Envelope => {
                let bytes = encode_canonical(&value)?;
                Ok(Self::Envelope(Envelope {
                    payload: base64::engine::general_purpose::STANDARD.encode(&bytes),
                    payload_type: ENVELOPE_PAYLOAD_TYPE.into(),
                    signatures: Vec::new(),
                }))
            }
        }
    }

    /// The payload as a JSON value, exactly as signed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for an undecodable envelope payload.
    pub fn payload_value(&self) -> Result<Value> {
        match self {
            Self::Classic(mb) => Ok(mb.signed.clone()),
            Self::Envelope(env) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&env.payload)
                    .map_err(|e| {
                        Error::schema("envelope payload", format!("invalid base64: {e}"))
                    })?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::schema("envelope payload", format!("invalid JSON: {e}")))
            }
        }
    }

    /// Parses and validates the typed payload.
    ///
    /// # Errors
    ///
    /// Propagates [`Metadata::payload_value`] and model validation errors.
    pub fn payload(&self) -> Result<Payload> {
        Payload::from_value(&self.payload_value()?)
    }

    /// The exact bytes signatures are made over.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for payloads that cannot be canonically
    /// encoded or base64-decoded.
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Classic(mb) => encode_canonical(&mb.signed),
            Self::Envelope(env) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&env.payload)
                    .map_err(|e| {
                        Error::schema("envelope payload", format!("invalid base64: {e}"))
                    })?;
                Ok(pae(&env.payload_type, &bytes))
            }
        }
    }

    /// All signatures, normalized to the in-memory hex form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for an envelope signature that is not
    /// valid base64.
    pub fn signatures(&self) -> Result<Vec<Signature>> {
        match self {
            Self::Classic(mb) => Ok(mb.signatures.clone()),
            Self::Envelope(env) => env
                .signatures
                .iter()
                .map(|s| {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(&s.sig)
                        .map_err(|e| {
                            Error::schema("envelope signature", format!("invalid base64: {e}"))
                        })?;
                    Ok(Signature {
                        keyid: s.keyid.clone(),
                        sig: hex::encode(bytes),
                        cert: s.cert.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Signs the wrapper with `signer`, appending the signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] on signer failure, or encoding errors
    /// from [`Metadata::signed_bytes`].
    pub fn sign_with(&mut self, signer: &dyn Signer) -> Result<()> {
        let message = self.signed_bytes()?;
        let signature = signer.sign(&message).map_err(|source| Error::Crypto {
            context: "signing metadata".into(),
            source,
        })?;
        match self {
            Self::Classic(mb) => mb.signatures.push(signature),
            Self::Envelope(env) => {
                let raw = hex::decode(&signature.sig).map_err(|e| {
                    Error::schema("signature", format!("signer returned non-hex sig: {e}"))
                })?;
                env.signatures.push(EnvelopeSignature {
                    keyid: signature.keyid,
                    sig: base64::engine::general_purpose::STANDARD.encode(raw),
                    cert: signature.cert,
                });
            }
        }
        Ok(())
    }

    /// Removes all signatures (used by `sign --replace`).
    pub fn clear_signatures(&mut self) {
        match self {
            Self::Classic(mb) => mb.signatures.clear(),
            Self::Envelope(env) => env.signatures.clear(),
        }
    }

    /// Parses either wrapper shape from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for invalid JSON or an unrecognized
    /// wrapper shape.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::schema("metadata", format!("invalid JSON: {e}")))?;
        let Some(object) = value.as_object() else {
            return Err(Error::schema("metadata", "top level must be an object"));
        };
        if object.contains_key("signed") {
            let mb: Metablock = serde_json::from_value(value)
                .map_err(|e| Error::schema("metadata", format!("bad classic wrapper: {e}")))?;
            Ok(Self::Classic(mb))
        } else if object.contains_key("payload") {
            let env: Envelope = serde_json::from_value(value)
                .map_err(|e| Error::schema("metadata", format!("bad envelope wrapper: {e}")))?;
            Ok(Self::Envelope(env))
        } else {
            Err(Error::schema(
                "metadata",
                "neither 'signed' nor 'payload' present; not a metadata wrapper",
            ))
        }
    }

    /// Loads metadata from a file (symlink-checked, size-bounded).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] for unreadable files and [`Error::Schema`]
    /// for unparseable content.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = crate::fs_guard::read_validated(path, MAX_METADATA_BYTES)?;
        Self::from_slice(&bytes)
    }

    /// Serializes to pretty-printed JSON for disk storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] on serialization failure.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        let result = match self {
            Self::Classic(mb) => serde_json::to_vec_pretty(mb),
            Self::Envelope(env) => serde_json::to_vec_pretty(env),
        };
        result.map_err(|e| Error::schema("metadata", e.to_string()))
    }

    /// Writes pretty-printed JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on write failure.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let bytes = self.to_pretty_json()?;
        std::fs::write(path, bytes).map_err(|e| Error::io(path, &e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::crypto::registry::default_registry;
    use crate::crypto::{Key, KeySigner, KeyVal, PrivateKey};
    use std::collections::BTreeMap;

    fn ed25519_signing_key() -> Key {
        let seed = [0x11u8; 32];
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
        key
    }

    fn link_payload() -> Payload {
        Payload::Link(Link::new("clone").unwrap())
    }

    #[test]
    fn filename_helpers() {
        let keyid = "0123456789abcdef".repeat(4);
        assert_eq!(link_filename("clone", &keyid), "clone.01234567.link");
        assert_eq!(sublayout_dir_name("build", &keyid), "build.01234567");
        assert_eq!(unfinished_link_filename("clone"), ".clone.link-unfinished");
    }

    #[test]
    fn classic_wrapper_roundtrip() {
        let md = Metadata::new(&link_payload(), MetadataFormat::Classic).unwrap();
        let bytes = md.to_pretty_json().unwrap();
        let parsed = Metadata::from_slice(&bytes).unwrap();
        assert_eq!(parsed, md);
        assert_eq!(parsed.payload().unwrap(), link_payload());
    }

    #[test]
    fn envelope_wrapper_roundtrip() {
        let md = Metadata::new(&link_payload(), MetadataFormat::Envelope).unwrap();
        let bytes = md.to_pretty_json().unwrap();
        let parsed = Metadata::from_slice(&bytes).unwrap();
        assert_eq!(parsed, md);
        assert_eq!(parsed.payload().unwrap(), link_payload());
    }

    #[test]
    fn signed_bytes_differ_between_wrappers() {
        let classic = Metadata::new(&link_payload(), MetadataFormat::Classic).unwrap();
        let envelope = Metadata::new(&link_payload(), MetadataFormat::Envelope).unwrap();
        let cb = classic.signed_bytes().unwrap();
        let eb = envelope.signed_bytes().unwrap();
        assert_ne!(cb, eb);
        assert!(eb.starts_with(b"DSSEv1 "));
        // The envelope's PAE embeds the classic canonical bytes.
        let needle = cb.as_slice();
        assert!(eb.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn sign_and_verify_both_wrappers() {
        let key = ed25519_signing_key();
        let registry = default_registry();
        let signer = KeySigner::new(key.clone(), registry.clone()).unwrap();
        let public = key.strip_private();

        for format in [MetadataFormat::Classic, MetadataFormat::Envelope] {
            let mut md = Metadata::new(&link_payload(), format).unwrap();
            md.sign_with(&signer).unwrap();

            let sigs = md.signatures().unwrap();
            assert_eq!(sigs.len(), 1);
            let result = registry
                .verify_signature(&public, &md.signed_bytes().unwrap(), &sigs[0])
                .unwrap();
            assert!(result.is_valid(), "format {format:?}");
        }
    }

    #[test]
    fn signature_survives_pretty_print_roundtrip() {
        let key = ed25519_signing_key();
        let registry = default_registry();
        let signer = KeySigner::new(key.clone(), registry.clone()).unwrap();

        let mut md = Metadata::new(&link_payload(), MetadataFormat::Classic).unwrap();
        md.sign_with(&signer).unwrap();

        // Disk representation is pretty-printed; verification re-canonicalizes.
        let parsed = Metadata::from_slice(&md.to_pretty_json().unwrap()).unwrap();
        let sigs = parsed.signatures().unwrap();
        let result = registry
            .verify_signature(
                &key.strip_private(),
                &parsed.signed_bytes().unwrap(),
                &sigs[0],
            )
            .unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn unknown_payload_fields_do_not_break_signatures() {
        // A foreign implementation may sign fields this model does not
        // know. The wrapper must preserve them byte-for-byte.
        let raw = br#"{
            "signed": {"_type": "link", "name": "clone", "future_field": [1, 2, 3]},
            "signatures": []
        }"#;
        let md = Metadata::from_slice(raw).unwrap();
        let bytes = md.signed_bytes().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("future_field"));
    }

    #[test]
    fn wrapper_sniffing_rejects_unknown_shape() {
        let err = Metadata::from_slice(br#"{"_type": "link", "name": "x"}"#).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
        assert!(Metadata::from_slice(b"[1,2]").is_err());
        assert!(Metadata::from_slice(b"not json").is_err());
    }

    #[test]
    fn unknown_type_tag_rejected() {
        let md = Metadata::from_slice(
            br#"{"signed": {"_type": "provenance", "name": "x"}, "signatures": []}"#,
        )
        .unwrap();
        assert!(md.payload().is_err());
    }

    #[test]
    fn clear_signatures_empties_both_shapes() {
        let key = ed25519_signing_key();
        let signer = KeySigner::new(key, default_registry()).unwrap();
        for format in [MetadataFormat::Classic, MetadataFormat::Envelope] {
            let mut md = Metadata::new(&link_payload(), format).unwrap();
            md.sign_with(&signer).unwrap();
            md.clear_signatures();
            assert!(md.signatures().unwrap().is_empty());
        }
    }
}
