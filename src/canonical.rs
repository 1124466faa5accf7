//! Canonical JSON encoding -- the byte representation that gets signed.
//!
//! Signatures over layouts and links are only reproducible if every
//! implementation serializes the payload to the same bytes. This module is
//! the single source of those bytes:
//!
//! - Object keys are emitted in lexicographic order of their UTF-8 bytes.
//! - Strings use minimal escaping: only `"` and `\` are escaped; control
//!   characters (U+0000..U+001F) become `\u00xx`; non-ASCII text passes
//!   through unescaped.
//! - Only integers are permitted as numbers. Floats are rejected loudly --
//!   a payload containing `1.5` is a schema defect, not something to round.
//! - Arrays keep their declared order; no whitespace between tokens.
//!
//! On-disk metadata may be pretty-printed; verifiers re-canonicalize the
//! parsed payload through this module before checking any signature.

use serde_json::Value;

use crate::error::{Error, Result};

/// Serializes a JSON value to its canonical byte representation.
///
/// # Errors
///
/// Returns [`Error::Schema`] if the value contains a float or a number
/// outside the `i64`/`u64` range.
pub fn encode_canonical(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            // itoa-style formatting via the standard integer Display is
            // already canonical: no leading zeros, no decimal point.
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(u.to_string().as_bytes());
            } else {
                return Err(Error::schema(
                    "canonical encoding",
                    format!("non-integer number '{n}' is not permitted in signed payloads"),
                ));
            }
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // serde_json's map preserves insertion only with a non-default
            // feature; sort explicitly so canonical output never depends on
            // how the value tree was built.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key.as_str());
                out.push(b':');
                // Key came out of the map one line above.
                if let Some(v) = map.get(*key) {
                    write_value(out, v)?;
                }
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

/// Pre-Authentication Encoding for the envelope wrapper.
///
/// `PAE(type, payload) = "DSSEv1" SP len(type) SP type SP len(payload) SP payload`
///
/// Length-prefixing both fields makes the encoding injective: no payload
/// can collide with a different (type, payload) pair.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload_type.len() + payload.len() + 32);
    out.extend_from_slice(b"DSSEv1 ");
    out.extend_from_slice(payload_type.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload_type.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(v: &Value) -> String {
        String::from_utf8(encode_canonical(v).unwrap()).unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(canon(&json!(null)), "null");
        assert_eq!(canon(&json!(true)), "true");
        assert_eq!(canon(&json!(false)), "false");
        assert_eq!(canon(&json!(42)), "42");
        assert_eq!(canon(&json!(-7)), "-7");
        assert_eq!(canon(&json!(0)), "0");
    }

    #[test]
    fn keys_sorted_by_utf8_bytes() {
        let v = json!({"b": 1, "a": 2, "B": 3});
        // 'B' (0x42) sorts before 'a' (0x61) and 'b' (0x62).
        assert_eq!(canon(&v), r#"{"B":3,"a":2,"b":1}"#);
    }

    #[test]
    fn nested_structure_no_whitespace() {
        let v = json!({"steps": [{"name": "clone", "threshold": 1}]});
        assert_eq!(
            canon(&v),
            r#"{"steps":[{"name":"clone","threshold":1}]}"#
        );
    }

    #[test]
    fn minimal_string_escaping() {
        assert_eq!(canon(&json!("a\"b")), r#""a\"b""#);
        assert_eq!(canon(&json!("a\\b")), r#""a\\b""#);
        // Control characters use \u00xx; printable ASCII and non-ASCII
        // pass through.
        assert_eq!(canon(&json!("a\nb")), "\"a\\u000ab\"");
        assert_eq!(canon(&json!("a\tb")), "\"a\\u0009b\"");
        assert_eq!(canon(&json!("grüß")), "\"grüß\"");
        // Forward slash is NOT escaped (unlike serde_json's default it
        // never was, but make the property explicit).
        assert_eq!(canon(&json!("a/b")), "\"a/b\"");
    }

    #[test]
    fn floats_rejected() {
        let err = encode_canonical(&json!(1.5)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
        // A float that happens to be integral is still a float.
        let err = encode_canonical(&json!(2.0)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn large_integers_roundtrip() {
        assert_eq!(canon(&json!(u64::MAX)), u64::MAX.to_string());
        assert_eq!(canon(&json!(i64::MIN)), i64::MIN.to_string());
    }

    #[test]
    fn encoding_is_stable_across_runs() {
        let v = json!({"z": [1, 2], "a": {"nested": "x"}, "m": null});
        assert_eq!(encode_canonical(&v).unwrap(), encode_canonical(&v).unwrap());
    }

    #[test]
    fn roundtrip_through_parser() {
        let v = json!({"keys": {}, "steps": [], "expires": "2030-01-01T00:00:00Z"});
        let bytes = encode_canonical(&v).unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reparsed, v);
        assert_eq!(encode_canonical(&reparsed).unwrap(), bytes);
    }

    #[test]
    fn pae_framing() {
        let out = pae("application/vnd.in-toto+json", b"{}");
        assert_eq!(
            out,
            b"DSSEv1 28 application/vnd.in-toto+json 2 {}".to_vec()
        );
    }

    #[test]
    fn pae_empty_payload() {
        assert_eq!(pae("t", b""), b"DSSEv1 1 t 0 ".to_vec());
    }
}
