//! Canonical CBOR encoding and the signed-request payload.
//!
//! A signed extension request covers `method + path + body + timestamp`.
//! Both sides must produce byte-identical encodings of that tuple, so the
//! payload is a CBOR map with deterministic key ordering:
//! - map keys sorted by encoded length, then lexicographically
//! - definite lengths only
//! - no floating point, no CBOR tags
//!
//! The same helpers feed the catalog content hash, which needs equally
//! stable bytes for attribute sets.

use ciborium::Value;

use crate::error::{Error, Result};

/// Encode a CBOR Value to canonical bytes.
///
/// Map keys are sorted by canonical CBOR rules before encoding; floats and
/// tags are rejected.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let canonical = canonicalize(value)?;
    let mut buf = Vec::new();
    ciborium::into_writer(&canonical, &mut buf).map_err(|e| Error::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Recursively canonicalize a CBOR Value: sort map keys, reject floats/tags.
fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::Integer(_) | Value::Bool(_) | Value::Null => Ok(value.clone()),
        Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
        Value::Text(s) => Ok(Value::Text(s.clone())),

        Value::Array(arr) => {
            let canonical: Result<Vec<Value>> = arr.iter().map(canonicalize).collect();
            Ok(Value::Array(canonical?))
        }

        Value::Map(entries) => {
            let mut canonical_entries: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                canonical_entries.push((canonicalize(k)?, canonicalize(v)?));
            }
            // Shorter encoded key first, then lexicographic on encoded bytes.
            canonical_entries.sort_by(|(a, _), (b, _)| {
                let a_bytes = encode_for_sorting(a);
                let b_bytes = encode_for_sorting(b);
                a_bytes.len().cmp(&b_bytes.len()).then(a_bytes.cmp(&b_bytes))
            });
            Ok(Value::Map(canonical_entries))
        }

        Value::Float(_) => Err(Error::CanonicalViolation(
            "floating point numbers are prohibited in signing payloads".into(),
        )),

        Value::Tag(_, _) => Err(Error::CanonicalViolation(
            "CBOR tags are prohibited in signing payloads".into(),
        )),

        _ => Err(Error::CanonicalViolation(format!(
            "unsupported CBOR type: {value:?}"
        ))),
    }
}

fn encode_for_sorting(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // Cannot fail for values canonicalize() has already accepted.
    let _ = ciborium::into_writer(value, &mut buf);
    buf
}

/// Helper: build a CBOR map with text keys.
pub fn cbor_map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Text(k.to_string()), v))
            .collect(),
    )
}

/// Helper: convert an i64 to a CBOR integer value.
pub fn cbor_int(n: i64) -> Value {
    Value::Integer(n.into())
}

/// Helper: convert bytes to a CBOR bytes value.
pub fn cbor_bytes(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

/// Helper: convert a string to a CBOR text value.
pub fn cbor_text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// The canonical bytes an extension signs for one HTTP request.
///
/// `method` is normalized to uppercase; `path` is the request path without
/// scheme or host; `body` is the raw request body (empty for GETs);
/// `timestamp_ms` is the client's claimed UNIX-milliseconds clock, which the
/// server checks against its freshness window before verifying.
pub fn signing_bytes(method: &str, path: &str, body: &[u8], timestamp_ms: i64) -> Result<Vec<u8>> {
    let map = cbor_map(vec![
        ("body", cbor_bytes(body)),
        ("method", cbor_text(&method.to_uppercase())),
        ("path", cbor_text(path)),
        ("timestamp", cbor_int(timestamp_ms)),
    ]);
    to_canonical_bytes(&map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_map_key_ordering() {
        let map = cbor_map(vec![
            ("z", cbor_int(1)),
            ("a", cbor_int(2)),
            ("bb", cbor_int(3)),
        ]);
        let bytes = to_canonical_bytes(&map).unwrap();
        let decoded: Value = ciborium::from_reader(bytes.as_slice()).unwrap();

        let Value::Map(entries) = decoded else {
            panic!("expected map")
        };
        let keys: Vec<String> = entries
            .iter()
            .map(|(k, _)| match k {
                Value::Text(s) => s.clone(),
                _ => panic!("expected text key"),
            })
            .collect();
        // Single-char keys before "bb" (shorter encoding), "a" before "z".
        assert_eq!(keys, vec!["a", "z", "bb"]);
    }

    #[test]
    fn reject_floats_and_tags() {
        assert!(to_canonical_bytes(&Value::Float(3.14)).is_err());
        let tagged = Value::Tag(1, Box::new(Value::Integer(42.into())));
        assert!(to_canonical_bytes(&tagged).is_err());
    }

    #[test]
    fn signing_bytes_are_stable() {
        let a = signing_bytes("post", "/api/session/open", b"{\"sessionId\":\"S1\"}", 1_700_000_000_000).unwrap();
        let b = signing_bytes("POST", "/api/session/open", b"{\"sessionId\":\"S1\"}", 1_700_000_000_000).unwrap();
        assert_eq!(a, b, "method case must not affect the signed bytes");
    }

    #[test]
    fn signing_bytes_cover_every_field() {
        let base = signing_bytes("POST", "/p", b"body", 1000).unwrap();
        assert_ne!(base, signing_bytes("GET", "/p", b"body", 1000).unwrap());
        assert_ne!(base, signing_bytes("POST", "/q", b"body", 1000).unwrap());
        assert_ne!(base, signing_bytes("POST", "/p", b"BODY", 1000).unwrap());
        assert_ne!(base, signing_bytes("POST", "/p", b"body", 1001).unwrap());
    }

    #[test]
    fn signed_request_round_trip() {
        use crate::keys::{Keypair, sign, verify};

        let kp = Keypair::generate();
        let bytes = signing_bytes("POST", "/api/library/sync", b"{}", 42).unwrap();
        let sig = sign(kp.signing_key(), &bytes);

        let rebuilt = signing_bytes("POST", "/api/library/sync", b"{}", 42).unwrap();
        assert!(verify(&kp.public_key_bytes(), &rebuilt, &sig));
    }
}
