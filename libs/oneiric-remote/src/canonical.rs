//! Canonical signing form.
//!
//! The signature covers the manifest object with `signature` and
//! `signature_algorithm` removed, keys recursively sorted, and minimal
//! whitespace. Non-finite numbers are forbidden. The writer below never
//! relies on the parser's key ordering, so the output is byte-stable
//! regardless of how the document arrived.

use serde_json::Value;

use crate::error::RemoteError;

/// Fields stripped from the top level before signing.
const SIGNATURE_FIELDS: [&str; 2] = ["signature", "signature_algorithm"];

/// Produces the canonical bytes of a manifest document.
///
/// # Errors
/// [`RemoteError::Parse`] when the document is not an object or contains
/// a non-finite number.
pub fn canonical_bytes(raw: &Value) -> Result<Vec<u8>, RemoteError> {
    let Value::Object(map) = raw else {
        return Err(RemoteError::Parse {
            reason: "manifest is not an object".to_owned(),
        });
    };
    let mut stripped = map.clone();
    for field in SIGNATURE_FIELDS {
        stripped.remove(field);
    }

    let mut out = Vec::with_capacity(256);
    write_value(&Value::Object(stripped), &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), RemoteError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(RemoteError::Parse {
                        reason: "non-finite number in manifest".to_owned(),
                    });
                }
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort keys explicitly; the in-memory map ordering is an
            // implementation detail of the parser.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// JSON string escaping, matching `serde_json`'s compact output.
fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
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
