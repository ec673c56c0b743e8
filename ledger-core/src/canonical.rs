//! Canonical JSON encoding used for every hashed object in the ledger.
//!
//! Object keys are emitted in sorted order with no insignificant
//! whitespace, and the encoding is produced by directly recursing over
//! `serde_json::Value` rather than relying on `serde_json`'s own map
//! ordering, so the output is byte-identical across platforms regardless
//! of how the value was originally constructed.

use serde_json::Value;
use std::fmt::Write as _;

/// Serializes `value` to its canonical byte form.
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

/// Serializes `value` to its canonical string form.
#[must_use]
pub fn canonical_json_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => {
            write_json_string(s, out);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json_string(&value), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn produces_no_insignificant_whitespace() {
        let value = json!({"nested": {"z": [1, 2, 3], "a": "hi"}});
        assert_eq!(
            canonical_json_string(&value),
            r#"{"nested":{"a":"hi","z":[1,2,3]}}"#
        );
    }

    #[test]
    fn is_deterministic_regardless_of_insertion_order() {
        let a = json!({"x": 1, "y": 2, "z": 3});
        let b = json!({"z": 3, "x": 1, "y": 2});
        assert_eq!(canonical_json_bytes(&a), canonical_json_bytes(&b));
    }

    #[test]
    fn escapes_control_characters() {
        let value = json!("line1\nline2\ttab");
        assert_eq!(canonical_json_string(&value), r#""line1\nline2\ttab""#);
    }
}
