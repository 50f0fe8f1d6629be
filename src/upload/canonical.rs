//! JSON canonicalization for HMAC signing: sorted object keys, fixed-width
//! float formatting, no whitespace. Deterministic byte-for-byte output for
//! a given value regardless of struct field declaration order.

use serde::Serialize;
use serde_json::Value;

use crate::error::HsiError;

const FLOAT_PRECISION: usize = 6;

pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, HsiError> {
    let v = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&v, &mut out);
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => out.push_str(&serde_json::to_string(s).expect("string encodes")),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string encodes"));
                out.push(':');
                write_value(val, out);
            }
            out.push('}');
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        out.push_str(&format!("{:.*}", FLOAT_PRECISION, f));
    } else {
        out.push_str("0");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn floats_use_fixed_precision() {
        let value = json!({"x": 1.5});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"x":1.500000}"#);
    }

    #[test]
    fn nested_objects_and_arrays_canonicalize_recursively() {
        let value = json!({"z": [1, {"y": 1, "x": 2}], "a": null});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"a":null,"z":[1,{"x":2,"y":1}]}"#
        );
    }

    #[test]
    fn same_value_canonicalizes_identically_regardless_of_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }
}
