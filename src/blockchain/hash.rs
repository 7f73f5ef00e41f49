use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur while hashing structured data
#[derive(Debug, Error)]
pub enum HashError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Hashes raw bytes with SHA-256
///
/// # Returns
///
/// The digest as a 64 character lowercase hexadecimal string
pub fn hash_string_256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hashes any serializable value through its canonical JSON form
///
/// Two values that serialize to the same JSON document hash identically,
/// whatever order their object keys were inserted in.
pub fn hash<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let canonical = to_canonical_json(value)?;
    Ok(hash_string_256(canonical.as_bytes()))
}

/// Serializes a value to JSON with object keys sorted at every level
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
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
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a string Value yields the escaped, quoted form
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_string_256() {
        let digest = hash_string_256(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({
            "b": 1,
            "a": { "z": true, "y": [ { "d": null, "c": "x" } ] }
        });

        let canonical = to_canonical_json(&value).unwrap();
        assert_eq!(canonical, r#"{"a":{"y":[{"c":"x","d":null}],"z":true},"b":1}"#);
    }

    #[test]
    fn test_hash_ignores_key_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("sender".to_string(), json!("alice"));
        first.insert("amount".to_string(), json!(2.5));

        let mut second = serde_json::Map::new();
        second.insert("amount".to_string(), json!(2.5));
        second.insert("sender".to_string(), json!("alice"));

        assert_eq!(hash(&first).unwrap(), hash(&second).unwrap());
        assert_ne!(hash(&first).unwrap(), hash(&json!({"sender": "bob", "amount": 2.5})).unwrap());
    }
}
