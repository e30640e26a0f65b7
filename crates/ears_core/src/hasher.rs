//! Deterministic configuration digests
//!
//! Plugin identity and route identity are both derived from a digest over a
//! JSON configuration value. Object keys are hashed in sorted order so two
//! configurations that differ only in key order produce the same digest.

use serde_json::{Map, Value};

/// Anything that can provide a deterministic digest of its configuration
pub trait ConfigHash {
    /// Returns the hex digest of this value's configuration
    fn config_hash(&self) -> String;
}

/// Computes the hex digest of a configuration value
pub fn digest(value: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    write_canonical(&mut hasher, value);
    hasher.finalize().to_hex().to_string()
}

/// Computes the digest of a set of named fields, as if they formed one object
pub fn digest_fields<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, Value)>,
{
    let object: Map<String, Value> = fields
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    digest(&Value::Object(object))
}

// Type tags keep `"1"` and `1`, or `[]` and `{}`, from colliding.
fn write_canonical(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::Number(n) => {
            let text = n.to_string();
            hasher.update(b"d");
            write_len_prefixed(hasher, text.as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            write_len_prefixed(hasher, s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"a");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_canonical(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"o");
            hasher.update(&(keys.len() as u64).to_le_bytes());
            for key in keys {
                write_len_prefixed(hasher, key.as_bytes());
                write_canonical(hasher, &map[key.as_str()]);
            }
        }
    }
}

fn write_len_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
