// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical hashing: deterministic JSON canonicalization and the
//! single-file / multi-file artifact hash algorithms.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}


/// Serialize `value` to canonical JSON: sorted object keys, no insignificant
/// whitespace. Achieved by round-tripping through `serde_json::Value`, whose
/// `Map` is a `BTreeMap` under the `preserve_order` feature being absent —
/// i.e. keys come out sorted by construction.
///
/// # Errors
///
/// Returns an error if `value` cannot be serialized to JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_value(v);
    serde_json::to_string(&sorted)
}

fn sort_value(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, val) in entries {
                sorted.insert(k, sort_value(val));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// SHA-256 of a single file's UTF-8 content bytes.
#[must_use]
pub fn single_file_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}

/// One entry in the sorted `(relative_path, sha256)` list for a multi-file tool.
#[derive(Debug, Clone, Serialize)]
pub struct FileDigest {
    pub relative_path: String,
    pub sha256: String,
}

/// Canonical hash for a multi-file tool: `sha256(canonical_json(manifest) ||
/// canonical_json(file_list))`, where `file_list` is sorted by relative path.
///
/// # Errors
///
/// Returns an error if `manifest` cannot be canonicalized to JSON.
pub fn multi_file_hash<M: Serialize>(
    manifest: &M,
    files: &[(String, &[u8])],
) -> Result<String, serde_json::Error> {
    let mut digests: Vec<FileDigest> = files
        .iter()
        .map(|(path, bytes)| FileDigest {
            relative_path: path.clone(),
            sha256: sha256_hex(bytes),
        })
        .collect();
    digests.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let manifest_json = canonical_json(manifest)?;
    let file_list_json = canonical_json(&digests)?;
    let mut combined = String::with_capacity(manifest_json.len() + file_list_json.len());
    combined.push_str(&manifest_json);
    combined.push_str(&file_list_json);
    Ok(sha256_hex(combined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn single_file_hash_stable_across_calls() {
        let h1 = single_file_hash("hello");
        let h2 = single_file_hash("hello");
        assert_eq!(h1, h2);
        assert_ne!(h1, single_file_hash("hellp"));
    }

    #[test]
    fn multi_file_hash_independent_of_input_file_order() {
        let manifest = serde_json::json!({"tool_id": "t"});
        let files_a: Vec<(String, &[u8])> =
            vec![("a.py".into(), b"1"), ("b.py".into(), b"2")];
        let files_b: Vec<(String, &[u8])> =
            vec![("b.py".into(), b"2"), ("a.py".into(), b"1")];
        assert_eq!(
            multi_file_hash(&manifest, &files_a).unwrap(),
            multi_file_hash(&manifest, &files_b).unwrap()
        );
    }
}
