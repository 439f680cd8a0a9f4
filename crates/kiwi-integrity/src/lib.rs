// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integrity Verifier (C3): canonical-hash computation, lockfile pinning,
//! and the two accepted signature forms (an embedded comment header, or a
//! detached `.sig` file).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use kiwi_config::VerificationMode;
use kiwi_core::{multi_file_hash, single_file_hash, IntegrityRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading or writing the lockfile / detached signature files.
/// Verification *outcomes* are never errors — see [`VerificationOutcome`].
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON at {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `<project>/.ai/lockfile.json`: `{tool_id}@{version} -> canonical_hash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lockfile {
    pub tools: BTreeMap<String, String>,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
}

fn lock_key(tool_id: &str, version: &str) -> String {
    format!("{tool_id}@{version}")
}

impl Lockfile {
    /// Load a lockfile from disk, or an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::Io`] for I/O failures other than
    /// not-found, and [`IntegrityError::Serialize`] for malformed JSON.
    pub fn load(path: &Path) -> Result<Self, IntegrityError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| IntegrityError::Serialize {
                path: path.display().to_string(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Lockfile::default()),
            Err(source) => Err(IntegrityError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Persist the lockfile, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::Io`] if the directory or file cannot be
    /// written, and [`IntegrityError::Serialize`] if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), IntegrityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| IntegrityError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| IntegrityError::Serialize {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| IntegrityError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    #[must_use]
    pub fn get(&self, tool_id: &str, version: &str) -> Option<&str> {
        self.tools.get(&lock_key(tool_id, version)).map(String::as_str)
    }

    pub fn pin(&mut self, tool_id: &str, version: &str, hash: String, now: DateTime<Utc>) {
        self.tools.insert(lock_key(tool_id, version), hash);
        self.signed_at = Some(now);
    }
}

/// Result of one verification check (spec §4.3: "Any verification failure
/// aborts the operation before any primitive is invoked").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub computed_hash: String,
    pub locked_hash: Option<String>,
    pub reason: Option<String>,
}

/// Verify a single-file artifact's content against the lockfile, mutating
/// the lockfile in place under `tofu` mode (spec §4.3 verification modes).
#[must_use]
pub fn verify_single_file(
    content: &str,
    tool_id: &str,
    version: &str,
    mode: VerificationMode,
    lockfile: &mut Lockfile,
    now: DateTime<Utc>,
) -> VerificationOutcome {
    let computed = single_file_hash(content);
    verify_against_lock(computed, tool_id, version, mode, lockfile, now)
}

/// Verify a multi-file tool's manifest + file set against the lockfile.
///
/// # Errors
///
/// Returns an error only if `manifest` cannot be canonicalized to JSON.
pub fn verify_multi_file<M: Serialize>(
    manifest: &M,
    files: &[(String, &[u8])],
    tool_id: &str,
    version: &str,
    mode: VerificationMode,
    lockfile: &mut Lockfile,
    now: DateTime<Utc>,
) -> Result<VerificationOutcome, serde_json::Error> {
    let computed = multi_file_hash(manifest, files)?;
    Ok(verify_against_lock(computed, tool_id, version, mode, lockfile, now))
}

fn verify_against_lock(
    computed: String,
    tool_id: &str,
    version: &str,
    mode: VerificationMode,
    lockfile: &mut Lockfile,
    now: DateTime<Utc>,
) -> VerificationOutcome {
    let locked = lockfile.get(tool_id, version).map(str::to_string);
    match (mode, locked) {
        (VerificationMode::Off, locked) => VerificationOutcome {
            verified: true,
            computed_hash: computed,
            locked_hash: locked,
            reason: Some("verification disabled".to_string()),
        },
        (VerificationMode::Tofu, None) => {
            lockfile.pin(tool_id, version, computed.clone(), now);
            VerificationOutcome {
                verified: true,
                computed_hash: computed,
                locked_hash: None,
                reason: Some("trust-on-first-use: pinned new hash".to_string()),
            }
        }
        (VerificationMode::Strict, None) => VerificationOutcome {
            verified: false,
            computed_hash: computed,
            locked_hash: None,
            reason: Some("no lockfile entry in strict mode".to_string()),
        },
        (_, Some(locked)) => {
            let verified = locked == computed;
            let reason = if verified {
                None
            } else {
                Some("computed hash does not match locked hash".to_string())
            };
            VerificationOutcome {
                verified,
                computed_hash: computed,
                locked_hash: Some(locked),
                reason,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Signatures: embedded comment header (canonical on write) or detached file
// ---------------------------------------------------------------------------

const SIGNATURE_PREFIX: &str = "# kiwi-validated:";

/// Parse a `# kiwi-validated:<ISO8601>:<sha256hex>` comment line, wherever it
/// appears among the file's leading lines.
#[must_use]
pub fn parse_embedded_signature(content: &str) -> Option<(DateTime<Utc>, String)> {
    for line in content.lines().take(4) {
        if let Some(rest) = line.trim_start().strip_prefix(SIGNATURE_PREFIX) {
            let mut parts = rest.splitn(2, ':');
            let ts = parts.next()?;
            let hash = parts.next()?;
            let signed_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
            return Some((signed_at, hash.to_string()));
        }
    }
    None
}

/// Insert or replace the embedded signature line, writing the canonical
/// write-time form. Idempotent: signing twice with the same `hash` produces
/// byte-identical output (spec §8 idempotence: "sign(artifact) twice yields
/// the same hash and overwrites the prior signature line").
#[must_use]
pub fn sign_comment(content: &str, hash: &str, now: DateTime<Utc>) -> String {
    let new_line = format!("{SIGNATURE_PREFIX}{}:{}", now.to_rfc3339(), hash);
    let mut lines: Vec<&str> = content.lines().collect();

    if let Some(idx) = lines
        .iter()
        .take(4)
        .position(|l| l.trim_start().starts_with(SIGNATURE_PREFIX))
    {
        lines[idx] = &new_line;
        lines.join("\n") + if content.ends_with('\n') { "\n" } else { "" }
    } else {
        let insert_at = if lines.first().is_some_and(|l| l.starts_with("#!")) {
            1
        } else {
            0
        };
        lines.insert(insert_at, &new_line);
        lines.join("\n") + if content.ends_with('\n') { "\n" } else { "" }
    }
}

/// Serialize an [`IntegrityRecord`] as the content of a detached `.sig` file.
///
/// # Errors
///
/// Returns an error if `record` cannot be serialized.
pub fn write_detached_signature(record: &IntegrityRecord) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(record)
}

/// Parse a detached `.sig` file's content.
///
/// # Errors
///
/// Returns an error if the content is not a valid [`IntegrityRecord`].
pub fn parse_detached_signature(text: &str) -> Result<IntegrityRecord, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_without_lock_entry_fails_closed() {
        let mut lockfile = Lockfile::default();
        let outcome = verify_single_file(
            "print('hi')",
            "greeter",
            "1.0.0",
            VerificationMode::Strict,
            &mut lockfile,
            Utc::now(),
        );
        assert!(!outcome.verified);
    }

    #[test]
    fn tofu_mode_pins_on_first_use_then_verifies() {
        let mut lockfile = Lockfile::default();
        let now = Utc::now();
        let first = verify_single_file(
            "print('hi')",
            "greeter",
            "1.0.0",
            VerificationMode::Tofu,
            &mut lockfile,
            now,
        );
        assert!(first.verified);
        assert!(lockfile.get("greeter", "1.0.0").is_some());

        let second = verify_single_file(
            "print('hi')",
            "greeter",
            "1.0.0",
            VerificationMode::Tofu,
            &mut lockfile,
            now,
        );
        assert!(second.verified);
        assert_eq!(second.locked_hash, Some(second.computed_hash.clone()));
    }

    #[test]
    fn single_byte_mutation_fails_verification() {
        let mut lockfile = Lockfile::default();
        let now = Utc::now();
        verify_single_file(
            "print('hi')",
            "greeter",
            "1.0.0",
            VerificationMode::Tofu,
            &mut lockfile,
            now,
        );
        let tampered = verify_single_file(
            "print('hj')",
            "greeter",
            "1.0.0",
            VerificationMode::Strict,
            &mut lockfile,
            now,
        );
        assert!(!tampered.verified);
    }

    #[test]
    fn off_mode_always_verifies() {
        let mut lockfile = Lockfile::default();
        let outcome = verify_single_file(
            "anything",
            "t",
            "1.0.0",
            VerificationMode::Off,
            &mut lockfile,
            Utc::now(),
        );
        assert!(outcome.verified);
    }

    #[test]
    fn sign_comment_is_idempotent() {
        let content = "#!/usr/bin/env python3\nprint('hi')\n";
        let signed_once = sign_comment(content, "abc123", Utc::now());
        let signed_twice = sign_comment(&signed_once, "abc123", Utc::now());
        assert_eq!(
            signed_once.lines().filter(|l| l.starts_with(SIGNATURE_PREFIX)).count(),
            1
        );
        assert_eq!(
            signed_twice.lines().filter(|l| l.starts_with(SIGNATURE_PREFIX)).count(),
            1
        );
    }

    #[test]
    fn embedded_signature_round_trips() {
        let content = "# kiwi-validated:2025-01-01T00:00:00+00:00:deadbeef\nbody\n";
        let (_, hash) = parse_embedded_signature(content).unwrap();
        assert_eq!(hash, "deadbeef");
    }

    #[test]
    fn lockfile_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile.json");
        let mut lockfile = Lockfile::default();
        lockfile.pin("t", "1.0.0", "hash".to_string(), Utc::now());
        lockfile.save(&path).unwrap();
        let loaded = Lockfile::load(&path).unwrap();
        assert_eq!(loaded.get("t", "1.0.0"), Some("hash"));
    }
}
