// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability Token Store (C5): mint, validate, and revoke short-lived
//! bearer tokens, enforcing the hierarchical sandbox rule at mint time —
//! core directives may request any capability; user-authored directives are
//! confined to the project sandbox.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiwi_core::{Capability, CapabilityToken, PermissionDeclaration};
use kiwi_glob::IncludeExcludeGlobs;
use thiserror::Error;
use uuid::Uuid;

/// Failures minting or validating a capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("permission `{capability} {resource}` is out of sandbox for a non-core directive: {reason}")]
    OutOfSandbox {
        capability: String,
        resource: String,
        reason: String,
    },
    #[error("no live token for thread `{0}`")]
    NoLiveToken(String),
    #[error("capability `{action} {resource}` denied: {reason}")]
    Denied {
        action: String,
        resource: String,
        reason: String,
    },
}

/// Compiled sandbox restrictions applied to non-core directives at mint time.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    fs_scope: IncludeExcludeGlobs,
    shell_allowlist: IncludeExcludeGlobs,
}

impl SandboxPolicy {
    /// Build a sandbox confined to `<project>/**` for filesystem writes and
    /// the given command allow-list for shell execution.
    ///
    /// # Errors
    ///
    /// Returns an error if `project_glob` or any allow-listed command fails
    /// to compile as a glob pattern.
    pub fn new(project_glob: &str, shell_allowlist: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            fs_scope: IncludeExcludeGlobs::new(&[project_glob.to_string()], &[])?,
            shell_allowlist: IncludeExcludeGlobs::new(shell_allowlist, &[])?,
        })
    }

    #[must_use]
    pub fn allows_fs_path(&self, path: &str) -> bool {
        self.fs_scope.decide_str(path).is_allowed()
    }

    #[must_use]
    pub fn allows_shell_command(&self, command: &str) -> bool {
        self.shell_allowlist.decide_str(command).is_allowed()
    }
}

fn permission_to_capability(p: &PermissionDeclaration) -> Capability {
    let mut cap = Capability::new(p.capability.clone(), p.scope.clone());
    if let Some(path) = &p.path {
        cap = cap.with_scope(path.clone());
    }
    cap
}

/// Check one declared permission against the sandbox; `is_core` directives
/// bypass every check (spec §4.5 hierarchical rule).
///
/// # Errors
///
/// Returns [`CapabilityError::OutOfSandbox`] when a non-core directive
/// requests an `fs` write outside `<project>/**` or a `shell` command not on
/// the allow-list.
fn check_sandbox(
    permission: &PermissionDeclaration,
    is_core: bool,
    sandbox: &SandboxPolicy,
) -> Result<(), CapabilityError> {
    if is_core {
        return Ok(());
    }
    match (permission.capability.as_str(), permission.scope.as_str()) {
        ("write", "fs") => {
            let path = permission.path.as_deref().unwrap_or("");
            if path.is_empty() || !sandbox.allows_fs_path(path) {
                return Err(CapabilityError::OutOfSandbox {
                    capability: permission.capability.clone(),
                    resource: permission.scope.clone(),
                    reason: format!("path `{path}` is not under the project sandbox"),
                });
            }
        }
        ("execute", "shell") => {
            let command = permission.path.as_deref().unwrap_or("");
            if command.is_empty() || !sandbox.allows_shell_command(command) {
                return Err(CapabilityError::OutOfSandbox {
                    capability: permission.capability.clone(),
                    resource: permission.scope.clone(),
                    reason: format!("command `{command}` is not on the shell allow-list"),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Mint a token for a thread from its directive's declared permissions.
///
/// # Errors
///
/// Returns [`CapabilityError::OutOfSandbox`] if `permissions` contains a
/// request a non-core directive is not allowed to make.
pub fn mint(
    thread_id: &str,
    directive_id: &str,
    permissions: &[PermissionDeclaration],
    ttl: Duration,
    is_core: bool,
    sandbox: &SandboxPolicy,
    now: DateTime<Utc>,
) -> Result<CapabilityToken, CapabilityError> {
    for p in permissions {
        check_sandbox(p, is_core, sandbox).inspect_err(|e| {
            tracing::warn!(
                thread_id,
                directive_id,
                capability = %p.capability,
                resource = %p.scope,
                error = %e,
                "capability mint rejected: out of sandbox"
            );
        })?;
    }

    Ok(CapabilityToken {
        token_id: Uuid::new_v4(),
        thread_id: thread_id.to_string(),
        directive_id: directive_id.to_string(),
        capabilities: permissions.iter().map(permission_to_capability).collect(),
        issued_at: now,
        expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        revoked: false,
    })
}

/// Match semantics for validating a required capability against a token's
/// granted set (spec §4.5 validation contract).
#[must_use]
pub fn token_grants(token: &CapabilityToken, required: &Capability, now: DateTime<Utc>) -> bool {
    if !token.is_live(now) {
        return false;
    }
    token.capabilities.iter().any(|granted| {
        granted.action == required.action
            && granted.resource == required.resource
            && scope_satisfies(granted.scope.as_deref(), required.scope.as_deref())
    })
}

fn scope_satisfies(granted: Option<&str>, required: Option<&str>) -> bool {
    let Some(required) = required else {
        return true;
    };
    let Some(granted) = granted else {
        return true;
    };
    if granted == required {
        return true;
    }
    IncludeExcludeGlobs::new(&[granted.to_string()], &[])
        .map(|g| g.decide_str(required).is_allowed())
        .unwrap_or(false)
}

/// Process-wide, thread-scoped token store. Writes are serialized per
/// thread id via an internal `RwLock`; concurrent validation reads proceed
/// without blocking each other.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: RwLock<HashMap<String, CapabilityToken>>,
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly minted token, replacing any prior token for the
    /// same thread.
    pub fn insert(&self, token: CapabilityToken) {
        let mut tokens = self.tokens.write().expect("token store lock poisoned");
        tokens.insert(token.thread_id.clone(), token);
    }

    /// Fetch the live token for a thread, for reuse by nested tool calls.
    #[must_use]
    pub fn get(&self, thread_id: &str) -> Option<CapabilityToken> {
        self.tokens.read().expect("token store lock poisoned").get(thread_id).cloned()
    }

    /// Validate a required capability against the thread's current token.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::NoLiveToken`] if the thread has no live
    /// token, or [`CapabilityError::Denied`] if the token does not grant
    /// `required`.
    pub fn validate(
        &self,
        thread_id: &str,
        required: &Capability,
        now: DateTime<Utc>,
    ) -> Result<(), CapabilityError> {
        let token = self
            .get(thread_id)
            .ok_or_else(|| CapabilityError::NoLiveToken(thread_id.to_string()))?;
        if token_grants(&token, required, now) {
            Ok(())
        } else {
            tracing::warn!(
                thread_id,
                action = %required.action,
                resource = %required.resource,
                "capability validation denied"
            );
            Err(CapabilityError::Denied {
                action: required.action.clone(),
                resource: required.resource.clone(),
                reason: "token does not grant this capability".to_string(),
            })
        }
    }

    /// Revoke (and remove) the token for a thread. Idempotent: revoking an
    /// already-absent thread is a no-op.
    pub fn revoke(&self, thread_id: &str) {
        self.tokens.write().expect("token store lock poisoned").remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> SandboxPolicy {
        SandboxPolicy::new("project/**", &["python3".to_string(), "npm".to_string()]).unwrap()
    }

    #[test]
    fn core_directive_may_mint_any_scope() {
        let perm = PermissionDeclaration {
            capability: "write".to_string(),
            scope: "fs".to_string(),
            path: Some("/etc/passwd".to_string()),
        };
        let token = mint(
            "t1",
            "core/reindex",
            &[perm],
            Duration::from_secs(60),
            true,
            &sandbox(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(token.capabilities.len(), 1);
    }

    #[test]
    fn non_core_directive_rejected_outside_project_sandbox() {
        let perm = PermissionDeclaration {
            capability: "write".to_string(),
            scope: "fs".to_string(),
            path: Some("/etc/passwd".to_string()),
        };
        let err = mint(
            "t1",
            "user/sketchy",
            &[perm],
            Duration::from_secs(60),
            false,
            &sandbox(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CapabilityError::OutOfSandbox { .. }));
    }

    #[test]
    fn non_core_directive_allowed_inside_project_sandbox() {
        let perm = PermissionDeclaration {
            capability: "write".to_string(),
            scope: "fs".to_string(),
            path: Some("project/.ai/outputs/report.md".to_string()),
        };
        mint(
            "t1",
            "user/report",
            &[perm],
            Duration::from_secs(60),
            false,
            &sandbox(),
            Utc::now(),
        )
        .unwrap();
    }

    #[test]
    fn shell_command_outside_allowlist_is_rejected() {
        let perm = PermissionDeclaration {
            capability: "execute".to_string(),
            scope: "shell".to_string(),
            path: Some("rm".to_string()),
        };
        let err = mint(
            "t1",
            "user/cleanup",
            &[perm],
            Duration::from_secs(60),
            false,
            &sandbox(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CapabilityError::OutOfSandbox { .. }));
    }

    #[test]
    fn store_validate_and_revoke_round_trip() {
        let store = TokenStore::new();
        let perm = PermissionDeclaration {
            capability: "execute".to_string(),
            scope: "shell".to_string(),
            path: Some("python3".to_string()),
        };
        let now = Utc::now();
        let token = mint(
            "t1",
            "core/run",
            &[perm],
            Duration::from_secs(60),
            true,
            &sandbox(),
            now,
        )
        .unwrap();
        store.insert(token);

        let required = Capability::new("execute", "shell").with_scope("python3");
        store.validate("t1", &required, now).unwrap();

        store.revoke("t1");
        assert!(store.validate("t1", &required, now).is_err());
    }

    #[test]
    fn validation_fails_closed_for_unknown_thread() {
        let store = TokenStore::new();
        let required = Capability::new("execute", "shell");
        assert!(matches!(
            store.validate("ghost", &required, Utc::now()),
            Err(CapabilityError::NoLiveToken(_))
        ));
    }

    #[test]
    fn expired_token_does_not_grant() {
        let store = TokenStore::new();
        let now = Utc::now();
        let mut token = mint(
            "t1",
            "core/run",
            &[],
            Duration::from_secs(0),
            true,
            &sandbox(),
            now,
        )
        .unwrap();
        token.expires_at = now - chrono::Duration::seconds(1);
        store.insert(token);
        let required = Capability::new("execute", "shell");
        assert!(store.validate("t1", &required, now).is_err());
    }
}
