// SPDX-License-Identifier: MIT OR Apache-2.0
//! The kernel-wide error taxonomy: a closed set of stable string kinds,
//! each carrying a message, an optional hint, and structured context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable-string error kinds (spec §7). The wire representation of a
/// variant is always its `kind_str()`, never a `Display` impl doing
/// double duty as both a wire code and a human message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ParseError,
    SchemaError,
    IntegrityFailed,
    UnresolvedExecutor,
    CycleDetected,
    DepthExceeded,
    IncompatibleLink,
    PermissionDenied,
    BudgetExceeded,
    Timeout,
    SpawnFailed,
    NetworkError,
    HttpError,
    Cancelled,
    ApprovalTimeout,
    AmbiguousResolution,
    UnknownOperation,
    InvalidArgument,
}

impl ErrorKind {
    /// The stable wire string for this kind.
    #[must_use]
    pub fn kind_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::SchemaError => "schema_error",
            ErrorKind::IntegrityFailed => "integrity_failed",
            ErrorKind::UnresolvedExecutor => "unresolved_executor",
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::DepthExceeded => "depth_exceeded",
            ErrorKind::IncompatibleLink => "incompatible_link",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::HttpError => "http_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ApprovalTimeout => "approval_timeout",
            ErrorKind::AmbiguousResolution => "ambiguous_resolution",
            ErrorKind::UnknownOperation => "unknown_operation",
            ErrorKind::InvalidArgument => "invalid_argument",
        }
    }

    /// `true` for kinds that are warn-level by default rather than fatal
    /// (spec §7: `ambiguous_resolution` is warn-level by default).
    #[must_use]
    pub fn is_warning_by_default(self) -> bool {
        matches!(self, ErrorKind::AmbiguousResolution)
    }
}

/// A kernel error: the uniform envelope every meta-operation may return
/// instead of a success payload.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct KernelError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

impl KernelError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Render as the wire-level `{error: {kind, message, hint?, context?}}` envelope.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        serde_json::json!({
            "error": {
                "kind": self.kind.kind_str(),
                "message": self.message,
                "hint": self.hint,
                "context": self.context,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_str_is_stable_and_exhaustive() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::ParseError,
            ErrorKind::SchemaError,
            ErrorKind::IntegrityFailed,
            ErrorKind::UnresolvedExecutor,
            ErrorKind::CycleDetected,
            ErrorKind::DepthExceeded,
            ErrorKind::IncompatibleLink,
            ErrorKind::PermissionDenied,
            ErrorKind::BudgetExceeded,
            ErrorKind::Timeout,
            ErrorKind::SpawnFailed,
            ErrorKind::NetworkError,
            ErrorKind::HttpError,
            ErrorKind::Cancelled,
            ErrorKind::ApprovalTimeout,
            ErrorKind::AmbiguousResolution,
            ErrorKind::UnknownOperation,
            ErrorKind::InvalidArgument,
        ];
        for k in kinds {
            assert!(!k.kind_str().is_empty());
        }
    }

    #[test]
    fn envelope_shape() {
        let err = KernelError::new(ErrorKind::PermissionDenied, "fs write denied")
            .with_hint("add 'fs.write' capability to the directive's <permissions>");
        let env = err.to_envelope();
        assert_eq!(env["error"]["kind"], "permission_denied");
        assert!(env["error"]["hint"].is_string());
    }
}
