// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chain Resolver (C4): walk `executor` references from a leaf tool to a
//! primitive, validating link compatibility and merging `config` fragments
//! along the way.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashSet};

use kiwi_core::{PrimitiveKind, ToolManifest};
use serde_json::Value;
use thiserror::Error;

/// Spec §4.4: "Max depth 8".
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Chain-resolution and link-compatibility failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("cycle detected at tool_id `{0}`")]
    CycleDetected(String),
    #[error("chain depth exceeded {MAX_CHAIN_DEPTH} (at tool_id `{0}`)")]
    DepthExceeded(String),
    #[error("unresolved executor `{0}`")]
    UnresolvedExecutor(String),
    #[error("incompatible link at position {index}: {reason}")]
    IncompatibleLink { index: usize, reason: String },
}

/// Capabilities a primitive grants its immediate caller for free, used when
/// checking the capability-floor-monotonicity rule against the final link.
#[must_use]
pub fn primitive_granted_capabilities(kind: PrimitiveKind) -> Vec<String> {
    match kind {
        PrimitiveKind::Subprocess => vec!["execute:shell".to_string()],
        PrimitiveKind::Http => vec!["execute:http".to_string()],
    }
}

/// Extract every `${name}` placeholder referenced in a tool's `config`
/// values (recursing through nested arrays/objects).
fn referenced_params(config: &BTreeMap<String, Value>) -> HashSet<String> {
    fn walk(value: &Value, out: &mut HashSet<String>) {
        match value {
            Value::String(s) => {
                let mut rest = s.as_str();
                while let Some(start) = rest.find("${") {
                    let after = &rest[start + 2..];
                    if let Some(end) = after.find('}') {
                        out.insert(after[..end].to_string());
                        rest = &after[end + 1..];
                    } else {
                        break;
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = HashSet::new();
    config.values().for_each(|v| walk(v, &mut out));
    out
}

/// Check a single link `current -> next` for compatibility (spec §4.4).
///
/// # Errors
///
/// Returns [`ChainError::IncompatibleLink`] if the executor reference is
/// inconsistent, a referenced config param is not declared by `next`, or the
/// capability floor is violated.
pub fn check_compatibility(
    index: usize,
    current: &ToolManifest,
    next: &ToolManifest,
) -> Result<(), ChainError> {
    if current.executor.as_deref() != Some(next.tool_id.as_str()) {
        return Err(ChainError::IncompatibleLink {
            index,
            reason: format!(
                "executor `{:?}` does not name the next link's tool_id `{}`",
                current.executor, next.tool_id
            ),
        });
    }

    let declared: HashSet<&str> = next.parameters.iter().map(|p| p.name.as_str()).collect();
    for referenced in referenced_params(&current.config) {
        if !declared.contains(referenced.as_str()) {
            return Err(ChainError::IncompatibleLink {
                index,
                reason: format!(
                    "config references `${{{referenced}}}` which `{}` does not declare as a parameter",
                    next.tool_id
                ),
            });
        }
    }

    let next_granted: HashSet<&str> = match &next.tool_type {
        kiwi_core::ToolType::Primitive { kind } => {
            return check_capability_floor(index, current, next, &primitive_granted_capabilities(*kind));
        }
        _ => next.required_capabilities.iter().map(String::as_str).collect(),
    };
    let caps: Vec<String> = next_granted.into_iter().map(str::to_string).collect();
    check_capability_floor(index, current, next, &caps)
}

fn check_capability_floor(
    index: usize,
    current: &ToolManifest,
    next: &ToolManifest,
    extra_grants: &[String],
) -> Result<(), ChainError> {
    let allowed: HashSet<&str> = next
        .required_capabilities
        .iter()
        .map(String::as_str)
        .chain(extra_grants.iter().map(String::as_str))
        .collect();
    for cap in &current.required_capabilities {
        if !allowed.contains(cap.as_str()) {
            return Err(ChainError::IncompatibleLink {
                index,
                reason: format!(
                    "capability `{cap}` required by `{}` is not granted by `{}` or its primitive",
                    current.tool_id, next.tool_id
                ),
            });
        }
    }
    Ok(())
}

/// Resolve the chain starting from `start`, using `lookup` to fetch each
/// subsequent link by `tool_id`.
///
/// # Errors
///
/// Returns [`ChainError::CycleDetected`], [`ChainError::DepthExceeded`],
/// [`ChainError::UnresolvedExecutor`], or [`ChainError::IncompatibleLink`].
pub fn resolve_chain<F>(start: ToolManifest, mut lookup: F) -> Result<Vec<ToolManifest>, ChainError>
where
    F: FnMut(&str) -> Option<ToolManifest>,
{
    let mut chain = vec![start];
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(chain[0].tool_id.clone());

    loop {
        let current = chain.last().expect("chain is never empty");
        if current.tool_type.is_primitive() {
            return Ok(chain);
        }
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(ChainError::DepthExceeded(current.tool_id.clone()));
        }
        let Some(executor_id) = current.executor.clone() else {
            return Err(ChainError::UnresolvedExecutor(current.tool_id.clone()));
        };
        let Some(next) = lookup(&executor_id) else {
            return Err(ChainError::UnresolvedExecutor(executor_id));
        };
        if !seen.insert(next.tool_id.clone()) {
            return Err(ChainError::CycleDetected(next.tool_id.clone()));
        }

        check_compatibility(chain.len() - 1, current, &next)?;
        chain.push(next);
    }
}

/// Right-biased merge of every link's `config`, runtime parameters applied
/// last, followed by `${param}`/`${ENV_VAR}` substitution (spec §4.4).
#[must_use]
pub fn merge_and_substitute(
    chain: &[ToolManifest],
    runtime_params: &BTreeMap<String, Value>,
    env: &BTreeMap<String, String>,
) -> BTreeMap<String, Value> {
    let mut merged: BTreeMap<String, Value> = BTreeMap::new();
    for link in chain {
        for (k, v) in &link.config {
            merged.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in runtime_params {
        merged.insert(k.clone(), v.clone());
    }
    merged
        .into_iter()
        .map(|(k, v)| (k, substitute_value(v, runtime_params, env)))
        .collect()
}

fn substitute_value(value: Value, params: &BTreeMap<String, Value>, env: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(&s, params, env)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute_value(v, params, env))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_value(v, params, env)))
                .collect(),
        ),
        other => other,
    }
}

fn substitute_string(input: &str, params: &BTreeMap<String, Value>, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        if let Some(v) = params.get(name) {
            out.push_str(&value_to_plain_string(v));
        } else if let Some(v) = env.get(name) {
            out.push_str(v);
        } else {
            out.push_str(&format!("${{{name}}}"));
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
