// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kernel configuration: verification mode, XDG-style path resolution,
//! the process-environment allow-list, and the default sandbox policy for
//! user-authored directives. Loaded from TOML with environment-variable
//! overrides, the same two-stage load-then-validate shape the rest of the
//! workspace uses for its config crates.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integrity verification strictness (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Missing lockfile entry is a failure.
    Strict,
    /// Missing entry records the computed hash as a new pin.
    Tofu,
    /// No verification. Only permitted for project-local `.ai/` content.
    Off,
}

impl Default for VerificationMode {
    fn default() -> Self {
        VerificationMode::Tofu
    }
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerificationMode::Strict => "strict",
            VerificationMode::Tofu => "tofu",
            VerificationMode::Off => "off",
        };
        f.write_str(s)
    }
}

/// Retention policy for thread records and transcripts (spec §3 Lifecycles, §6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetentionPolicy {
    /// Hours a terminal thread record stays in the active session store.
    #[serde(default = "default_active_hours")]
    pub active_hours: u64,
    /// Days an archived transcript/audit log is retained.
    #[serde(default = "default_archived_days")]
    pub archived_days: u64,
}

fn default_active_hours() -> u64 {
    24
}

fn default_archived_days() -> u64 {
    7
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            active_hours: default_active_hours(),
            archived_days: default_archived_days(),
        }
    }
}

/// Fully resolved kernel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KernelConfig {
    #[serde(default)]
    pub verification_mode: VerificationMode,
    /// Root of user-authored content (default `~/.ai`), overridable by `$USER_SPACE`.
    pub user_space: PathBuf,
    /// Signing keys, sessions, telemetry root.
    pub state_home: PathBuf,
    /// HTTP response cache, embeddings cache root.
    pub cache_home: PathBuf,
    /// Process-environment variable names that may be inherited by a primitive.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Shell commands a user-authored directive's sandbox may request.
    #[serde(default)]
    pub shell_allowlist: Vec<String>,
    /// `tracing` env-filter default directive (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Grace added on top of a directive's declared max runtime when minting
    /// a token's TTL, expressed as a fraction (spec §4.5: "+10% grace").
    #[serde(default = "default_ttl_grace")]
    pub ttl_grace: f64,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ttl_grace() -> f64 {
    0.10
}

const MAX_TTL_GRACE: f64 = 1.0;
const LARGE_TTL_GRACE_THRESHOLD: f64 = 0.5;
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// As parsed from TOML, before defaults/overrides/validation are applied.
/// Every field is optional so a partial file (or no file at all) is valid
/// input to [`load_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    pub verification_mode: Option<VerificationMode>,
    pub user_space: Option<PathBuf>,
    pub state_home: Option<PathBuf>,
    pub cache_home: Option<PathBuf>,
    pub env_allowlist: Option<Vec<String>>,
    pub shell_allowlist: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub ttl_grace: Option<f64>,
    pub retention: Option<RetentionPolicy>,
    /// Deprecated; superseded by `shell_allowlist`. Triggers
    /// [`ConfigWarning::DeprecatedField`] when present.
    pub allowed_commands: Option<Vec<String>>,
}

/// Errors that abort configuration loading outright.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("failed to parse config at {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    ValidationError(String),
    #[error("conflicting values for `{field}`: base={base}, overlay={overlay}")]
    MergeConflict {
        field: String,
        base: String,
        overlay: String,
    },
}

/// Non-fatal issues surfaced after a config loads successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    DeprecatedField { field: String, replacement: String },
    MissingOptionalField { field: String },
    LargeTtlGrace { value: f64 },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field, replacement } => {
                write!(f, "`{field}` is deprecated; use `{replacement}` instead")
            }
            ConfigWarning::MissingOptionalField { field } => {
                write!(f, "optional field `{field}` not set; using default")
            }
            ConfigWarning::LargeTtlGrace { value } => {
                write!(
                    f,
                    "ttl_grace={value} is unusually large (>{LARGE_TTL_GRACE_THRESHOLD})"
                )
            }
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load, override, validate, and resolve defaults in one call.
///
/// # Errors
///
/// Returns [`ConfigError`] if `path` is given but missing, unparsable, or
/// fails validation.
pub fn load_config(path: Option<&Path>) -> Result<(KernelConfig, Vec<ConfigWarning>), ConfigError> {
    let mut raw = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .map_err(|_| ConfigError::FileNotFound(p.to_path_buf()))?;
            parse_toml(&text, p)?
        }
        None => RawConfig::default(),
    };
    apply_env_overrides(&mut raw);
    let warnings = validate_config(&raw)?;
    Ok((resolve(raw), warnings))
}

/// Parse raw TOML text into a [`RawConfig`]. `path` is used only for error context.
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed TOML.
pub fn parse_toml(text: &str, path: &Path) -> Result<RawConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply environment-variable overrides, highest precedence last (spec §6:
/// `USER_SPACE` is the one kernel-recognized override; the rest are this
/// repo's own `KIWI_*` extensions for test/deployment convenience).
pub fn apply_env_overrides(raw: &mut RawConfig) {
    if let Ok(v) = std::env::var("USER_SPACE") {
        raw.user_space = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("KIWI_STATE_HOME") {
        raw.state_home = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("KIWI_CACHE_HOME") {
        raw.cache_home = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("KIWI_LOG_LEVEL") {
        raw.log_level = Some(v);
    }
    if let Ok(v) = std::env::var("KIWI_VERIFICATION_MODE") {
        raw.verification_mode = match v.as_str() {
            "strict" => Some(VerificationMode::Strict),
            "tofu" => Some(VerificationMode::Tofu),
            "off" => Some(VerificationMode::Off),
            _ => raw.verification_mode,
        };
    }
}

/// Validate field values and collect non-fatal warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] for a log level outside
/// [`VALID_LOG_LEVELS`] or a `ttl_grace` outside `[0, MAX_TTL_GRACE]`.
pub fn validate_config(raw: &RawConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut warnings = Vec::new();

    if let Some(level) = &raw.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        return Err(ConfigError::ValidationError(format!(
            "log_level must be one of {VALID_LOG_LEVELS:?}, got {level:?}"
        )));
    }

    if let Some(grace) = raw.ttl_grace {
        if !(0.0..=MAX_TTL_GRACE).contains(&grace) {
            return Err(ConfigError::ValidationError(format!(
                "ttl_grace must be within [0, {MAX_TTL_GRACE}], got {grace}"
            )));
        }
        if grace > LARGE_TTL_GRACE_THRESHOLD {
            warnings.push(ConfigWarning::LargeTtlGrace { value: grace });
        }
    }

    if let Some(deprecated) = &raw.allowed_commands
        && !deprecated.is_empty()
    {
        warnings.push(ConfigWarning::DeprecatedField {
            field: "allowed_commands".to_string(),
            replacement: "shell_allowlist".to_string(),
        });
    }

    if raw.shell_allowlist.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "shell_allowlist".to_string(),
        });
    }

    Ok(warnings)
}

fn resolve(raw: RawConfig) -> KernelConfig {
    let home = home_dir();
    let user_space = raw.user_space.unwrap_or_else(|| home.join(".ai"));
    let state_home = raw
        .state_home
        .unwrap_or_else(|| home.join(".local/state/kiwi"));
    let cache_home = raw.cache_home.unwrap_or_else(|| home.join(".cache/kiwi"));
    let mut shell_allowlist = raw.shell_allowlist.unwrap_or_default();
    if let Some(deprecated) = raw.allowed_commands {
        shell_allowlist.extend(deprecated);
    }
    shell_allowlist.sort();
    shell_allowlist.dedup();

    KernelConfig {
        verification_mode: raw.verification_mode.unwrap_or_default(),
        user_space,
        state_home,
        cache_home,
        env_allowlist: raw.env_allowlist.unwrap_or_default(),
        shell_allowlist,
        log_level: raw.log_level.unwrap_or_else(default_log_level),
        ttl_grace: raw.ttl_grace.unwrap_or_else(default_ttl_grace),
        retention: raw.retention.unwrap_or_default(),
    }
}

/// Right-biased merge of two raw configs: every field set in `overlay` wins;
/// unset fields fall back to `base`. Used to layer a project-local config
/// file over a user-global one.
///
/// # Errors
///
/// Returns [`ConfigError::MergeConflict`] if both configs set
/// `verification_mode` to different values — verification strictness is not
/// allowed to silently weaken via overlay.
pub fn merge_configs(base: RawConfig, overlay: RawConfig) -> Result<RawConfig, ConfigError> {
    if let (Some(b), Some(o)) = (base.verification_mode, overlay.verification_mode)
        && b != o
    {
        return Err(ConfigError::MergeConflict {
            field: "verification_mode".to_string(),
            base: b.to_string(),
            overlay: o.to_string(),
        });
    }
    Ok(RawConfig {
        verification_mode: overlay.verification_mode.or(base.verification_mode),
        user_space: overlay.user_space.or(base.user_space),
        state_home: overlay.state_home.or(base.state_home),
        cache_home: overlay.cache_home.or(base.cache_home),
        env_allowlist: overlay.env_allowlist.or(base.env_allowlist),
        shell_allowlist: overlay.shell_allowlist.or(base.shell_allowlist),
        log_level: overlay.log_level.or(base.log_level),
        ttl_grace: overlay.ttl_grace.or(base.ttl_grace),
        retention: overlay.retention.or(base.retention),
        allowed_commands: overlay.allowed_commands.or(base.allowed_commands),
    })
}

/// A single key's value pulled from the process environment, retained only
/// if its name is present in [`KernelConfig::env_allowlist`].
#[must_use]
pub fn filter_process_env(allowlist: &[String]) -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| allowlist.iter().any(|a| a == k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_user_space_under_home() {
        let (cfg, warnings) = load_config(None).unwrap();
        assert!(cfg.user_space.ends_with(".ai"));
        assert_eq!(cfg.verification_mode, VerificationMode::Tofu);
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MissingOptionalField { .. })));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut raw = RawConfig::default();
        raw.log_level = Some("verbose".to_string());
        let err = validate_config(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn deprecated_allowed_commands_warns_and_merges_into_shell_allowlist() {
        let mut raw = RawConfig::default();
        raw.allowed_commands = Some(vec!["git".to_string()]);
        let warnings = validate_config(&raw).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::DeprecatedField { .. })));
        let cfg = resolve(raw);
        assert!(cfg.shell_allowlist.contains(&"git".to_string()));
    }

    #[test]
    fn large_ttl_grace_warns_but_is_accepted() {
        let mut raw = RawConfig::default();
        raw.ttl_grace = Some(0.75);
        let warnings = validate_config(&raw).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeTtlGrace { .. })));
    }

    #[test]
    fn out_of_range_ttl_grace_is_an_error() {
        let mut raw = RawConfig::default();
        raw.ttl_grace = Some(1.5);
        assert!(validate_config(&raw).is_err());
    }

    #[test]
    fn merge_overlay_wins_on_disjoint_fields() {
        let base = RawConfig {
            log_level: Some("info".to_string()),
            ..RawConfig::default()
        };
        let overlay = RawConfig {
            ttl_grace: Some(0.2),
            ..RawConfig::default()
        };
        let merged = merge_configs(base, overlay).unwrap();
        assert_eq!(merged.log_level.as_deref(), Some("info"));
        assert_eq!(merged.ttl_grace, Some(0.2));
    }

    #[test]
    fn merge_conflicting_verification_mode_is_rejected() {
        let base = RawConfig {
            verification_mode: Some(VerificationMode::Strict),
            ..RawConfig::default()
        };
        let overlay = RawConfig {
            verification_mode: Some(VerificationMode::Off),
            ..RawConfig::default()
        };
        assert!(merge_configs(base, overlay).is_err());
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("KIWI_LOG_LEVEL", "debug");
        let mut raw = RawConfig::default();
        apply_env_overrides(&mut raw);
        assert_eq!(raw.log_level.as_deref(), Some("debug"));
        std::env::remove_var("KIWI_LOG_LEVEL");
    }
}
