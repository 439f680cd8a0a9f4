// SPDX-License-Identifier: MIT OR Apache-2.0
//! Meta-Operation Dispatcher (C11): the four public entry points —
//! `search`, `load`, `execute`, `help` — routed by item type to the typed
//! subsystems built in the sibling `kiwi-*` crates.
//!
//! Grounded on the teacher's `abp-protocol::router::MessageRouter`
//! pattern-matched-dispatch shape, re-targeted from a wire-level message
//! router to an in-process operation table over `ItemType` and an action
//! string. The uniform `{error: {kind, message, hint?, context?}}` envelope
//! is `kiwi_core::KernelError::to_envelope`, unchanged from the core crate.

#![warn(missing_docs)]

pub mod stdio;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use kiwi_capability::TokenStore;
use kiwi_chain::{check_compatibility, merge_and_substitute, resolve_chain};
use kiwi_core::{
    Capability, CapabilityToken, Directive, ErrorKind, ItemType, KernelError, PrimitiveKind, Source,
    ToolManifest, ToolType,
};
use kiwi_exec_http::{Extractor, HttpMethod, HttpRequest, RetryOn, RetryPolicy};
use kiwi_exec_subprocess::SubprocessRequest;
use kiwi_glob::IncludeExcludeGlobs;
use kiwi_harness::{HarnessError, LlmClient, ToolExecutor, WorkerConfig};
use kiwi_integrity::{Lockfile, VerificationOutcome};
use kiwi_manifest::{parse_directive, parse_knowledge, parse_tool_manifest};
use kiwi_registry::ThreadRegistry;
use kiwi_resolver::{ResolveOutcome, ResolverRoots};
use kiwi_sink::{FanOut, FileSink, LineSplitSink, ParseJsonSink, RegexExtractSink, ReturnSink, Sink, StdoutSink};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

/// Bridges the spec's "Auth Store (OS keychain)" external collaborator: a
/// narrow trait, not a concrete keychain integration (out of scope per
/// §1), with an in-memory default suitable for tests and local use.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<String>;
}

/// Env-var-backed default [`SecretResolver`]: looks up `name` in the
/// process environment. Sufficient for local development; a real keychain
/// integration is an external collaborator per the distilled spec.
#[derive(Debug, Default)]
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// One hit from [`Dispatcher::search`].
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub item_type: ItemType,
    pub source: Source,
    pub path: PathBuf,
}

/// The typed payload a successful [`Dispatcher::load`] returns.
#[derive(Debug, Clone)]
pub enum LoadedPayload {
    Tool(ToolManifest),
    Directive(Directive),
    Knowledge(Value),
}

/// A fully loaded, resolution-and-integrity-checked item.
#[derive(Debug, Clone)]
pub struct LoadedItem {
    pub source: Source,
    pub path: PathBuf,
    pub verification: VerificationOutcome,
    pub payload: LoadedPayload,
}

fn not_found(item_type: ItemType, item_id: &str) -> KernelError {
    KernelError::new(ErrorKind::NotFound, format!("{item_type:?} `{item_id}` not found"))
        .with_context("item_id", item_id)
}

fn io_err(kind: ErrorKind, message: impl Into<String>) -> KernelError {
    KernelError::new(kind, message.into())
}

/// The central dispatcher: holds every subsystem the four meta-operations
/// route across. Constructed explicitly by `kiwi-kernel`; no global state.
pub struct Dispatcher {
    pub roots: ResolverRoots,
    pub config: kiwi_config::KernelConfig,
    pub lockfile_path: PathBuf,
    lockfile: AsyncMutex<Lockfile>,
    pub tokens: Arc<TokenStore>,
    pub registry: Arc<ThreadRegistry>,
    pub http_client: reqwest::Client,
    pub llm: Arc<dyn LlmClient>,
    pub secrets: Arc<dyn SecretResolver>,
    env_allowlist: IncludeExcludeGlobs,
    /// Lets `spawn_thread` hand `kiwi_harness::spawn_worker` an
    /// `Arc<dyn ToolExecutor>` of this same dispatcher without a second
    /// owning `Arc` — set once at construction via `Arc::new_cyclic`.
    self_ref: Weak<Dispatcher>,
}

/// Construction failures.
#[derive(Debug, Error)]
pub enum DispatcherInitError {
    #[error("failed to load lockfile at {0:?}: {1}")]
    Lockfile(PathBuf, kiwi_integrity::IntegrityError),
    #[error("invalid env allow-list pattern: {0}")]
    BadAllowlist(#[source] anyhow::Error),
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns [`DispatcherInitError`] if the lockfile is malformed or the
    /// configured env allow-list contains an invalid glob pattern.
    pub fn new(
        roots: ResolverRoots,
        config: kiwi_config::KernelConfig,
        lockfile_path: PathBuf,
        tokens: Arc<TokenStore>,
        registry: Arc<ThreadRegistry>,
        llm: Arc<dyn LlmClient>,
        secrets: Arc<dyn SecretResolver>,
    ) -> Result<Arc<Self>, DispatcherInitError> {
        let lockfile = Lockfile::load(&lockfile_path)
            .map_err(|e| DispatcherInitError::Lockfile(lockfile_path.clone(), e))?;
        let env_allowlist = IncludeExcludeGlobs::new(&config.env_allowlist, &[])
            .map_err(DispatcherInitError::BadAllowlist)?;
        Ok(Arc::new_cyclic(|weak| Self {
            roots,
            config,
            lockfile_path,
            lockfile: AsyncMutex::new(lockfile),
            tokens,
            registry,
            http_client: reqwest::Client::new(),
            llm,
            secrets,
            env_allowlist,
            self_ref: weak.clone(),
        }))
    }

    // -----------------------------------------------------------------
    // search
    // -----------------------------------------------------------------

    /// Substring search over artifact filenames under the configured
    /// content roots. Full-text/embedding search is named as an external
    /// collaborator in the distilled spec's Non-goals — this is the
    /// simplest implementation consistent with that boundary.
    #[must_use]
    pub fn search(&self, item_type: ItemType, query: &str, source: Option<Source>, limit: usize) -> Vec<SearchResult> {
        let query_lower = query.to_lowercase();
        let mut results = Vec::new();
        let order: &[Source] = match source {
            Some(s) => std::slice::from_ref(
                Source::SEARCH_ORDER.iter().find(|x| **x == s).unwrap_or(&Source::SEARCH_ORDER[0]),
            ),
            None => &Source::SEARCH_ORDER,
        };
        for &src in order {
            let Some(root) = self.roots.for_source(src) else { continue };
            let dir = root.join(item_type.dir_name());
            if !dir.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let stem = entry.path().file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if stem.to_lowercase().contains(&query_lower) {
                    results.push(SearchResult {
                        id: stem.to_string(),
                        item_type,
                        source: src,
                        path: entry.path().to_path_buf(),
                    });
                    if results.len() >= limit {
                        return results;
                    }
                }
            }
        }
        results
    }

    // -----------------------------------------------------------------
    // load
    // -----------------------------------------------------------------

    /// Resolve, read, parse, and integrity-verify one item.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if resolution fails,
    /// [`ErrorKind::ParseError`]/[`ErrorKind::SchemaError`] if the artifact
    /// cannot be parsed, or [`ErrorKind::IntegrityFailed`] under
    /// [`kiwi_config::VerificationMode::Strict`] when no lockfile pin
    /// exists.
    pub async fn load(&self, item_type: ItemType, item_id: &str, source: Option<Source>) -> Result<LoadedItem, KernelError> {
        let outcome = kiwi_resolver::resolve(&self.roots, item_id, item_type, source)
            .map_err(|e| io_err(ErrorKind::NotFound, e.to_string()))?;
        let ResolveOutcome::Found { path, source, .. } = outcome else {
            return Err(not_found(item_type, item_id));
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| io_err(ErrorKind::ParseError, format!("reading {}: {e}", path.display())))?;
        let artifact = path.display().to_string();

        let mut lockfile = self.lockfile.lock().await;
        let now = Utc::now();

        let (payload, version) = match item_type {
            ItemType::Tool => {
                let manifest = parse_tool_manifest(&content, &artifact)
                    .map_err(|e| io_err(ErrorKind::SchemaError, e.to_string()))?;
                let version = manifest.version.clone();
                (LoadedPayload::Tool(manifest), version)
            }
            ItemType::Directive => {
                let directive = parse_directive(&content, &artifact)
                    .map_err(|e| io_err(ErrorKind::SchemaError, e.to_string()))?;
                let version = directive.version.clone();
                (LoadedPayload::Directive(directive), version)
            }
            ItemType::Knowledge => {
                let entry = parse_knowledge(&content, &artifact)
                    .map_err(|e| io_err(ErrorKind::SchemaError, e.to_string()))?;
                let version = "1".to_string();
                (LoadedPayload::Knowledge(serde_json::to_value(entry).unwrap_or(Value::Null)), version)
            }
        };

        let verification = kiwi_integrity::verify_single_file(
            &content,
            item_id,
            &version,
            self.config.verification_mode,
            &mut lockfile,
            now,
        );
        if !verification.verified && self.config.verification_mode == kiwi_config::VerificationMode::Strict {
            return Err(KernelError::new(
                ErrorKind::IntegrityFailed,
                verification.reason.clone().unwrap_or_default(),
            )
            .with_context("item_id", item_id.to_string()));
        }
        if self.config.verification_mode == kiwi_config::VerificationMode::Tofu {
            let _ = lockfile.save(&self.lockfile_path);
        }

        Ok(LoadedItem { source, path, verification, payload })
    }

    // -----------------------------------------------------------------
    // execute
    // -----------------------------------------------------------------

    /// Dispatch one `execute(item_type, action, item_id, parameters, ...)`
    /// call per spec §4.11's per-item-type action contract.
    ///
    /// # Errors
    ///
    /// Returns a [`KernelError`] for every failure mode — there is no
    /// separate panic/error-type split at this boundary; every outcome is
    /// the uniform envelope.
    pub async fn execute(
        &self,
        item_type: ItemType,
        action: &str,
        item_id: &str,
        parameters: Value,
        project_path: Option<&Path>,
        token: Option<&CapabilityToken>,
    ) -> Result<Value, KernelError> {
        match (item_type, action) {
            (_, "publish" | "delete") => Err(KernelError::new(
                ErrorKind::UnknownOperation,
                format!("`{action}` is not a kernel operation"),
            )
            .with_hint("publish/delete are served by the external registry tool over HTTP")),

            (ItemType::Directive, "run") => {
                let item = self.load(ItemType::Directive, item_id, None).await?;
                let LoadedPayload::Directive(directive) = item.payload else {
                    unreachable!("load(Directive, ..) always returns LoadedPayload::Directive")
                };
                Ok(serde_json::to_value(directive).unwrap_or(Value::Null))
            }
            (ItemType::Directive, "create" | "update") => self.write_text_artifact(item_type, item_id, project_path, &parameters),
            (ItemType::Directive, "sign") => self.sign_artifact(item_type, item_id, None).await,

            (ItemType::Knowledge, "run") => {
                let item = self.load(ItemType::Knowledge, item_id, None).await?;
                let LoadedPayload::Knowledge(body) = item.payload else {
                    unreachable!("load(Knowledge, ..) always returns LoadedPayload::Knowledge")
                };
                Ok(body)
            }
            (ItemType::Knowledge, "create" | "update") => self.write_text_artifact(item_type, item_id, project_path, &parameters),
            (ItemType::Knowledge, "sign") => self.sign_artifact(item_type, item_id, None).await,

            (ItemType::Tool, "run") if item_id == "spawn-thread" => {
                self.spawn_thread(parameters, token).await
            }
            (ItemType::Tool, "run") => {
                let token = token.ok_or_else(|| {
                    KernelError::new(ErrorKind::PermissionDenied, "tool run requires a capability token")
                })?;
                self.run_tool(item_id, parameters, token).await
            }
            (ItemType::Tool, "create" | "update") => self.write_text_artifact(item_type, item_id, project_path, &parameters),
            (ItemType::Tool, "sign") => self.sign_artifact(item_type, item_id, None).await,

            (_, other) => Err(KernelError::new(
                ErrorKind::UnknownOperation,
                format!("no `{other}` action for {item_type:?}"),
            )),
        }
    }

    fn write_text_artifact(
        &self,
        item_type: ItemType,
        item_id: &str,
        project_path: Option<&Path>,
        parameters: &Value,
    ) -> Result<Value, KernelError> {
        let project_path = project_path.ok_or_else(|| {
            KernelError::new(ErrorKind::InvalidArgument, "create/update requires a project_path")
        })?;
        let content = parameters
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| KernelError::new(ErrorKind::InvalidArgument, "create/update requires `content`"))?;
        let extension = match item_type {
            ItemType::Tool => "yaml",
            ItemType::Directive | ItemType::Knowledge => "md",
        };
        let dest = project_path.join(item_type.dir_name()).join(format!("{item_id}.{extension}"));
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err(ErrorKind::ParseError, format!("creating {}: {e}", parent.display())))?;
        }
        std::fs::write(&dest, content)
            .map_err(|e| io_err(ErrorKind::ParseError, format!("writing {}: {e}", dest.display())))?;
        Ok(serde_json::json!({"path": dest.display().to_string()}))
    }

    async fn sign_artifact(&self, item_type: ItemType, item_id: &str, source: Option<Source>) -> Result<Value, KernelError> {
        let outcome = kiwi_resolver::resolve(&self.roots, item_id, item_type, source)
            .map_err(|e| io_err(ErrorKind::NotFound, e.to_string()))?;
        let ResolveOutcome::Found { path, .. } = outcome else {
            return Err(not_found(item_type, item_id));
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| io_err(ErrorKind::ParseError, format!("reading {}: {e}", path.display())))?;
        let hash = kiwi_core::single_file_hash(&content);
        let signed = kiwi_integrity::sign_comment(&content, &hash, Utc::now());
        std::fs::write(&path, signed)
            .map_err(|e| io_err(ErrorKind::ParseError, format!("writing {}: {e}", path.display())))?;
        Ok(serde_json::json!({"canonical_hash": hash}))
    }

    async fn spawn_thread(&self, parameters: Value, parent_token: Option<&CapabilityToken>) -> Result<Value, KernelError> {
        let directive_id = parameters
            .get("directive_id")
            .and_then(Value::as_str)
            .ok_or_else(|| KernelError::new(ErrorKind::InvalidArgument, "spawn-thread requires `directive_id`"))?;
        let inputs = parameters.get("inputs").cloned().unwrap_or(Value::Null);

        let item = self.load(ItemType::Directive, directive_id, None).await?;
        let source = item.source;
        let LoadedPayload::Directive(directive) = item.payload else {
            unreachable!("load(Directive, ..) always returns LoadedPayload::Directive")
        };

        let depth = parameters.get("depth").and_then(Value::as_u64).unwrap_or(0) as u32
            + u32::from(parent_token.is_some());

        let thread_id = format!("thr_{}", uuid::Uuid::new_v4());
        let sandbox = kiwi_capability::SandboxPolicy::new("**", &self.config.shell_allowlist)
            .map_err(|e| io_err(ErrorKind::SchemaError, e.to_string()))?;

        let config = WorkerConfig {
            thread_id: thread_id.clone(),
            directive,
            inputs,
            parent_thread_id: parent_token.map(|t| t.thread_id.clone()),
            granted_capabilities: parent_token.map(|t| t.capabilities.clone()),
            depth,
            ttl: None,
            is_core: matches!(source, Source::Package),
            sandbox,
        };

        let executor: Arc<dyn ToolExecutor> = self
            .self_ref
            .upgrade()
            .expect("dispatcher outlives every worker it spawns");

        kiwi_harness::spawn_worker(config, self.registry.clone(), self.tokens.clone(), self.llm.clone(), executor).map_err(
            |e| match e {
                HarnessError::DepthLimitExceeded => {
                    KernelError::new(ErrorKind::DepthExceeded, "nested spawn-thread depth limit exceeded")
                }
                other => io_err(ErrorKind::SpawnFailed, other.to_string()),
            },
        )?;

        Ok(serde_json::json!({"thread_id": thread_id}))
    }

    async fn run_tool(&self, tool_id: &str, parameters: Value, token: &CapabilityToken) -> Result<Value, KernelError> {
        let item = self.load(ItemType::Tool, tool_id, None).await?;
        let LoadedPayload::Tool(leaf) = item.payload else {
            unreachable!("load(Tool, ..) always returns LoadedPayload::Tool")
        };

        let chain = resolve_chain(leaf, |next_id| {
            let outcome = kiwi_resolver::resolve(&self.roots, next_id, ItemType::Tool, None).ok()?;
            let ResolveOutcome::Found { path, .. } = outcome else { return None };
            let content = std::fs::read_to_string(path).ok()?;
            parse_tool_manifest(&content, next_id).ok()
        })
        .map_err(|e| io_err(ErrorKind::IncompatibleLink, e.to_string()))?;

        for (i, pair) in chain.windows(2).enumerate() {
            check_compatibility(i, &pair[0], &pair[1]).map_err(|e| io_err(ErrorKind::IncompatibleLink, e.to_string()))?;
        }

        let runtime_params: BTreeMap<String, Value> = parameters
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let env: BTreeMap<String, String> = self.resolve_manifest_env(&chain, &parameters).await;
        let merged = merge_and_substitute(&chain, &runtime_params, &env);

        let final_link = chain.last().expect("chain always has at least one link");
        let ToolType::Primitive { kind } = &final_link.tool_type else {
            return Err(KernelError::new(
                ErrorKind::UnresolvedExecutor,
                format!("chain for `{tool_id}` did not terminate in a primitive"),
            ));
        };

        match kind {
            PrimitiveKind::Subprocess => self.run_subprocess(&merged, &parameters, &env, token).await,
            PrimitiveKind::Http => self.run_http(&merged, &parameters, &env, token).await,
        }
    }

    async fn resolve_manifest_env(&self, chain: &[ToolManifest], parameters: &Value) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| self.env_allowlist.decide_str(k).is_allowed())
            .collect();
        for link in chain {
            if let Some(Value::Object(block)) = link.config.get("env") {
                for (k, v) in block {
                    if let Some(name) = v.as_str().and_then(|s| s.strip_prefix("${").and_then(|s| s.strip_suffix('}'))) {
                        if let Some(secret) = self.secrets.resolve(name).await {
                            env.insert(k.clone(), secret);
                        }
                    } else if let Some(s) = v.as_str() {
                        env.insert(k.clone(), s.to_string());
                    }
                }
            }
        }
        if let Some(Value::Object(caller_env)) = parameters.get("env") {
            for (k, v) in caller_env {
                if let Some(s) = v.as_str() {
                    env.insert(k.clone(), s.to_string());
                }
            }
        }
        env
    }

    async fn run_subprocess(
        &self,
        merged: &BTreeMap<String, Value>,
        parameters: &Value,
        env: &BTreeMap<String, String>,
        token: &CapabilityToken,
    ) -> Result<Value, KernelError> {
        let command = string_field(merged, "command").ok_or_else(|| {
            KernelError::new(ErrorKind::InvalidArgument, "subprocess tool is missing `command` in its merged config")
        })?;
        let args = merged
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let cwd = parameters
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let timeout_ms = merged.get("timeout_ms").and_then(Value::as_u64).unwrap_or(30_000);

        let required = Capability::new("execute", "shell").with_scope(command.clone());
        kiwi_exec_subprocess::check_preconditions(token, &required, &cwd)
            .map_err(|e| io_err(ErrorKind::PermissionDenied, e.to_string()))?;

        let mut request = SubprocessRequest::new(command, cwd, timeout_ms).with_args(args);
        request.env = env.clone();

        let (fan_out, return_sink) = build_fan_out(parameters.get("sinks"));
        let outcome = kiwi_exec_subprocess::run(request, &self.env_allowlist, &fan_out)
            .await
            .map_err(|e| io_err(ErrorKind::SpawnFailed, e.to_string()))?;

        Ok(serde_json::json!({
            "exit_code": outcome.exit_code,
            "stdout": String::from_utf8_lossy(&return_sink.collected()),
            "duration_ms": outcome.duration_ms,
            "signal_terminated": outcome.signal_terminated,
        }))
    }

    async fn run_http(
        &self,
        merged: &BTreeMap<String, Value>,
        parameters: &Value,
        _env: &BTreeMap<String, String>,
        token: &CapabilityToken,
    ) -> Result<Value, KernelError> {
        let url_template = string_field(merged, "url").ok_or_else(|| {
            KernelError::new(ErrorKind::InvalidArgument, "http tool is missing `url` in its merged config")
        })?;
        let method = match string_field(merged, "method").unwrap_or_else(|| "GET".to_string()).to_uppercase().as_str() {
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            _ => HttpMethod::Get,
        };
        let host = url_template
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or(&url_template)
            .to_string();
        let required = Capability::new("execute", "http").with_scope(host);
        kiwi_exec_http::check_preconditions(token, &required).map_err(|e| io_err(ErrorKind::PermissionDenied, e.to_string()))?;

        let headers: BTreeMap<String, String> = merged
            .get("headers")
            .and_then(Value::as_object)
            .map(|h| h.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();
        let body = merged.get("body").and_then(Value::as_str).map(str::to_string);
        let extractors = parameters
            .get("extractors")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| {
                        Some(Extractor {
                            name: v.get("name")?.as_str()?.to_string(),
                            path: v.get("path")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let retry_policy = parameters
            .get("retry_policy")
            .map(|v| RetryPolicy {
                max_attempts: v.get("max_attempts").and_then(Value::as_u64).unwrap_or(1) as u32,
                backoff_ms: v.get("backoff_ms").and_then(Value::as_u64).unwrap_or(100),
                retry_on: v
                    .get("retry_on")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|x| x.as_str())
                            .map(|s| {
                                if s == "network" {
                                    RetryOn::Network
                                } else {
                                    RetryOn::Status(s.parse().unwrap_or(0))
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_else(|| vec![RetryOn::Network]),
            })
            .unwrap_or_default();
        let params: BTreeMap<String, String> = parameters
            .as_object()
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();

        let request = HttpRequest {
            method,
            url_template,
            headers,
            body,
            timeout_ms: merged.get("timeout_ms").and_then(Value::as_u64).unwrap_or(30_000),
            retry_policy,
            extractors,
            params,
        };

        let (fan_out, return_sink) = build_fan_out(parameters.get("sinks"));
        let outcome = kiwi_exec_http::run(&self.http_client, request, &fan_out)
            .await
            .map_err(|e| io_err(ErrorKind::NetworkError, e.to_string()))?;

        Ok(serde_json::json!({
            "status": outcome.status,
            "body": String::from_utf8_lossy(&return_sink.collected()),
            "extractor_outputs": outcome.extractor_outputs,
            "duration_ms": outcome.duration_ms,
            "attempts": outcome.attempts,
        }))
    }

    // -----------------------------------------------------------------
    // help
    // -----------------------------------------------------------------

    /// Static help text by topic (spec §4.11's fourth operation). Unknown
    /// topics fall back to the kernel overview rather than erroring — help
    /// text is advisory, never a hard failure.
    #[must_use]
    pub fn help(&self, topic: &str) -> String {
        match topic {
            "search" => "search(item_type, query, source?, filters, limit) -> results[]. \
                Filename-substring search over project/user/package content roots."
                .to_string(),
            "load" => "load(item_type, item_id, source, destination?) -> item | error. \
                Resolves, parses, and integrity-verifies one artifact."
                .to_string(),
            "execute" => "execute(item_type, action, item_id, parameters, project_path?) -> result. \
                `run` for directive/tool/knowledge; `create`/`update`/`sign` for authoring; \
                publish/delete are not kernel operations."
                .to_string(),
            "directive" => "Directives declare <permissions>, advisory <tools>, a <process> the LLM \
                interprets, and a cost budget. `execute(directive, run, id)` loads and returns the \
                parsed directive; spawning a worker is the `spawn-thread` tool, not a kernel op."
                .to_string(),
            "tool" => "Tools are a chain of manifests terminating in a hard-coded primitive \
                (subprocess or http). `execute(tool, run, id, parameters)` resolves the chain, \
                merges config, checks capabilities, and invokes the primitive."
                .to_string(),
            _ => "Four meta-operations: search, load, execute, help. Everything else — directives, \
                tools, knowledge, executors — is data resolved at call time."
                .to_string(),
        }
    }
}

fn string_field(merged: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    merged.get(key).and_then(Value::as_str).map(str::to_string)
}

fn build_fan_out(sinks: Option<&Value>) -> (FanOut, Arc<ReturnSink>) {
    let return_sink = Arc::new(ReturnSink::new());
    let mut boxed: Vec<Box<dyn Sink>> = vec![Box::new(ReturnSinkHandle(return_sink.clone()))];
    if let Some(Value::Array(descriptors)) = sinks {
        for descriptor in descriptors {
            let Some(kind) = descriptor.get("type").and_then(Value::as_str) else { continue };
            match kind {
                "stdout" => boxed.push(Box::new(StdoutSink)),
                "file" => {
                    if let Some(path) = descriptor.get("path").and_then(Value::as_str) {
                        if let Ok(sink) = FileSink::new(PathBuf::from(path)) {
                            boxed.push(Box::new(sink));
                        }
                    }
                }
                "parse_json" => boxed.push(Box::new(ParseJsonSink::new())),
                "line_split" => boxed.push(Box::new(LineSplitSink::new(|line| tracing::debug!(line, "line_split sink")))),
                "regex_extract" => {
                    if let Some(pattern) = descriptor.get("pattern").and_then(Value::as_str) {
                        if let Ok(sink) = RegexExtractSink::new(pattern, |m| tracing::debug!(m, "regex_extract sink")) {
                            boxed.push(Box::new(sink));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    (FanOut::new(boxed), return_sink)
}

struct ReturnSinkHandle(Arc<ReturnSink>);
impl Sink for ReturnSinkHandle {
    fn name(&self) -> &str {
        "return"
    }
    fn accept(&self, event: &kiwi_sink::SinkEvent) -> Result<(), kiwi_sink::SinkError> {
        self.0.accept(event)
    }
}

/// Bridges the harness's narrow `ToolExecutor` trait back into
/// `Dispatcher::execute`, avoiding a `kiwi-harness -> kiwi-dispatch`
/// dependency edge (the cycle this split exists to prevent): the harness
/// only needs *something* that runs a tool by id, and the dispatcher's own
/// `execute` already does exactly that.
#[async_trait]
impl ToolExecutor for Dispatcher {
    async fn execute(
        &self,
        item_type: ItemType,
        tool_id: &str,
        parameters: Value,
        token: &CapabilityToken,
    ) -> Result<Value, HarnessError> {
        Dispatcher::execute(self, item_type, "run", tool_id, parameters, None, Some(token))
            .await
            .map_err(|e| HarnessError::ToolFailed {
                tool_id: tool_id.to_string(),
                reason: e.to_string(),
            })
    }
}
