// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directive Executor / Harness (C9): the background worker that drives an
//! LLM through a directive's turn loop, translating its tool calls into
//! kernel `execute` operations under budget and cooperative cancellation.
//!
//! Grounded on `abp-runtime::Runtime::execute`/`RunHandle` for the
//! spawned-task + event-stream + `JoinHandle<Receipt>` shape, and
//! `abp-runtime::budget::BudgetTracker` for the atomic-counter,
//! 0.8-warning-threshold budget model (generalized from `BudgetLimit`'s
//! `max_cost_usd`/`max_tokens`/`max_turns`/`max_duration` to the directive's
//! own `CostBudget` plus an externally supplied wall-clock `ttl`).
//!
//! The LLM call is named in the distilled spec as an external collaborator,
//! so this crate depends only on a narrow [`LlmClient`] trait with no
//! bundled implementation. Tool-call routing back into the kernel's
//! `execute` operation is likewise a trait ([`ToolExecutor`]) rather than a
//! dependency on `kiwi-dispatch`, which avoids a dependency cycle (the
//! dispatcher spawns harness workers for the `spawn-thread` tool; the
//! harness must not depend back on the dispatcher).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use kiwi_core::{Capability, CapabilityToken, CostBudget, Directive, ItemType, ThreadRecord, ThreadStatus, ThreadUsage};
use kiwi_registry::ThreadRegistry;
use serde_json::Value;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;

const WARNING_THRESHOLD: f64 = 0.8;
const MAX_SPAWN_DEPTH: u32 = 5;
/// Grace added on top of the directive's declared wall-clock budget when
/// minting its token's TTL (spec §4.5: "+10% grace").
const TOKEN_TTL_GRACE: f64 = 0.10;
/// Token TTL used when the directive declares no wall-clock budget.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Budget tracking
// ---------------------------------------------------------------------------

/// Atomic-counter budget tracker over a directive's declared [`CostBudget`]
/// plus an externally supplied wall-clock ttl.
pub struct BudgetTracker {
    limit: CostBudget,
    ttl: Option<Duration>,
    tokens_used: AtomicU64,
    cost_micro: AtomicU64,
    turns_used: AtomicU32,
    started_at: Instant,
}

/// Which budget dimension was exceeded, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetViolation {
    Turns { used: u32, limit: u32 },
    Tokens { used: u64, limit: u64 },
    Cost { used_usd: f64, limit_usd: f64 },
    Ttl { elapsed: Duration, limit: Duration },
}

/// Result of one budget check (spec §4.9 step 5a).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetStatus {
    WithinLimits,
    Warning { usage_pct: f64 },
    Exceeded(BudgetViolation),
}

impl BudgetTracker {
    #[must_use]
    pub fn new(limit: CostBudget, ttl: Option<Duration>) -> Self {
        Self {
            limit,
            ttl,
            tokens_used: AtomicU64::new(0),
            cost_micro: AtomicU64::new(0),
            turns_used: AtomicU32::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_turn(&self) {
        self.turns_used.fetch_add(1, Relaxed);
    }

    pub fn record_tokens(&self, input: u64, output: u64) {
        self.tokens_used.fetch_add(input + output, Relaxed);
    }

    pub fn record_cost_usd(&self, amount: f64) {
        let micros = (amount * 1_000_000.0).max(0.0) as u64;
        self.cost_micro.fetch_add(micros, Relaxed);
    }

    #[must_use]
    pub fn usage(&self) -> ThreadUsage {
        ThreadUsage {
            turns: self.turns_used.load(Relaxed),
            input_tokens: self.tokens_used.load(Relaxed),
            output_tokens: 0,
            usd_spent: self.cost_micro.load(Relaxed) as f64 / 1_000_000.0,
        }
    }

    #[must_use]
    pub fn check(&self) -> BudgetStatus {
        let turns = self.turns_used.load(Relaxed);
        let tokens = self.tokens_used.load(Relaxed);
        let cost_usd = self.cost_micro.load(Relaxed) as f64 / 1_000_000.0;
        let elapsed = self.started_at.elapsed();

        if turns > self.limit.max_turns {
            return BudgetStatus::Exceeded(BudgetViolation::Turns {
                used: turns,
                limit: self.limit.max_turns,
            });
        }
        if let Some(max) = self.limit.max_tokens
            && tokens >= max
        {
            return BudgetStatus::Exceeded(BudgetViolation::Tokens { used: tokens, limit: max });
        }
        if let Some(max) = self.limit.max_usd
            && cost_usd >= max
        {
            return BudgetStatus::Exceeded(BudgetViolation::Cost {
                used_usd: cost_usd,
                limit_usd: max,
            });
        }
        if let Some(ttl) = self.ttl
            && elapsed > ttl
        {
            return BudgetStatus::Exceeded(BudgetViolation::Ttl { elapsed, limit: ttl });
        }

        let mut max_pct = turns as f64 / self.limit.max_turns.max(1) as f64;
        if let Some(max) = self.limit.max_tokens {
            max_pct = max_pct.max(tokens as f64 / max as f64);
        }
        if let Some(max) = self.limit.max_usd
            && max > 0.0
        {
            max_pct = max_pct.max(cost_usd / max);
        }
        if let Some(ttl) = self.ttl {
            max_pct = max_pct.max(elapsed.as_secs_f64() / ttl.as_secs_f64());
        }

        if max_pct >= WARNING_THRESHOLD {
            BudgetStatus::Warning { usage_pct: max_pct * 100.0 }
        } else {
            BudgetStatus::WithinLimits
        }
    }
}

// ---------------------------------------------------------------------------
// LLM collaborator trait (no bundled implementation)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
}

/// One tool call the LLM asked the harness to route through the kernel.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub item_type: ItemType,
    pub tool_id: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<ConversationMessage>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call failed: {0}")]
    Failed(String),
}

/// The LLM call, named as an external collaborator in the spec's
/// non-goals — this crate depends only on the trait, never a concrete
/// backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Routes one tool call through the kernel's `execute` operation,
/// supplying the worker's token as `_auth`. Implemented by the dispatcher
/// crate; kept as a trait here to avoid a dependency cycle.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        item_type: ItemType,
        tool_id: &str,
        parameters: Value,
        token: &CapabilityToken,
    ) -> Result<Value, HarnessError>;
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Failures terminating a worker run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("registry error: {0}")]
    Registry(#[from] kiwi_registry::RegistryError),
    #[error("capability error: {0}")]
    Capability(#[from] kiwi_capability::CapabilityError),
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("tool execution failed for `{tool_id}`: {reason}")]
    ToolFailed { tool_id: String, reason: String },
    #[error("budget exceeded: {0:?}")]
    BudgetExceeded(BudgetViolation),
    #[error("cancelled")]
    Cancelled,
    #[error("nested spawn-thread depth limit ({MAX_SPAWN_DEPTH}) exceeded")]
    DepthLimitExceeded,
}

/// Progress events emitted to the worker's caller while it runs.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    TurnStarted { turn: u32 },
    AssistantMessage { content: String },
    ToolCallStarted { tool_id: String },
    ToolCallFinished { tool_id: String, ok: bool },
    Terminal { status: ThreadStatus },
}

/// Everything needed to spawn one directive worker.
pub struct WorkerConfig {
    pub thread_id: String,
    pub directive: Directive,
    pub inputs: Value,
    pub parent_thread_id: Option<String>,
    /// Capability subset the parent explicitly granted; `None` for a
    /// top-level (non-nested) worker.
    pub granted_capabilities: Option<Vec<Capability>>,
    pub depth: u32,
    pub ttl: Option<Duration>,
    pub is_core: bool,
    pub sandbox: kiwi_capability::SandboxPolicy,
}

/// Handle to a spawned worker, mirroring the teacher's `RunHandle` shape:
/// a run id, a live event stream, and a join handle resolving to the
/// terminal thread record.
pub struct WorkerHandle {
    pub thread_id: String,
    pub events: ReceiverStream<WorkerEvent>,
    pub result: tokio::task::JoinHandle<Result<ThreadRecord, HarnessError>>,
}

/// Spawn the directive worker described by `config` (spec §4.9 worker
/// body). The token is minted *inside* the spawned task, after the
/// directive's permissions are known — never by the caller.
pub fn spawn_worker(
    config: WorkerConfig,
    registry: Arc<ThreadRegistry>,
    tokens: Arc<kiwi_capability::TokenStore>,
    llm: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
) -> Result<WorkerHandle, HarnessError> {
    if config.depth > MAX_SPAWN_DEPTH {
        return Err(HarnessError::DepthLimitExceeded);
    }

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let thread_id = config.thread_id.clone();

    let result = tokio::spawn(async move {
        run_worker(config, registry, tokens, llm, tool_executor, tx).await
    });

    Ok(WorkerHandle {
        thread_id,
        events: ReceiverStream::new(rx),
        result,
    })
}

async fn run_worker(
    config: WorkerConfig,
    registry: Arc<ThreadRegistry>,
    tokens: Arc<kiwi_capability::TokenStore>,
    llm: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
    events: tokio::sync::mpsc::Sender<WorkerEvent>,
) -> Result<ThreadRecord, HarnessError> {
    let now = Utc::now();
    let directive_id = format!("{}@{}", config.directive.name, config.directive.version);

    // Step 2: mint the capability token from the directive's declared
    // permissions, narrowed to the parent's grant for nested spawns.
    let permissions = narrow_permissions(&config.directive.permissions, config.granted_capabilities.as_deref());
    let token_ttl = config
        .ttl
        .map(|wall_clock_budget| wall_clock_budget.mul_f64(1.0 + TOKEN_TTL_GRACE))
        .unwrap_or(DEFAULT_TOKEN_TTL);
    let token = kiwi_capability::mint(
        &config.thread_id,
        &directive_id,
        &permissions,
        token_ttl,
        config.is_core,
        &config.sandbox,
        now,
    )?;
    tokens.insert(token.clone());

    // Step 3: publish the running thread record.
    let mut record = ThreadRecord::spawning(config.thread_id.clone(), directive_id.clone(), now);
    record.parent_thread_id = config.parent_thread_id.clone();
    registry.register(record)?;
    registry.update_status(&config.thread_id, ThreadStatus::Running, None, Utc::now())?;

    let outcome = turn_loop(&config, &registry, &token, &llm, &tool_executor, &events).await;

    // Step 6: terminal handling — revoke the token regardless of outcome.
    tokens.revoke(&config.thread_id);

    let (final_status, usage, final_result, error) = match &outcome {
        Ok((status, usage, result)) => (*status, *usage, result.clone(), None),
        Err(err) => (terminal_status_for_error(err), ThreadUsage::default(), None, Some(err.to_string())),
    };

    registry.update_status(&config.thread_id, final_status, Some(usage), Utc::now())?;
    let _ = events.send(WorkerEvent::Terminal { status: final_status }).await;

    let mut record = registry.get(&config.thread_id)?;
    record.final_result = final_result;
    record.error = error;
    Ok(record)
}

fn terminal_status_for_error(err: &HarnessError) -> ThreadStatus {
    match err {
        HarnessError::BudgetExceeded(_) => ThreadStatus::BudgetExceeded,
        HarnessError::Cancelled => ThreadStatus::Cancelled,
        _ => ThreadStatus::Failed,
    }
}

fn narrow_permissions(
    declared: &[kiwi_core::PermissionDeclaration],
    granted_subset: Option<&[Capability]>,
) -> Vec<kiwi_core::PermissionDeclaration> {
    let Some(subset) = granted_subset else {
        return declared.to_vec();
    };
    declared
        .iter()
        .filter(|p| {
            subset.iter().any(|c| {
                c.action == p.capability
                    && c.resource == p.scope
                    && path_within_scope(c.scope.as_deref(), p.path.as_deref())
            })
        })
        .cloned()
        .collect()
}

/// A child's declared `path` must fall within the parent-granted capability's
/// `scope` glob — a child can only narrow a parent's grant, never widen it
/// (spec §4.9 capability-monotonicity invariant).
fn path_within_scope(granted_scope: Option<&str>, declared_path: Option<&str>) -> bool {
    let Some(declared_path) = declared_path else {
        return true;
    };
    let Some(granted_scope) = granted_scope else {
        return true;
    };
    kiwi_glob::IncludeExcludeGlobs::new(&[granted_scope.to_string()], &[])
        .map(|g| g.decide_str(declared_path).is_allowed())
        .unwrap_or(false)
}

async fn turn_loop(
    config: &WorkerConfig,
    registry: &Arc<ThreadRegistry>,
    token: &CapabilityToken,
    llm: &Arc<dyn LlmClient>,
    tool_executor: &Arc<dyn ToolExecutor>,
    events: &tokio::sync::mpsc::Sender<WorkerEvent>,
) -> Result<(ThreadStatus, ThreadUsage, Option<Value>), HarnessError> {
    let budget = BudgetTracker::new(config.directive.cost, config.ttl);
    let mut messages = vec![
        ConversationMessage {
            role: Role::System,
            content: build_system_prompt(&config.directive),
            tool_call_id: None,
        },
        ConversationMessage {
            role: Role::User,
            content: config.inputs.to_string(),
            tool_call_id: None,
        },
    ];

    loop {
        if let Some(flag) = registry.cancel_flag(&config.thread_id)
            && flag.load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(HarnessError::Cancelled);
        }

        budget.record_turn();
        if let BudgetStatus::Exceeded(violation) = budget.check() {
            return Err(HarnessError::BudgetExceeded(violation));
        }

        let turn = budget.usage().turns;
        let _ = events.send(WorkerEvent::TurnStarted { turn }).await;

        let response = llm.complete(LlmRequest { messages: messages.clone() }).await?;
        budget.record_tokens(response.input_tokens, response.output_tokens);
        budget.record_cost_usd(response.cost_usd);

        if response.tool_calls.is_empty() {
            let content = response.content.clone().unwrap_or_default();
            let _ = events.send(WorkerEvent::AssistantMessage { content: content.clone() }).await;
            return Ok((ThreadStatus::Completed, budget.usage(), Some(Value::String(content))));
        }

        messages.push(ConversationMessage {
            role: Role::Assistant,
            content: response.content.clone().unwrap_or_default(),
            tool_call_id: None,
        });

        for call in response.tool_calls {
            if let Some(flag) = registry.cancel_flag(&config.thread_id)
                && flag.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(HarnessError::Cancelled);
            }
            let _ = events.send(WorkerEvent::ToolCallStarted { tool_id: call.tool_id.clone() }).await;
            let outcome = tool_executor
                .execute(call.item_type, &call.tool_id, call.parameters, token)
                .await;
            let ok = outcome.is_ok();
            let _ = events
                .send(WorkerEvent::ToolCallFinished { tool_id: call.tool_id.clone(), ok })
                .await;
            let content = match outcome {
                Ok(value) => value.to_string(),
                Err(err) => {
                    tracing::warn!(tool_id = %call.tool_id, error = %err, "tool call failed");
                    serde_json::json!({"error": err.to_string()}).to_string()
                }
            };
            messages.push(ConversationMessage {
                role: Role::Tool,
                content,
                tool_call_id: Some(call.id),
            });
        }
    }
}

fn build_system_prompt(directive: &Directive) -> String {
    format!(
        "{}\n\n{}\n\navailable tools (advisory prefetch): {}",
        directive.description,
        directive.process,
        directive.tools.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::PermissionDeclaration;

    struct EchoLlm;
    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                content: Some("done".to_string()),
                tool_calls: vec![],
                input_tokens: 10,
                output_tokens: 5,
                cost_usd: 0.001,
            })
        }
    }

    struct NoopExecutor;
    #[async_trait]
    impl ToolExecutor for NoopExecutor {
        async fn execute(
            &self,
            _item_type: ItemType,
            _tool_id: &str,
            _parameters: Value,
            _token: &CapabilityToken,
        ) -> Result<Value, HarnessError> {
            Ok(Value::Null)
        }
    }

    fn directive() -> Directive {
        Directive {
            name: "greet".to_string(),
            version: "1.0.0".to_string(),
            description: "say hello".to_string(),
            permissions: vec![PermissionDeclaration {
                capability: "write".to_string(),
                scope: "fs".to_string(),
                path: Some("project/out.txt".to_string()),
            }],
            tools: vec![],
            process: "say hello".to_string(),
            cost: CostBudget::default(),
            model: "tier-1".to_string(),
        }
    }

    fn config(thread_id: &str) -> WorkerConfig {
        WorkerConfig {
            thread_id: thread_id.to_string(),
            directive: directive(),
            inputs: serde_json::json!({}),
            parent_thread_id: None,
            granted_capabilities: None,
            depth: 0,
            ttl: None,
            is_core: true,
            sandbox: kiwi_capability::SandboxPolicy::new("project/**", &[]).unwrap(),
        }
    }

    #[tokio::test]
    async fn worker_completes_with_no_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ThreadRegistry::new(dir.path().join("sessions")));
        let tokens = Arc::new(kiwi_capability::TokenStore::new());
        let handle = spawn_worker(
            config("t1"),
            registry.clone(),
            tokens.clone(),
            Arc::new(EchoLlm),
            Arc::new(NoopExecutor),
        )
        .unwrap();
        let record = handle.result.await.unwrap().unwrap();
        assert_eq!(record.status, ThreadStatus::Completed);
        assert!(tokens.get("t1").is_none(), "token must be revoked on completion");
    }

    #[test]
    fn depth_limit_rejects_deep_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ThreadRegistry::new(dir.path().join("sessions")));
        let tokens = Arc::new(kiwi_capability::TokenStore::new());
        let mut cfg = config("t1");
        cfg.depth = 6;
        let err = spawn_worker(cfg, registry, tokens, Arc::new(EchoLlm), Arc::new(NoopExecutor)).unwrap_err();
        assert!(matches!(err, HarnessError::DepthLimitExceeded));
    }

    #[test]
    fn budget_tracker_flags_turns_exceeded() {
        let budget = BudgetTracker::new(
            CostBudget {
                max_turns: 1,
                max_tokens: None,
                max_usd: None,
            },
            None,
        );
        budget.record_turn();
        budget.record_turn();
        assert!(matches!(
            budget.check(),
            BudgetStatus::Exceeded(BudgetViolation::Turns { .. })
        ));
    }

    #[test]
    fn narrow_permissions_drops_ungranted_entries() {
        let declared = vec![
            PermissionDeclaration {
                capability: "write".to_string(),
                scope: "fs".to_string(),
                path: Some("project/a".to_string()),
            },
            PermissionDeclaration {
                capability: "execute".to_string(),
                scope: "shell".to_string(),
                path: Some("npm".to_string()),
            },
        ];
        let subset = vec![Capability::new("write", "fs")];
        let narrowed = narrow_permissions(&declared, Some(&subset));
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].capability, "write");
    }

    #[test]
    fn narrow_permissions_rejects_a_path_broader_than_the_granted_scope() {
        let declared = vec![PermissionDeclaration {
            capability: "write".to_string(),
            scope: "fs".to_string(),
            path: Some("/etc/passwd".to_string()),
        }];
        let subset = vec![Capability::new("write", "fs").with_scope("project/**")];
        let narrowed = narrow_permissions(&declared, Some(&subset));
        assert!(narrowed.is_empty(), "child cannot widen the parent's granted scope");
    }

    #[test]
    fn narrow_permissions_keeps_a_path_within_the_granted_scope() {
        let declared = vec![PermissionDeclaration {
            capability: "write".to_string(),
            scope: "fs".to_string(),
            path: Some("project/sub/out.txt".to_string()),
        }];
        let subset = vec![Capability::new("write", "fs").with_scope("project/**")];
        let narrowed = narrow_permissions(&declared, Some(&subset));
        assert_eq!(narrowed.len(), 1);
    }
}
