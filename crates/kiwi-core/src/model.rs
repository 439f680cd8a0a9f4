// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model: items, manifests, directives, knowledge, integrity
//! records, lockfile entries, capability tokens, and thread records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where an item's artifact was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Project,
    User,
    Package,
}

impl Source {
    /// Search priority order, highest first.
    pub const SEARCH_ORDER: [Source; 3] = [Source::Project, Source::User, Source::Package];
}

/// The three content kinds the kernel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Directive,
    Tool,
    Knowledge,
}

impl ItemType {
    /// Directory name under a `.ai`-style root (e.g. `tools`, `directives`).
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            ItemType::Directive => "directives",
            ItemType::Tool => "tools",
            ItemType::Knowledge => "knowledge",
        }
    }
}

/// Closed set of hard-coded primitive executor kinds.
///
/// Per the design notes, primitives are a finite, non-user-extensible set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Subprocess,
    Http,
}

/// Tagged union over a tool's declared type, replacing the source's
/// string-keyed `tool_type` dispatch with an exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "tool_type", rename_all = "snake_case")]
pub enum ToolType {
    Primitive { kind: PrimitiveKind },
    Runtime,
    Script,
    Api,
    McpServer,
    McpTool,
}

impl ToolType {
    /// `true` iff this is a hard-coded primitive leaf.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self, ToolType::Primitive { .. })
    }
}

/// A single declared tool parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A tool manifest as parsed from YAML, with unknown top-level keys
/// preserved in `extra` for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolManifest {
    pub tool_id: String,
    #[serde(flatten)]
    pub tool_type: ToolType,
    pub version: String,
    /// `tool_id` of the next link in the chain, or `None` iff primitive.
    pub executor: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Unknown fields, preserved but ignored.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ToolManifest {
    /// Invariant: `tool_type=primitive ⇔ executor=null`.
    #[must_use]
    pub fn executor_invariant_holds(&self) -> bool {
        self.tool_type.is_primitive() == self.executor.is_none()
    }

    /// Validate `tool_id` matches `^[a-z][a-z0-9_]*$`.
    #[must_use]
    pub fn has_valid_id(&self) -> bool {
        let mut chars = self.tool_id.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

/// A single permission entry in a directive's `<permissions>` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PermissionDeclaration {
    pub capability: String,
    pub scope: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Cost/budget ceilings declared by a directive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CostBudget {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_usd: Option<f64>,
}

fn default_max_turns() -> u32 {
    20
}

impl Default for CostBudget {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: None,
            max_usd: None,
        }
    }
}

/// A parsed directive (workflow specification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Directive {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<PermissionDeclaration>,
    /// Advisory tool_ids for context prefetch.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Opaque process steps, consumed by the LLM, never interpreted by the kernel.
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub cost: CostBudget,
    pub model: String,
}

/// A typed edge between knowledge entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Extends,
    References,
    Contradicts,
    Supersedes,
}

/// A typed relationship between two knowledge entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Relationship {
    pub from: String,
    pub to: String,
    pub kind: RelationshipKind,
}

/// Knowledge entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Concept,
    Pattern,
    Learning,
    Reference,
    Procedure,
}

/// A knowledge entry: YAML frontmatter plus markdown body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KnowledgeEntry {
    pub zettel_id: String,
    pub title: String,
    pub entry_type: EntryType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub body: String,
}

/// An abstract item: one of the three content kinds, with resolution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Item {
    pub id: String,
    pub version: String,
    pub source: Source,
    pub item_type: ItemType,
}

/// Integrity record for a single artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IntegrityRecord {
    pub artifact_path: String,
    pub canonical_hash: String,
    pub signed_at: DateTime<Utc>,
    #[serde(default)]
    pub signer_id: Option<String>,
}

/// One `(tool_id, version) -> hash` pin in the lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LockfileEntry {
    pub tool_id: String,
    pub version: String,
    pub canonical_hash: String,
    pub pinned_at: DateTime<Utc>,
}

/// A single capability carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Capability {
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Capability {
    #[must_use]
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            scope: None,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// A minted capability token. Opaque bearer string to consumers;
/// structurally typed internally.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityToken {
    pub token_id: Uuid,
    pub thread_id: String,
    pub directive_id: String,
    pub capabilities: Vec<Capability>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl CapabilityToken {
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Thread lifecycle status. Terminal variants are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Spawning,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    BudgetExceeded,
}

impl ThreadStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ThreadStatus::Completed
                | ThreadStatus::Failed
                | ThreadStatus::Cancelled
                | ThreadStatus::Timeout
                | ThreadStatus::BudgetExceeded
        )
    }

    /// Whether `self -> next` is an allowed status transition.
    #[must_use]
    pub fn can_transition_to(self, next: ThreadStatus) -> bool {
        use ThreadStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Spawning, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
                | (Running, BudgetExceeded)
                | (Paused, Cancelled)
                | (Spawning, Cancelled)
                | (Spawning, Failed)
        )
    }
}

/// Running usage counters for a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ThreadUsage {
    pub turns: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd_spent: f64,
}

/// A spawned worker's persisted record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub directive_id: String,
    pub status: ThreadStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: ThreadUsage,
    #[serde(default)]
    pub final_result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Parent thread id, if this thread was spawned by a nested spawn-thread call.
    #[serde(default)]
    pub parent_thread_id: Option<String>,
}

impl ThreadRecord {
    #[must_use]
    pub fn spawning(thread_id: impl Into<String>, directive_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            thread_id: thread_id.into(),
            directive_id: directive_id.into(),
            status: ThreadStatus::Spawning,
            started_at: now,
            ended_at: None,
            usage: ThreadUsage::default(),
            final_result: None,
            error: None,
            parent_thread_id: None,
        }
    }
}
