// SPDX-License-Identifier: MIT OR Apache-2.0
//! kiwi-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Stable data model, canonical hashing, and error taxonomy shared by every
//! other `kiwi-*` crate. If you only take one dependency, take this one.

/// The error taxonomy: `ErrorKind` and `KernelError`.
pub mod error;
/// Canonical hashing: `sha256_hex`, `canonical_json`, single/multi-file hashing.
pub mod hash;
/// The data model: items, manifests, directives, knowledge, tokens, threads.
pub mod model;

pub use error::{ErrorKind, KernelError};
pub use hash::{canonical_json, multi_file_hash, sha256_hex, single_file_hash};
pub use model::{
    Capability, CapabilityToken, CostBudget, Directive, EntryType, IntegrityRecord, Item,
    ItemType, KnowledgeEntry, LockfileEntry, PermissionDeclaration, PrimitiveKind, Relationship,
    RelationshipKind, Source, ThreadRecord, ThreadStatus, ThreadUsage, ToolManifest, ToolParameter,
    ToolType,
};
