// SPDX-License-Identifier: MIT OR Apache-2.0
//! Path Resolver (C1): map `(item_id, item_type, location?)` to a concrete
//! on-disk artifact path across project, user, and package content roots.
//!
//! Consolidates what the source system split across three independent
//! resolvers with subtly different glob patterns into one deterministic
//! search: recursive walk per location, first match wins, full candidate
//! list always recorded so ambiguity is never silent.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use kiwi_core::{ItemType, Source};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors the resolver itself cannot recover from. Filesystem errors while
/// walking a single location are not included here — per spec §4.1 they are
/// warnings that skip that location rather than aborting the whole search.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no content root configured for location `{0:?}`")]
    NoRootConfigured(Source),
}

/// The three content roots searched in priority order.
#[derive(Debug, Clone)]
pub struct ResolverRoots {
    /// `<project>/.ai/` — absent when resolving outside a project context.
    pub project: Option<PathBuf>,
    /// `$USER_SPACE` (default `~/.ai/`).
    pub user: PathBuf,
    /// Package-bundled, read-only content root.
    pub package: PathBuf,
}

impl ResolverRoots {
    /// The configured root for a given [`Source`], if any.
    #[must_use]
    pub fn for_source(&self, source: Source) -> Option<&Path> {
        match source {
            Source::Project => self.project.as_deref(),
            Source::User => Some(&self.user),
            Source::Package => Some(&self.package),
        }
    }
}

/// A single candidate artifact found while searching one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub source: Source,
    /// Path relative to the searched root, used for deterministic ordering.
    pub relative_path: String,
}

/// A location that was searched, and whether a non-fatal I/O issue skipped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchedLocation {
    pub source: Source,
    pub root: PathBuf,
    pub skipped_reason: Option<String>,
}

/// Full resolution metadata, always returned regardless of outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveMetadata {
    pub candidates: Vec<Candidate>,
    pub ambiguous: bool,
    pub searched_locations: Vec<SearchedLocation>,
}

/// The outcome of a resolve call. Absence of a match is a normal result, not
/// an error (spec §4.1: "Never silent... Returns a NotFound result").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Found {
        path: PathBuf,
        source: Source,
        metadata: ResolveMetadata,
    },
    NotFound {
        metadata: ResolveMetadata,
    },
}

impl ResolveOutcome {
    #[must_use]
    pub fn metadata(&self) -> &ResolveMetadata {
        match self {
            ResolveOutcome::Found { metadata, .. } | ResolveOutcome::NotFound { metadata } => {
                metadata
            }
        }
    }
}

/// Extensions accepted for a single-file artifact of the given item type.
/// Tools additionally match a directory named `<item_id>/` containing
/// `tool.yaml` (spec §4.1 "Extensions").
fn accepted_extensions(item_type: ItemType) -> &'static [&'static str] {
    match item_type {
        ItemType::Directive | ItemType::Knowledge => &["md"],
        ItemType::Tool => &["yaml", "yml", "py", "sh", "js", "ts"],
    }
}

fn file_stem_matches(path: &Path, item_id: &str, item_type: ItemType) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    stem == item_id && accepted_extensions(item_type).contains(&ext)
}

fn is_tool_directory_match(path: &Path, item_id: &str) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(item_id) && path.join("tool.yaml").is_file()
}

/// Walk a single root for `item_id`/`item_type` candidates, recursively under
/// `<root>/<item_type.dir_name()>/`.
fn search_location(root: &Path, source: Source, item_id: &str, item_type: ItemType) -> Vec<Candidate> {
    let base = root.join(item_type.dir_name());
    if !base.is_dir() {
        return Vec::new();
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(&base).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        let matched = if entry.file_type().is_dir() && item_type == ItemType::Tool {
            is_tool_directory_match(path, item_id)
        } else if entry.file_type().is_file() {
            file_stem_matches(path, item_id, item_type)
        } else {
            false
        };
        if !matched {
            continue;
        }
        let relative_path = path
            .strip_prefix(&base)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        found.push(Candidate {
            path: path.to_path_buf(),
            source,
            relative_path,
        });
    }
    found.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    found
}

/// Resolve `(item_id, item_type)` to an artifact path.
///
/// If `location` is given, only that one root is searched. Otherwise the
/// project → user → package order applies and the first location with at
/// least one match wins (spec §4.1: "first match wins per location").
///
/// # Errors
///
/// Returns [`ResolverError::NoRootConfigured`] only when `location` names a
/// source with no configured root (i.e. `location = Some(Source::Project)`
/// but `roots.project` is `None`).
pub fn resolve(
    roots: &ResolverRoots,
    item_id: &str,
    item_type: ItemType,
    location: Option<Source>,
) -> Result<ResolveOutcome, ResolverError> {
    let order: &[Source] = match location {
        Some(s) => {
            if roots.for_source(s).is_none() {
                return Err(ResolverError::NoRootConfigured(s));
            }
            std::slice::from_ref(order_slot(s))
        }
        None => &Source::SEARCH_ORDER,
    };

    let mut metadata = ResolveMetadata::default();
    for &source in order {
        let Some(root) = roots.for_source(source) else {
            continue;
        };
        metadata.searched_locations.push(SearchedLocation {
            source,
            root: root.to_path_buf(),
            skipped_reason: None,
        });
        let matches = search_location(root, source, item_id, item_type);
        if matches.is_empty() {
            continue;
        }
        let ambiguous = matches.len() > 1;
        let winner = matches[0].clone();
        metadata.candidates.extend(matches);
        metadata.ambiguous = ambiguous;
        return Ok(ResolveOutcome::Found {
            path: winner.path,
            source: winner.source,
            metadata,
        });
    }

    Ok(ResolveOutcome::NotFound { metadata })
}

fn order_slot(source: Source) -> &'static Source {
    Source::SEARCH_ORDER
        .iter()
        .find(|s| **s == source)
        .unwrap_or(&Source::SEARCH_ORDER[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn project_root_wins_over_user_root() {
        let project = tempdir().unwrap();
        let user = tempdir().unwrap();
        let package = tempdir().unwrap();
        write(&project.path().join("directives/hello.md"), "project");
        write(&user.path().join("directives/hello.md"), "user");

        let roots = ResolverRoots {
            project: Some(project.path().to_path_buf()),
            user: user.path().to_path_buf(),
            package: package.path().to_path_buf(),
        };

        let outcome = resolve(&roots, "hello", ItemType::Directive, None).unwrap();
        match outcome {
            ResolveOutcome::Found { source, .. } => assert_eq!(source, Source::Project),
            ResolveOutcome::NotFound { .. } => panic!("expected a match"),
        }
    }

    #[test]
    fn duplicate_stems_in_one_location_are_ambiguous_but_deterministic() {
        let project = tempdir().unwrap();
        write(&project.path().join("directives/a/hello.md"), "a");
        write(&project.path().join("directives/b/hello.md"), "b");

        let roots = ResolverRoots {
            project: Some(project.path().to_path_buf()),
            user: tempdir().unwrap().path().to_path_buf(),
            package: tempdir().unwrap().path().to_path_buf(),
        };

        let first = resolve(&roots, "hello", ItemType::Directive, None).unwrap();
        let second = resolve(&roots, "hello", ItemType::Directive, None).unwrap();
        assert_eq!(first, second, "resolve must be deterministic across calls");

        match first {
            ResolveOutcome::Found { path, metadata, .. } => {
                assert!(metadata.ambiguous);
                assert!(path.ends_with("a/hello.md"), "lexicographically first wins");
            }
            ResolveOutcome::NotFound { .. } => panic!("expected a match"),
        }
    }

    #[test]
    fn missing_item_is_not_found_not_an_error() {
        let roots = ResolverRoots {
            project: None,
            user: tempdir().unwrap().path().to_path_buf(),
            package: tempdir().unwrap().path().to_path_buf(),
        };
        let outcome = resolve(&roots, "nope", ItemType::Knowledge, None).unwrap();
        assert!(matches!(outcome, ResolveOutcome::NotFound { .. }));
    }

    #[test]
    fn tool_directory_with_manifest_matches() {
        let project = tempdir().unwrap();
        write(&project.path().join("tools/mytool/tool.yaml"), "tool_id: mytool");
        let roots = ResolverRoots {
            project: Some(project.path().to_path_buf()),
            user: tempdir().unwrap().path().to_path_buf(),
            package: tempdir().unwrap().path().to_path_buf(),
        };
        let outcome = resolve(&roots, "mytool", ItemType::Tool, None).unwrap();
        assert!(matches!(outcome, ResolveOutcome::Found { .. }));
    }

    #[test]
    fn narrowing_to_an_unconfigured_location_errors() {
        let roots = ResolverRoots {
            project: None,
            user: tempdir().unwrap().path().to_path_buf(),
            package: tempdir().unwrap().path().to_path_buf(),
        };
        let err = resolve(&roots, "x", ItemType::Tool, Some(Source::Project)).unwrap_err();
        assert!(matches!(err, ResolverError::NoRootConfigured(Source::Project)));
    }
}
