//! SPDX-License-Identifier: MIT OR Apache-2.0
//! Scope-glob behavior as used by capability token validation: a path or
//! shell command is allowed only if it matches an include pattern and no
//! exclude pattern.

use kiwi_glob::{IncludeExcludeGlobs, MatchDecision};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn project_sandbox_allows_nested_outputs() {
    let globs =
        IncludeExcludeGlobs::new(&strings(&["project/.ai/outputs/**"]), &strings(&[])).unwrap();
    assert_eq!(
        globs.decide_str("project/.ai/outputs/report.md"),
        MatchDecision::Allowed
    );
}

#[test]
fn exclude_wins_over_include() {
    let globs = IncludeExcludeGlobs::new(
        &strings(&["project/.ai/**"]),
        &strings(&["project/.ai/secrets/**"]),
    )
    .unwrap();
    assert_eq!(
        globs.decide_str("project/.ai/secrets/key.pem"),
        MatchDecision::DeniedByExclude
    );
}

#[test]
fn missing_include_denies_outside_sandbox() {
    let globs = IncludeExcludeGlobs::new(&strings(&["project/.ai/**"]), &strings(&[])).unwrap();
    assert_eq!(
        globs.decide_str("/etc/passwd"),
        MatchDecision::DeniedByMissingInclude
    );
}

#[test]
fn shell_allow_list_matches_exact_command_names() {
    let globs = IncludeExcludeGlobs::new(&strings(&["python3", "npm"]), &strings(&[])).unwrap();
    assert!(globs.decide_str("python3").is_allowed());
    assert!(!globs.decide_str("rm").is_allowed());
}
