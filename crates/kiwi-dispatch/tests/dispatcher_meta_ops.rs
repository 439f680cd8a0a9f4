// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exercises the four meta-operations directly against a `Dispatcher`
//! built over a temp-dir project root, plus the stdio transport's
//! request/response envelope end to end.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiwi_capability::TokenStore;
use kiwi_core::{ErrorKind, ItemType, Source};
use kiwi_dispatch::{stdio::serve_stdio, Dispatcher, EnvSecretResolver};
use kiwi_harness::{LlmClient, LlmError, LlmRequest, LlmResponse};
use kiwi_registry::ThreadRegistry;
use kiwi_resolver::ResolverRoots;
use serde_json::json;
use tempfile::TempDir;

struct NoLlm;

#[async_trait]
impl LlmClient for NoLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        Err(LlmError::Failed("no llm backend in this test".to_string()))
    }
}

fn build_dispatcher(project: &TempDir) -> (Arc<Dispatcher>, TempDir) {
    let state = TempDir::new().unwrap();
    let (config, _warnings) = kiwi_config::load_config(None).unwrap();
    let roots = ResolverRoots {
        project: Some(project.path().join(".ai")),
        user: state.path().join("user"),
        package: state.path().join("package"),
    };
    let registry = Arc::new(ThreadRegistry::new(state.path().join("sessions")));
    let tokens = Arc::new(TokenStore::new());
    let dispatcher = Dispatcher::new(
        roots,
        config,
        state.path().join("lockfile.json"),
        tokens,
        registry,
        Arc::new(NoLlm),
        Arc::new(EnvSecretResolver),
    )
    .expect("dispatcher constructs over a fresh temp root with no lockfile yet");
    (dispatcher, state)
}

#[tokio::test]
async fn create_run_and_search_round_trip_a_tool_manifest() {
    let project = TempDir::new().unwrap();
    let (dispatcher, _state) = build_dispatcher(&project);
    let ai_root = project.path().join(".ai");

    let yaml = "tool_id: echo_tool\nversion: \"1\"\ntool_type: primitive\nkind: subprocess\nconfig:\n  command: echo\n  args: []\n";
    dispatcher
        .execute(
            ItemType::Tool,
            "create",
            "echo_tool",
            json!({"content": yaml}),
            Some(&ai_root),
            None,
        )
        .await
        .expect("create writes the manifest under .ai/tools/");

    let hits = dispatcher.search(ItemType::Tool, "echo", Some(Source::Project), 10);
    assert_eq!(hits.len(), 1);

    let loaded = dispatcher.load(ItemType::Tool, "echo_tool", Some(Source::Project)).await.unwrap();
    let kiwi_dispatch::LoadedPayload::Tool(manifest) = loaded.payload else {
        panic!("load(Tool, ..) always returns LoadedPayload::Tool");
    };
    assert_eq!(manifest.tool_id, "echo_tool");
}

#[tokio::test]
async fn executing_an_unknown_action_is_unknown_operation() {
    let project = TempDir::new().unwrap();
    let (dispatcher, _state) = build_dispatcher(&project);
    let err = dispatcher
        .execute(ItemType::Tool, "teleport", "whatever", json!({}), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownOperation);
}

#[tokio::test]
async fn running_a_tool_without_a_token_is_permission_denied() {
    let project = TempDir::new().unwrap();
    let (dispatcher, _state) = build_dispatcher(&project);
    let ai_root = project.path().join(".ai");
    let yaml = "tool_id: needs_token\nversion: \"1\"\ntool_type: primitive\nkind: subprocess\nconfig:\n  command: echo\n  args: []\n";
    dispatcher
        .execute(ItemType::Tool, "create", "needs_token", json!({"content": yaml}), Some(&ai_root), None)
        .await
        .unwrap();

    let err = dispatcher
        .execute(ItemType::Tool, "run", "needs_token", json!({}), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn stdio_transport_round_trips_a_search_request() {
    let project = TempDir::new().unwrap();
    let (dispatcher, _state) = build_dispatcher(&project);

    let input = format!(
        "{{\"op\": \"search\", \"args\": {{\"item_type\": \"tool\", \"query\": \"x\"}}, \"request_id\": \"req-1\"}}\n"
    )
    .into_bytes();
    let reader = std::io::Cursor::new(input);
    let mut writer = Vec::new();
    serve_stdio(&dispatcher, reader, &mut writer).await.unwrap();

    let output = String::from_utf8(writer).unwrap();
    let response: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();
    assert_eq!(response["request_id"], json!("req-1"));
    assert!(response["result"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn stdio_transport_reports_an_unknown_op_as_an_error_envelope() {
    let project = TempDir::new().unwrap();
    let (dispatcher, _state) = build_dispatcher(&project);

    let input = b"{\"op\": \"teleport\", \"args\": {}, \"request_id\": 2}\n".to_vec();
    let reader = std::io::Cursor::new(input);
    let mut writer = Vec::new();
    serve_stdio(&dispatcher, reader, &mut writer).await.unwrap();

    let output = String::from_utf8(writer).unwrap();
    let response: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();
    assert_eq!(response["request_id"], json!(2));
    assert_eq!(response["error"]["kind"], json!("unknown_operation"));
}
