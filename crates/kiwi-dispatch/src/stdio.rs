// SPDX-License-Identifier: MIT OR Apache-2.0
//! Newline-delimited JSON request/response transport over stdio (spec §6:
//! "stdio framed messages... or an equivalent local IPC").
//!
//! Grounded on the teacher's `abp-sidecar-proto::SidecarServer` /
//! `abp-protocol::JsonlCodec` shape — read one line, decode, dispatch,
//! encode, write, flush — re-targeted from the sidecar's fixed
//! hello/run/event/final handshake to the kernel's four open-ended
//! meta-operations. Every request carries an opaque `request_id` the
//! caller picks (a number, string, whatever their own correlation scheme
//! needs) and every response echoes it back unchanged.

use std::path::PathBuf;

use kiwi_core::{ItemType, Source};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::Dispatcher;

/// One request line: `{"op": "...", "args": {...}, "request_id": ...}`.
#[derive(Debug, Deserialize)]
struct Request {
    op: String,
    #[serde(default)]
    args: Value,
    request_id: Value,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    item_type: ItemType,
    query: String,
    #[serde(default)]
    source: Option<Source>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct LoadArgs {
    item_type: ItemType,
    item_id: String,
    #[serde(default)]
    source: Option<Source>,
}

#[derive(Debug, Deserialize)]
struct ExecuteArgs {
    item_type: ItemType,
    action: String,
    item_id: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    project_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct HelpArgs {
    #[serde(default)]
    topic: String,
}

/// Failures reading or writing the transport itself — never a kernel
/// operation failure, which is instead carried inside a well-formed
/// response's `error` field.
#[derive(Debug, Error)]
pub enum StdioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve the stdio protocol loop: read one JSON line per iteration,
/// dispatch it against `dispatcher`, write one JSON line back, until the
/// reader reaches EOF.
///
/// Malformed request lines (bad JSON, unknown `op`, wrong `args` shape)
/// produce an `invalid_argument` error response rather than aborting the
/// loop — one bad line should not take down a long-lived server.
pub async fn serve_stdio<R, W>(dispatcher: &Dispatcher, reader: R, mut writer: W) -> Result<(), StdioError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(dispatcher, request).await,
            Err(e) => serde_json::json!({
                "request_id": Value::Null,
                "error": {
                    "kind": "invalid_argument",
                    "message": format!("malformed request line: {e}"),
                },
            }),
        };
        let mut encoded = serde_json::to_string(&response).expect("response is always serializable");
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_request(dispatcher: &Dispatcher, request: Request) -> Value {
    let request_id = request.request_id;
    let outcome = dispatch_op(dispatcher, &request.op, request.args).await;
    match outcome {
        Ok(result) => serde_json::json!({ "request_id": request_id, "result": result }),
        Err(envelope) => {
            let mut response = serde_json::json!({ "request_id": request_id });
            response["error"] = envelope["error"].clone();
            response
        }
    }
}

async fn dispatch_op(dispatcher: &Dispatcher, op: &str, args: Value) -> Result<Value, Value> {
    match op {
        "search" => {
            let args: SearchArgs = parse_args(args)?;
            let results = dispatcher.search(args.item_type, &args.query, args.source, args.limit);
            Ok(serde_json::to_value(
                results
                    .into_iter()
                    .map(|r| serde_json::json!({"id": r.id, "item_type": r.item_type, "source": r.source, "path": r.path}))
                    .collect::<Vec<_>>(),
            )
            .expect("search results always serialize"))
        }
        "load" => {
            let args: LoadArgs = parse_args(args)?;
            let item = dispatcher
                .load(args.item_type, &args.item_id, args.source)
                .await
                .map_err(|e| e.to_envelope())?;
            Ok(serde_json::json!({
                "source": item.source,
                "path": item.path,
                "verified": item.verification.verified,
                "payload": payload_json(item.payload),
            }))
        }
        "execute" => {
            let args: ExecuteArgs = parse_args(args)?;
            dispatcher
                .execute(args.item_type, &args.action, &args.item_id, args.parameters, args.project_path.as_deref(), None)
                .await
                .map_err(|e| e.to_envelope())
        }
        "help" => {
            let args: HelpArgs = parse_args(args)?;
            Ok(Value::String(dispatcher.help(&args.topic)))
        }
        other => Err(kiwi_core::KernelError::new(
            kiwi_core::ErrorKind::UnknownOperation,
            format!("unknown op {other:?}; expected one of search, load, execute, help"),
        )
        .to_envelope()),
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, Value> {
    serde_json::from_value(args).map_err(|e| {
        kiwi_core::KernelError::new(kiwi_core::ErrorKind::InvalidArgument, format!("bad args: {e}")).to_envelope()
    })
}

fn payload_json(payload: crate::LoadedPayload) -> Value {
    match payload {
        crate::LoadedPayload::Tool(manifest) => serde_json::to_value(manifest).expect("tool manifest always serializes"),
        crate::LoadedPayload::Directive(directive) => serde_json::to_value(directive).expect("directive always serializes"),
        crate::LoadedPayload::Knowledge(value) => value,
    }
}
