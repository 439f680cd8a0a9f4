// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subprocess Primitive (C6): spawn a child process with a resolved
//! command/args/env, enforce a timeout and cwd jail, and stream stdout and
//! stderr to the ordered sink fan-out.
//!
//! Grounded on the teacher's `sidecar-kit::SidecarProcess` spawn/stdio
//! shape and `abp-host::ProcessConfig`/`ProcessStatus` lifecycle tracking,
//! generalized from a JSONL sidecar handshake to a plain command whose exit
//! status and streamed output are what callers observe.

#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use kiwi_capability::{token_grants, CapabilityError};
use kiwi_core::{Capability, CapabilityToken};
use kiwi_glob::IncludeExcludeGlobs;
use kiwi_sink::{EventSource, FanOut, SinkEvent};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

const DEFAULT_GRACE_MS: u64 = 5000;

/// Everything needed to spawn and bound one child process (spec §4.6 inputs).
#[derive(Debug, Clone)]
pub struct SubprocessRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Explicit env, merged over the filtered inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub stdin_bytes: Option<Vec<u8>>,
    pub timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL. Defaults to 5000ms.
    pub grace_ms: u64,
}

impl SubprocessRequest {
    #[must_use]
    pub fn new(command: impl Into<String>, cwd: PathBuf, timeout_ms: u64) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd,
            stdin_bytes: None,
            timeout_ms,
            grace_ms: DEFAULT_GRACE_MS,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Failure modes from spec §4.6, plus the capability precondition check.
#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("capability denied: {0}")]
    Denied(#[from] CapabilityError),
    #[error("cwd `{0}` is outside the token's filesystem scope")]
    CwdOutOfScope(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("process timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

/// The process's terminal outcome, always returned once the child has
/// exited or been killed (spec §4.6: accumulated into a returned record).
#[derive(Debug, Clone)]
pub struct SubprocessOutcome {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub killed: bool,
    pub signal_terminated: Option<i32>,
}

/// Filter the inherited process environment through an allow-list, then
/// layer the request's explicit `env` on top (later overrides earlier, per
/// spec §4.12 environment resolution order).
fn build_env(
    request_env: &BTreeMap<String, String>,
    allowlist: &IncludeExcludeGlobs,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars()
        .filter(|(k, _)| allowlist.decide_str(k).is_allowed())
        .collect();
    env.extend(request_env.clone());
    env
}

/// Check the caller's token against the primitive's preconditions (spec
/// §4.6): `{execute, shell, scope∋command}` (or a tool-granted capability
/// supplied by the caller), and the cwd must lie within the token's fs
/// write scope.
///
/// # Errors
///
/// Returns [`SubprocessError::Denied`] or [`SubprocessError::CwdOutOfScope`].
pub fn check_preconditions(
    token: &CapabilityToken,
    required: &Capability,
    cwd: &Path,
) -> Result<(), SubprocessError> {
    let now = Utc::now();
    if !token_grants(token, required, now) {
        return Err(SubprocessError::Denied(CapabilityError::Denied {
            action: required.action.clone(),
            resource: required.resource.clone(),
            reason: "token does not grant this subprocess invocation".to_string(),
        }));
    }
    let cwd_str = cwd.to_string_lossy();
    let fs_scope = Capability::new("write", "fs").with_scope(cwd_str.as_ref());
    if !token_grants(token, &fs_scope, now) {
        return Err(SubprocessError::CwdOutOfScope(cwd_str.into_owned()));
    }
    Ok(())
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: i32) {
    unsafe {
        libc::kill(pid, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: i32, _signal: i32) {}

/// Spawn the child, stream its stdout/stderr to `fan_out`, and enforce
/// `timeout_ms`/`grace_ms`. Preconditions must already have been checked
/// with [`check_preconditions`].
///
/// # Errors
///
/// Returns [`SubprocessError::SpawnFailed`] if the child cannot be spawned,
/// or [`SubprocessError::Timeout`] if it is still alive after the grace
/// period following SIGKILL.
pub async fn run(
    request: SubprocessRequest,
    env_allowlist: &IncludeExcludeGlobs,
    fan_out: &FanOut,
) -> Result<SubprocessOutcome, SubprocessError> {
    let env = build_env(&request.env, env_allowlist);
    let mut cmd = Command::new(&request.command);
    cmd.args(&request.args)
        .current_dir(&request.cwd)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started_at = std::time::Instant::now();
    let mut child = cmd.spawn().map_err(SubprocessError::SpawnFailed)?;
    let pid = child.id().map(|p| p as i32);

    if let Some(bytes) = request.stdin_bytes {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&bytes).await;
            let _ = stdin.shutdown().await;
        }
    } else {
        drop(child.stdin.take());
    }

    let mut stdout = child.stdout.take().expect("stdout piped at spawn");
    let mut stderr = child.stderr.take().expect("stderr piped at spawn");

    let stdout_buf = tokio::sync::Mutex::new(Vec::new());
    let stderr_buf = tokio::sync::Mutex::new(Vec::new());

    let drain = async {
        let mut out_chunk = [0u8; 4096];
        let mut err_chunk = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;
        while out_open || err_open {
            tokio::select! {
                n = stdout.read(&mut out_chunk), if out_open => {
                    match n {
                        Ok(0) | Err(_) => out_open = false,
                        Ok(n) => {
                            let chunk = out_chunk[..n].to_vec();
                            stdout_buf.lock().await.extend_from_slice(&chunk);
                            let _ = fan_out.dispatch(&SinkEvent::new(EventSource::Stdout, chunk, Utc::now()));
                        }
                    }
                }
                n = stderr.read(&mut err_chunk), if err_open => {
                    match n {
                        Ok(0) | Err(_) => err_open = false,
                        Ok(n) => {
                            let chunk = err_chunk[..n].to_vec();
                            stderr_buf.lock().await.extend_from_slice(&chunk);
                            let _ = fan_out.dispatch(&SinkEvent::new(EventSource::Stderr, chunk, Utc::now()));
                        }
                    }
                }
            }
        }
    };

    let timeout = Duration::from_millis(request.timeout_ms);
    let wait_result = tokio::time::timeout(timeout, async {
        drain.await;
        child.wait().await
    })
    .await;

    match wait_result {
        Ok(Ok(status)) => Ok(SubprocessOutcome {
            exit_code: status.code(),
            stdout: stdout_buf.into_inner(),
            stderr: stderr_buf.into_inner(),
            duration_ms: started_at.elapsed().as_millis() as u64,
            killed: false,
            signal_terminated: unix_signal(&status),
        }),
        Ok(Err(source)) => Err(SubprocessError::SpawnFailed(source)),
        Err(_elapsed) => {
            tracing::warn!(command = %request.command, timeout_ms = request.timeout_ms, "subprocess timed out, sending SIGTERM");
            if let Some(pid) = pid {
                send_signal(pid, libc_sigterm());
            }
            let grace = Duration::from_millis(request.grace_ms);
            let still_running = tokio::time::timeout(grace, child.wait()).await;
            let killed_by_kill = still_running.is_err();
            if killed_by_kill {
                tracing::warn!(command = %request.command, "subprocess ignored SIGTERM, sending SIGKILL");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            Err(SubprocessError::Timeout {
                after_ms: request.timeout_ms,
            })
        }
    }
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}

#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    15
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Cooperatively terminate an in-flight child on cancellation: same
/// SIGTERM-then-SIGKILL sequence as a timeout (spec §4.6 cancellation).
pub async fn cancel(child: &mut tokio::process::Child, grace_ms: u64) {
    if let Some(pid) = child.id().map(|p| p as i32) {
        send_signal(pid, libc_sigterm());
    }
    let grace = Duration::from_millis(grace_ms);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::PermissionDeclaration;
    use kiwi_sink::ReturnSink;

    fn allow_all() -> IncludeExcludeGlobs {
        IncludeExcludeGlobs::new(&["*".to_string()], &[]).unwrap()
    }

    fn token_with(perm: PermissionDeclaration) -> CapabilityToken {
        let sandbox = kiwi_capability::SandboxPolicy::new("**", &["*".to_string()]).unwrap();
        kiwi_capability::mint(
            "t1",
            "core/test",
            &[perm],
            Duration::from_secs(60),
            true,
            &sandbox,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn preconditions_reject_missing_capability() {
        let token = token_with(PermissionDeclaration {
            capability: "execute".to_string(),
            scope: "shell".to_string(),
            path: Some("npm".to_string()),
        });
        let required = Capability::new("execute", "shell").with_scope("rm");
        let err = check_preconditions(&token, &required, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, SubprocessError::Denied(_)));
    }

    #[tokio::test]
    async fn echo_command_streams_to_return_sink_and_exits_zero() {
        let fan_out = FanOut::new(vec![]);
        let request = SubprocessRequest {
            command: "echo".to_string(),
            args: vec!["hello".to_string()],
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
            stdin_bytes: None,
            timeout_ms: 5000,
            grace_ms: 1000,
        };
        let outcome = run(request, &allow_all(), &fan_out).await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "hello");
        assert!(!outcome.killed);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let fan_out = FanOut::new(vec![]);
        let request = SubprocessRequest {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
            stdin_bytes: None,
            timeout_ms: 50,
            grace_ms: 50,
        };
        let err = run(request, &allow_all(), &fan_out).await.unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn output_reaches_return_sink() {
        let return_sink = std::sync::Arc::new(ReturnSink::new());
        struct Wrap(std::sync::Arc<ReturnSink>);
        impl kiwi_sink::Sink for Wrap {
            fn name(&self) -> &str {
                "return"
            }
            fn accept(&self, e: &SinkEvent) -> Result<(), kiwi_sink::SinkError> {
                self.0.accept(e)
            }
        }
        let fan_out = FanOut::new(vec![Box::new(Wrap(return_sink.clone()))]);
        let request = SubprocessRequest::new("echo", std::env::temp_dir(), 5000)
            .with_args(vec!["hi".to_string()]);
        run(request, &allow_all(), &fan_out).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&return_sink.collected()).trim(), "hi");
    }
}
