// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP Primitive (C7): issue a templated HTTP request, retry per policy,
//! and stream the response body through the sink fan-out.
//!
//! The exponential-backoff-with-jitter retry loop is grounded on the
//! teacher's `abp-host::retry` module (`RetryConfig`/`compute_delay`), kept
//! near-verbatim in shape and re-targeted here from sidecar reconnects to
//! HTTP idempotent-request retries.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use kiwi_capability::{token_grants, CapabilityError};
use kiwi_core::{Capability, CapabilityToken};
use kiwi_sink::{EventSource, FanOut, SinkEvent};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio_stream::StreamExt;

/// HTTP method, restricted to the spec's closed set (spec §4.7 inputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// GET, PUT, and DELETE retry automatically; POST and PATCH only retry
    /// when the request never reached the server (spec §4.7 retries rule).
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Put | HttpMethod::Delete)
    }

    fn to_reqwest(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

/// A condition under which a failed attempt should be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOn {
    Status(u16),
    Network,
}

/// Retry policy attached to one request (spec §4.7 `retry_policy`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub retry_on: Vec<RetryOn>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 100,
            retry_on: vec![RetryOn::Network],
        }
    }
}

/// Picks a value out of the response body by a dot-separated path (e.g.
/// `data.items.0.id`), translated internally to a JSON Pointer.
#[derive(Debug, Clone)]
pub struct Extractor {
    pub name: String,
    pub path: String,
}

fn dot_path_to_pointer(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    format!("/{}", path.replace('.', "/"))
}

/// Everything needed to issue one HTTP call (spec §4.7 inputs).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url_template: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub extractors: Vec<Extractor>,
    /// Invocation parameters substituted for `${param}` references.
    pub params: BTreeMap<String, String>,
}

/// Failures from spec §4.7, plus the capability precondition check.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("capability denied: {0}")]
    Denied(#[from] CapabilityError),
    #[error("template references unknown placeholder `${{{0}}}`")]
    UnresolvedPlaceholder(String),
    #[error("network error after {attempts} attempt(s): {reason}")]
    Network { reason: String, attempts: u32 },
    #[error("total timeout exceeded after {attempts} attempt(s)")]
    TimeoutTotal { attempts: u32 },
    #[error("extractor `{name}` failed: {reason}")]
    ExtractorFailed { name: String, reason: String },
}

/// Terminal result of an HTTP call (spec §4.7 result shape). An HTTP error
/// status is not itself an [`HttpError`] — it is surfaced here for the
/// caller to judge fatality.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub extractor_outputs: BTreeMap<String, serde_json::Value>,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Substitute `${param}` from `params` and `${env_name}` from the process
/// environment (params take precedence — spec §4.12 merge order places the
/// caller's explicit argument last).
///
/// # Errors
///
/// Returns [`HttpError::UnresolvedPlaceholder`] if a `${...}` reference
/// resolves to neither a param nor an environment variable.
pub fn substitute(template: &str, params: &BTreeMap<String, String>) -> Result<String, HttpError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            let Some(end) = template[i + 2..].find('}') else {
                out.push_str(&template[i..]);
                break;
            };
            let name = &template[i + 2..i + 2 + end];
            if let Some(value) = params.get(name) {
                out.push_str(value);
            } else if let Ok(value) = std::env::var(name) {
                out.push_str(&value);
            } else {
                return Err(HttpError::UnresolvedPlaceholder(name.to_string()));
            }
            i += 2 + end + 1;
        } else {
            let ch = template[i..].chars().next().expect("i within bounds");
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    Ok(out)
}

/// Check the caller's token against the primitive's precondition (spec
/// §4.7): `{execute, http, scope∋host}` or a tool-granted capability.
///
/// # Errors
///
/// Returns [`HttpError::Denied`] if the token does not grant `required`.
pub fn check_preconditions(token: &CapabilityToken, required: &Capability) -> Result<(), HttpError> {
    if token_grants(token, required, Utc::now()) {
        Ok(())
    } else {
        Err(HttpError::Denied(CapabilityError::Denied {
            action: required.action.clone(),
            resource: required.resource.clone(),
            reason: "token does not grant this HTTP call".to_string(),
        }))
    }
}

fn compute_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let nominal = base_ms.saturating_mul(exp);
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let jitter_range = nominal / 2;
    let jitter = if jitter_range > 0 {
        (nanos.wrapping_mul(attempt as u64 + 1)) % jitter_range
    } else {
        0
    };
    Duration::from_millis(nominal.saturating_sub(jitter))
}

fn should_retry(policy: &RetryPolicy, method: HttpMethod, status: Option<StatusCode>, was_network_error: bool) -> bool {
    if was_network_error {
        return policy.retry_on.contains(&RetryOn::Network);
    }
    if !method.is_idempotent() {
        return false;
    }
    match status {
        Some(code) => policy.retry_on.contains(&RetryOn::Status(code.as_u16())),
        None => false,
    }
}

/// Execute the request, retrying per `request.retry_policy`, streaming the
/// response body to `fan_out` as it arrives, and applying `extractors` to
/// the fully-accumulated body.
///
/// # Errors
///
/// Returns [`HttpError::UnresolvedPlaceholder`] if template substitution
/// fails, [`HttpError::Network`]/[`HttpError::TimeoutTotal`] if every retry
/// attempt is exhausted without reaching the server, or
/// [`HttpError::ExtractorFailed`] if an extractor cannot pick its path.
/// A non-2xx HTTP status is not an error — see [`HttpOutcome::status`].
pub async fn run(client: &reqwest::Client, request: HttpRequest, fan_out: &FanOut) -> Result<HttpOutcome, HttpError> {
    let url = substitute(&request.url_template, &request.params)?;
    let mut headers = BTreeMap::new();
    for (k, v) in &request.headers {
        headers.insert(k.clone(), substitute(v, &request.params)?);
    }
    let body = request
        .body
        .as_ref()
        .map(|b| substitute(b, &request.params))
        .transpose()?;

    let started_at = Instant::now();
    let overall_timeout = Duration::from_millis(request.timeout_ms);
    let mut attempts = 0u32;
    let mut last_network_error: Option<String> = None;

    loop {
        if started_at.elapsed() >= overall_timeout {
            return Err(HttpError::TimeoutTotal { attempts });
        }
        attempts += 1;

        let mut builder = client.request(request.method.to_reqwest(), &url);
        for (k, v) in &headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }
        let remaining = overall_timeout.saturating_sub(started_at.elapsed());
        builder = builder.timeout(remaining);

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let response_headers: BTreeMap<String, String> = response
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect();

                if !status.is_success() && should_retry(&request.retry_policy, request.method, Some(status), false)
                    && attempts < request.retry_policy.max_attempts
                {
                    tokio::time::sleep(compute_delay(request.retry_policy.backoff_ms, attempts)).await;
                    continue;
                }

                let mut body_bytes = Vec::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| HttpError::Network {
                        reason: e.to_string(),
                        attempts,
                    })?;
                    body_bytes.extend_from_slice(&chunk);
                    fan_out
                        .dispatch(&SinkEvent::new(EventSource::Http, chunk.to_vec(), Utc::now()))
                        .map_err(|e| HttpError::Network {
                            reason: e.to_string(),
                            attempts,
                        })?;
                }

                let extractor_outputs = apply_extractors(&request.extractors, &body_bytes)?;

                return Ok(HttpOutcome {
                    status: status.as_u16(),
                    headers: response_headers,
                    body: body_bytes,
                    extractor_outputs,
                    duration_ms: started_at.elapsed().as_millis() as u64,
                    attempts,
                });
            }
            Err(err) => {
                last_network_error = Some(err.to_string());
                let retryable = should_retry(&request.retry_policy, request.method, None, true);
                if retryable && attempts < request.retry_policy.max_attempts {
                    tracing::warn!(url = %url, attempt = attempts, error = %err, "HTTP request failed, retrying");
                    tokio::time::sleep(compute_delay(request.retry_policy.backoff_ms, attempts)).await;
                    continue;
                }
                return Err(HttpError::Network {
                    reason: last_network_error.unwrap_or_default(),
                    attempts,
                });
            }
        }
    }
}

fn apply_extractors(
    extractors: &[Extractor],
    body: &[u8],
) -> Result<BTreeMap<String, serde_json::Value>, HttpError> {
    if extractors.is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| HttpError::ExtractorFailed {
        name: extractors[0].name.clone(),
        reason: format!("response body is not JSON: {e}"),
    })?;
    let mut outputs = BTreeMap::new();
    for extractor in extractors {
        let pointer = dot_path_to_pointer(&extractor.path);
        let picked = value.pointer(&pointer).ok_or_else(|| HttpError::ExtractorFailed {
            name: extractor.name.clone(),
            reason: format!("path `{}` not found in response", extractor.path),
        })?;
        outputs.insert(extractor.name.clone(), picked.clone());
    }
    Ok(outputs)
}
