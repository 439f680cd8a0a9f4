// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread Registry (C10): track spawned directive workers by thread id,
//! enforce the status-transition state machine, and persist terminal
//! records to `.ai/sessions/<thread_id>.json`.
//!
//! The registry is itself an ordinary tool, capability-gated like any
//! other (spec §4.10) — this crate does not check `registry.read`/
//! `registry.write` itself; the dispatcher validates the caller's token
//! via `kiwi-capability` before reaching these operations, the same way
//! every other tool call is gated.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiwi_core::{ThreadRecord, ThreadStatus, ThreadUsage};
use thiserror::Error;
use tokio::sync::broadcast;

/// Failures from the registry's own invariants. Capability denial is the
/// dispatcher's concern, not this crate's.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("thread `{0}` is already registered")]
    Collision(String),
    #[error("thread `{0}` not found")]
    NotFound(String),
    #[error("illegal status transition for thread `{thread_id}`: {from:?} -> {to:?}")]
    InvalidTransition {
        thread_id: String,
        from: ThreadStatus,
        to: ThreadStatus,
    },
    #[error("I/O error persisting thread `{thread_id}`: {source}")]
    Io {
        thread_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed persisted record for thread `{thread_id}`: {source}")]
    Serialize {
        thread_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("timed out waiting for thread `{0}` to reach a terminal status")]
    AwaitTimeout(String),
}

/// Filter applied by [`ThreadRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<ThreadStatus>,
    pub parent_thread_id: Option<String>,
}

impl ListFilter {
    fn matches(&self, record: &ThreadRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self
                .parent_thread_id
                .as_ref()
                .is_none_or(|p| record.parent_thread_id.as_deref() == Some(p.as_str()))
    }
}

struct ActiveEntry {
    record: ThreadRecord,
    cancel_flag: Arc<AtomicBool>,
}

/// In-memory active records plus file-per-id terminal persistence under
/// `<project>/.ai/sessions/`.
pub struct ThreadRegistry {
    active: RwLock<HashMap<String, ActiveEntry>>,
    sessions_dir: PathBuf,
    terminal_tx: broadcast::Sender<ThreadRecord>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(sessions_dir: PathBuf) -> Self {
        let (terminal_tx, _rx) = broadcast::channel(256);
        Self {
            active: RwLock::new(HashMap::new()),
            sessions_dir,
            terminal_tx,
        }
    }

    fn session_path(&self, thread_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{thread_id}.json"))
    }

    /// Register a new thread in the `Spawning` state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Collision`] if `record.thread_id` is already
    /// active or has a persisted terminal record. Per spec §4.10 the
    /// *caller* (the harness) is responsible for retrying with a
    /// microsecond-precision suffix, up to 3 times, on collision.
    pub fn register(&self, record: ThreadRecord) -> Result<(), RegistryError> {
        let mut active = self.active.write().expect("registry lock poisoned");
        if active.contains_key(&record.thread_id) {
            return Err(RegistryError::Collision(record.thread_id));
        }
        if self.session_path(&record.thread_id).is_file() {
            return Err(RegistryError::Collision(record.thread_id));
        }
        let thread_id = record.thread_id.clone();
        active.insert(
            thread_id,
            ActiveEntry {
                record,
                cancel_flag: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    /// Transition a thread's status, validating the move against
    /// [`ThreadStatus::can_transition_to`]. Terminal transitions flush the
    /// record to disk and remove it from the in-memory active set.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the thread is not active,
    /// [`RegistryError::InvalidTransition`] if the move is illegal, or an
    /// I/O/serialize error flushing a terminal record.
    pub fn update_status(
        &self,
        thread_id: &str,
        new_status: ThreadStatus,
        usage: Option<ThreadUsage>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut active = self.active.write().expect("registry lock poisoned");
        let entry = active
            .get_mut(thread_id)
            .ok_or_else(|| RegistryError::NotFound(thread_id.to_string()))?;

        if !entry.record.status.can_transition_to(new_status) {
            return Err(RegistryError::InvalidTransition {
                thread_id: thread_id.to_string(),
                from: entry.record.status,
                to: new_status,
            });
        }
        entry.record.status = new_status;
        if let Some(usage) = usage {
            entry.record.usage = usage;
        }

        if new_status.is_terminal() {
            entry.record.ended_at = Some(now);
            let record = entry.record.clone();
            self.flush_terminal(&record)?;
            let _ = self.terminal_tx.send(record);
            active.remove(thread_id);
        }
        Ok(())
    }

    fn flush_terminal(&self, record: &ThreadRecord) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.sessions_dir).map_err(|source| RegistryError::Io {
            thread_id: record.thread_id.clone(),
            source,
        })?;
        let json = serde_json::to_string_pretty(record).map_err(|source| RegistryError::Serialize {
            thread_id: record.thread_id.clone(),
            source,
        })?;
        std::fs::write(self.session_path(&record.thread_id), json).map_err(|source| RegistryError::Io {
            thread_id: record.thread_id.clone(),
            source,
        })
    }

    /// Fetch a record, checking the active set first and falling back to a
    /// persisted terminal record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no active or persisted record
    /// exists, or a deserialize error if a persisted record is malformed.
    pub fn get(&self, thread_id: &str) -> Result<ThreadRecord, RegistryError> {
        if let Some(entry) = self.active.read().expect("registry lock poisoned").get(thread_id) {
            return Ok(entry.record.clone());
        }
        self.load_persisted(thread_id)
    }

    fn load_persisted(&self, thread_id: &str) -> Result<ThreadRecord, RegistryError> {
        let path = self.session_path(thread_id);
        let text = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RegistryError::NotFound(thread_id.to_string())
            } else {
                RegistryError::Io {
                    thread_id: thread_id.to_string(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&text).map_err(|source| RegistryError::Serialize {
            thread_id: thread_id.to_string(),
            source,
        })
    }

    /// List active records matching `filter`. Terminal (persisted) records
    /// are not scanned — callers needing archived history use [`Self::get`]
    /// with a known thread id.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<ThreadRecord> {
        self.active
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|e| &e.record)
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Request cooperative cancellation: sets the thread's cancel flag
    /// (observed by the harness at every suspension point) and transitions
    /// it to `Cancelled` if that move is currently legal.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::InvalidTransition`]
    /// exactly as [`Self::update_status`] would.
    pub fn cancel(&self, thread_id: &str, now: DateTime<Utc>) -> Result<(), RegistryError> {
        {
            let active = self.active.read().expect("registry lock poisoned");
            let entry = active
                .get(thread_id)
                .ok_or_else(|| RegistryError::NotFound(thread_id.to_string()))?;
            entry.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.update_status(thread_id, ThreadStatus::Cancelled, None, now)
    }

    /// A shared flag the harness reads at every suspension point to detect
    /// a pending cancellation (spec §4.9 cancellation).
    #[must_use]
    pub fn cancel_flag(&self, thread_id: &str) -> Option<Arc<AtomicBool>> {
        self.active
            .read()
            .expect("registry lock poisoned")
            .get(thread_id)
            .map(|e| e.cancel_flag.clone())
    }

    /// Block until `thread_id` reaches a terminal status, or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the thread is unknown (never
    /// registered and no persisted record), or [`RegistryError::AwaitTimeout`]
    /// if `timeout` elapses first.
    pub async fn await_terminal(
        &self,
        thread_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ThreadRecord, RegistryError> {
        if let Ok(record) = self.load_persisted(thread_id) {
            return Ok(record);
        }
        if self.active.read().expect("registry lock poisoned").get(thread_id).is_none() {
            return Err(RegistryError::NotFound(thread_id.to_string()));
        }

        let mut rx = self.terminal_tx.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(record) if record.thread_id == thread_id => return Some(record),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        };
        let result = match timeout {
            Some(d) => tokio::time::timeout(d, wait).await.ok().flatten(),
            None => wait.await,
        };
        result.ok_or_else(|| RegistryError::AwaitTimeout(thread_id.to_string()))
    }

    /// Delete persisted terminal records older than `retention`, relative
    /// to `now`. An explicit operation per spec §4.10 — never run
    /// automatically.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sessions directory cannot be scanned.
    pub fn cleanup(&self, retention: Duration, now: DateTime<Utc>) -> std::io::Result<usize> {
        if !self.sessions_dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if is_stale(&path, retention, now) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn is_stale(path: &Path, retention: Duration, now: DateTime<Utc>) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(record) = serde_json::from_str::<ThreadRecord>(&text) else {
        return false;
    };
    let Some(ended_at) = record.ended_at else {
        return false;
    };
    let age = now.signed_duration_since(ended_at);
    age.to_std().map(|age| age > retention).unwrap_or(false)
}
