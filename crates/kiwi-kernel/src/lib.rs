// SPDX-License-Identifier: MIT OR Apache-2.0
//! `Kernel`: the single struct that wires every `kiwi-*` subsystem together
//! (spec §9: "Global state... encapsulate as a single Kernel handle"). No
//! module-level statics — every operation takes `&Kernel` explicitly so
//! multiple instances can coexist, e.g. for test isolation.
//!
//! Grounded on `abp-runtime::Runtime`: one struct owning every collaborator,
//! constructed explicitly (`Runtime::new`/`with_default_backends`) rather
//! than reached for via a global, with thin delegating methods over its
//! owned subsystems.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiwi_capability::TokenStore;
use kiwi_config::{ConfigError, ConfigWarning, KernelConfig};
use kiwi_core::{CapabilityToken, ItemType, KernelError, Source};
use kiwi_dispatch::{Dispatcher, DispatcherInitError, EnvSecretResolver, SecretResolver};
use kiwi_harness::LlmClient;
use kiwi_registry::ThreadRegistry;
use kiwi_resolver::ResolverRoots;
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Failures constructing a [`Kernel`].
#[derive(Debug, Error)]
pub enum KernelInitError {
    #[error("failed to load kernel config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to construct dispatcher: {0}")]
    Dispatcher(#[from] DispatcherInitError),
    #[error("failed to prepare state directory {0:?}: {1}")]
    StateDir(PathBuf, #[source] std::io::Error),
}

/// The process-wide handle every entry point (CLI, stdio transport, tests)
/// constructs explicitly and passes around by reference.
pub struct Kernel {
    pub config: KernelConfig,
    pub config_warnings: Vec<ConfigWarning>,
    dispatcher: Arc<Dispatcher>,
}

impl Kernel {
    /// Build a `Kernel` from an optional config file path and an optional
    /// project root (absent when invoked outside a project directory, per
    /// spec §4.1's "project root is... absent when resolving outside a
    /// project context").
    ///
    /// # Errors
    ///
    /// Returns [`KernelInitError`] if the config cannot be loaded/validated,
    /// the state directory cannot be created, or the dispatcher's lockfile
    /// is malformed.
    pub fn new(config_path: Option<&Path>, project_root: Option<PathBuf>) -> Result<Self, KernelInitError> {
        Self::with_llm(config_path, project_root, Arc::new(NoLlm))
    }

    /// As [`Kernel::new`], but with an explicit [`LlmClient`] — the LLM
    /// backend is an external collaborator the distilled spec names but
    /// does not implement (spec §4.9).
    pub fn with_llm(
        config_path: Option<&Path>,
        project_root: Option<PathBuf>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, KernelInitError> {
        let (config, config_warnings) = kiwi_config::load_config(config_path)?;

        std::fs::create_dir_all(&config.state_home)
            .map_err(|e| KernelInitError::StateDir(config.state_home.clone(), e))?;

        let roots = ResolverRoots {
            project: project_root.map(|p| p.join(".ai")),
            user: config.user_space.clone(),
            package: package_content_root(),
        };

        let sessions_dir = config.state_home.join("sessions");
        std::fs::create_dir_all(&sessions_dir).map_err(|e| KernelInitError::StateDir(sessions_dir.clone(), e))?;
        let registry = Arc::new(ThreadRegistry::new(sessions_dir));

        let tokens = Arc::new(TokenStore::new());
        let lockfile_path = config.state_home.join("lockfile.json");
        let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver);

        let dispatcher = Dispatcher::new(roots, config.clone(), lockfile_path, tokens, registry, llm, secrets)?;

        Ok(Self { config, config_warnings, dispatcher })
    }

    /// Install a `tracing` subscriber filtered by `config.log_level`,
    /// overridable via `RUST_LOG` (the teacher's own `EnvFilter` idiom).
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.config.log_level.clone()));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// spec §4.11 `search(item_type, query, source?, filters, limit)`.
    #[must_use]
    pub fn search(&self, item_type: ItemType, query: &str, source: Option<Source>, limit: usize) -> Vec<kiwi_dispatch::SearchResult> {
        self.dispatcher.search(item_type, query, source, limit)
    }

    /// spec §4.11 `load(item_type, item_id, source, destination?)`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::load`].
    pub async fn load(&self, item_type: ItemType, item_id: &str, source: Option<Source>) -> Result<kiwi_dispatch::LoadedItem, KernelError> {
        self.dispatcher.load(item_type, item_id, source).await
    }

    /// spec §4.11 `execute(item_type, action, item_id, parameters, project_path?)`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::execute`].
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        item_type: ItemType,
        action: &str,
        item_id: &str,
        parameters: Value,
        project_path: Option<&Path>,
        token: Option<&CapabilityToken>,
    ) -> Result<Value, KernelError> {
        self.dispatcher.execute(item_type, action, item_id, parameters, project_path, token).await
    }

    /// spec §4.11 `help(topic)`.
    #[must_use]
    pub fn help(&self, topic: &str) -> String {
        self.dispatcher.help(topic)
    }

    /// Direct access to the thread registry, for callers (the stdio
    /// transport, the CLI's `status`/`cancel` commands) that need to list
    /// or cancel threads without going through `execute`.
    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.dispatcher.registry
    }

    /// Run the spec §6 stdio request/response loop over the given reader
    /// and writer until the reader reaches EOF.
    ///
    /// # Errors
    ///
    /// Returns [`kiwi_dispatch::stdio::StdioError`] on a transport-level
    /// I/O failure; individual operation failures are carried inside a
    /// well-formed `{request_id, error}` response, not as an `Err` here.
    pub async fn serve_stdio<R, W>(&self, reader: R, writer: W) -> Result<(), kiwi_dispatch::stdio::StdioError>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        kiwi_dispatch::stdio::serve_stdio(&self.dispatcher, reader, writer).await
    }
}

/// Package-bundled, read-only content root: the directory this binary's
/// own crate ships under `content/`, resolved relative to the running
/// executable rather than hard-coded, so an installed binary finds its
/// bundled tools wherever it was installed.
fn package_content_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .map(|dir| dir.join("content"))
        .unwrap_or_else(|| PathBuf::from("content"))
}

/// Placeholder [`LlmClient`] used when no backend is supplied: every
/// directive run fails fast with a clear message rather than silently
/// hanging, so a kernel constructed without `with_llm` is still safe to
/// build (e.g. for `search`/`load`/`help`-only callers) without ever being
/// able to drive a directive worker.
struct NoLlm;

#[async_trait::async_trait]
impl LlmClient for NoLlm {
    async fn complete(&self, _request: kiwi_harness::LlmRequest) -> Result<kiwi_harness::LlmResponse, kiwi_harness::LlmError> {
        Err(kiwi_harness::LlmError::Failed(
            "no LlmClient configured for this kernel; construct it with Kernel::with_llm".to_string(),
        ))
    }
}
