//! # The Runtime
//!
//! Startup and the dispatch loop.
//!
//! Startup is strict: handshake with the core, decode the metadata snapshot,
//! build the schema registry, build the handler registry, start the core.
//! Any failure there is a configuration or deployment bug and aborts before
//! a single frame is read.
//!
//! The loop is the opposite: once it is running, nothing a peer sends can
//! take it down. Frames that fail to decode, address no local handler, or
//! carry unreadable bodies are logged and dropped, and the loop moves on to
//! the next frame. The loop ends only when the conduit's stream does.
//!
//! ## Invariants
//!
//! - Dispatch is one logical task. `Conduit::read` is its only outer
//!   suspension point, so frame N's handler and hooks finish before frame
//!   N+1 is looked at.
//! - There is no cancellation or timeout in this layer. A handler that
//!   never completes stalls the whole loop.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use hypharpc::envelope::Envelope;
use hypharpc::envelope::Invoke;
use hypharpc::envelope::Message;
use hypharpc::metadata::InitRequest;
use hypharpc::metadata::MetadataError;
use hypharpc::metadata::MetadataSnapshot;
use hypharpc::model::Record;
use hypharpc::schema::SchemaBuildError;
use hypharpc::schema::SchemaRegistry;

use crate::conduit::Conduit;
use crate::conduit::ConduitError;
use crate::context::Context;
use crate::module::Package;
use crate::registry::HandlerKey;
use crate::registry::HandlerRegistry;
use crate::registry::RegistryError;

// ============================================================================
//  ERRORS
// ============================================================================

/// Startup and shutdown failures. Per-frame failures never surface here.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No package with the empty name was registered.
    #[error("the main package (empty name) must be registered")]
    MissingMainPackage,
    #[error("conduit: {0}")]
    Conduit(#[from] ConduitError),
    #[error("handshake metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("schema registry: {0}")]
    Schema(#[from] SchemaBuildError),
    #[error("handler registry: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ============================================================================
//  RUN OPTIONS
// ============================================================================

/// Handshake options, echoed to the core in the init request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dev: bool,
    pub addr: Option<String>,
    pub config_path: Option<String>,
    /// SDK identification string sent to the core.
    pub sdk: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dev: false,
            addr: None,
            config_path: None,
            sdk: format!("rust-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn sdk(mut self, sdk: impl Into<String>) -> Self {
        self.sdk = sdk.into();
        self
    }
}

// ============================================================================
//  THE RUNTIME
// ============================================================================

pub struct Runtime {
    schemas: Arc<SchemaRegistry>,
    handlers: Arc<HandlerRegistry>,
    conduit: Arc<dyn Conduit>,
}

impl Runtime {
    /// Handshakes with the core and builds the registries.
    ///
    /// Fails fast on a missing main package, a handshake failure, a snapshot
    /// the schema registry rejects, or a registered handler with no request
    /// schema. On success the core has been started and the runtime is ready
    /// to [`run`](Runtime::run).
    pub fn start(
        packages: Vec<Package>,
        options: RunOptions,
        conduit: Arc<dyn Conduit>,
    ) -> Result<Self> {
        if !packages.iter().any(|package| package.name.is_empty()) {
            return Err(RuntimeError::MissingMainPackage);
        }
        let request = InitRequest {
            dev: options.dev,
            addr: options.addr,
            sdk: options.sdk,
            hfn_config_path: options.config_path,
            pkg_names: packages.iter().map(|package| package.name.clone()).collect(),
        };
        let snapshot_bytes = conduit.init(request.to_bytes()?)?;
        let snapshot = MetadataSnapshot::from_bytes(&snapshot_bytes)?;
        info!(
            upstream = %snapshot.upstream_id,
            packages = snapshot.packages.len(),
            "handshake complete"
        );

        let schemas = Arc::new(SchemaRegistry::build(&snapshot)?);
        let handlers = Arc::new(HandlerRegistry::build(packages, &snapshot, &schemas)?);
        info!(
            schemas = schemas.len(),
            handlers = handlers.len(),
            "registries built"
        );

        conduit.run()?;
        Ok(Self {
            schemas,
            handlers,
            conduit,
        })
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Drives the dispatch loop until the conduit's stream ends or the
    /// conduit itself fails.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.conduit.read().await? {
                Some(frame) => self.dispatch(&frame).await,
                None => {
                    debug!("frame stream ended, dispatch loop done");
                    return Ok(());
                }
            }
        }
    }

    /// Processes one frame. Failures are logged and dropped.
    async fn dispatch(&self, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping undecodable envelope");
                return;
            }
        };
        let message = match Message::decode(&envelope.payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping undecodable message");
                return;
            }
        };
        match message {
            Message::Invoke(invoke) => self.invoke(envelope, invoke).await,
            Message::Other(tag) => debug!(tag, "ignoring message kind"),
        }
    }

    async fn invoke(&self, envelope: Envelope, invoke: Invoke) {
        let key = HandlerKey {
            package_id: envelope.package_id,
            module_id: invoke.module_id,
            handler_id: invoke.handler_id,
        };
        let Some(entry) = self.handlers.get(&key) else {
            debug!(%key, "no handler registered, dropping invoke");
            return;
        };

        let mut data = Record::new(
            Arc::clone(entry.request_schema()),
            Arc::clone(&self.schemas),
        );
        if let Some(body) = &invoke.body {
            // A mangled body is the peer's bug, not grounds to skip the
            // handler; whatever decoded before the failure stays set.
            if let Err(error) = data.decode(body) {
                warn!(%key, %error, "request body decode failed, record is partial");
            }
        }

        let ctx = Arc::new(Context {
            package_id: envelope.package_id,
            socket_id: envelope.socket_id,
            headers: envelope.headers,
            cookies: invoke.cookies,
            data,
            module_id: key.module_id,
            handler_id: key.handler_id,
            schemas: Arc::clone(&self.schemas),
            conduit: Arc::clone(&self.conduit),
            hooks: Arc::clone(&entry.hooks),
        });
        entry.hooks.run_before_invoke(&ctx).await;
        (entry.handler)(Arc::clone(&ctx)).await;
        entry.hooks.run_after_invoke(&ctx).await;
    }
}

/// Starts the runtime and drives its dispatch loop to completion.
pub async fn run(
    packages: Vec<Package>,
    options: RunOptions,
    conduit: Arc<dyn Conduit>,
) -> Result<()> {
    Runtime::start(packages, options, conduit)?.run().await
}
