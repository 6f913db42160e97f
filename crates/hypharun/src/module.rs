//! # Packages & Modules
//!
//! The local half of registration. A [`Package`] is a named bundle of
//! modules plus its middleware; a [`Module`] is a named table of async
//! handlers. Which of these actually go live is decided at startup by
//! intersecting them with the peer's metadata snapshot, over in
//! [`crate::registry`].
//!
//! ## Invariants
//!
//! - Module names are matched case-insensitively against the snapshot, so
//!   the package stores them lowercased. Handler names are matched exactly.
//! - Every deployment registers exactly one main package, the one with the
//!   empty name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;
use crate::hooks::Hooks;
use crate::hooks::Middleware;

/// An async request handler. Takes the invocation context, returns nothing;
/// anything it wants the peer to see goes back out through the context.
pub type Handler = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// A named group of handlers, the unit the peer addresses invocations to.
pub trait Module: Send + Sync + 'static {
    /// The module's name. Matched case-insensitively against the peer's
    /// metadata at startup.
    fn name(&self) -> &str;

    /// The handler table: method name to handler. Names are matched exactly.
    fn handlers(&self) -> Vec<(&'static str, Handler)>;
}

// ============================================================================
//  PACKAGES
// ============================================================================

pub(crate) struct PackageModule {
    pub(crate) handlers: HashMap<String, Handler>,
}

/// A deployable bundle of modules with shared middleware.
pub struct Package {
    pub(crate) name: String,
    /// Keyed by lowercased module name.
    pub(crate) modules: HashMap<String, PackageModule>,
    pub(crate) hooks: Hooks,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: HashMap::new(),
            hooks: Hooks::default(),
        }
    }

    /// The main package: the unnamed one every deployment must register.
    pub fn main() -> Self {
        Self::new("")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a module. Later registrations win if two modules share a name.
    pub fn module(mut self, module: impl Module) -> Self {
        let key = module.name().to_lowercase();
        let handlers = module
            .handlers()
            .into_iter()
            .map(|(name, handler)| (name.to_string(), handler))
            .collect();
        self.modules.insert(key, PackageModule { handlers });
        self
    }

    /// Appends a middleware. Hooks run in registration order.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.hooks.push(Arc::new(middleware));
        self
    }
}
