//! # Middleware Hooks
//!
//! Cross-cutting observers that a package carries around its handlers. A
//! middleware sees every invocation on the package (before and after the
//! handler runs) and every state push that leaves through a context.
//!
//! Hooks are observational. They cannot veto an invocation or rewrite a
//! record; they run to completion in registration order and the pipeline
//! moves on.

use std::sync::Arc;

use async_trait::async_trait;

use hypharpc::model::Record;

use crate::context::Context;

/// Package-level lifecycle observer. Implement the methods you care about;
/// the defaults do nothing.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Runs before the handler, after the request record is decoded.
    async fn before_invoke(&self, ctx: &Context) {
        let _ = ctx;
    }

    /// Runs after the handler future completes.
    async fn after_invoke(&self, ctx: &Context) {
        let _ = ctx;
    }

    /// Runs when a context pushes state, before the record is encoded.
    async fn on_set_state(&self, ctx: &Context, state: &Record) {
        let _ = (ctx, state);
    }
}

/// An ordered middleware list, shared by every handler of one package.
#[derive(Clone, Default)]
pub struct Hooks {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Hooks {
    pub(crate) fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub(crate) async fn run_before_invoke(&self, ctx: &Context) {
        for middleware in &self.middlewares {
            middleware.before_invoke(ctx).await;
        }
    }

    pub(crate) async fn run_after_invoke(&self, ctx: &Context) {
        for middleware in &self.middlewares {
            middleware.after_invoke(ctx).await;
        }
    }

    pub(crate) async fn run_on_set_state(&self, ctx: &Context, state: &Record) {
        for middleware in &self.middlewares {
            middleware.on_set_state(ctx, state).await;
        }
    }
}
