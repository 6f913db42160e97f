//! # Invocation Context
//!
//! Everything a handler gets: who called (socket id, headers, cookies), what
//! they sent (the decoded request record), and the ways back out (state
//! pushes and cookie writes, both enveloped and queued on the conduit).
//!
//! A context is built per invocation and shared as `Arc<Context>` so the
//! handler future and the after-invoke hooks can both hold it.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use hypharpc::codec::CodecError;
use hypharpc::envelope::Envelope;
use hypharpc::envelope::EnvelopeError;
use hypharpc::envelope::SetCookie;
use hypharpc::envelope::StatePush;
use hypharpc::model::Record;
use hypharpc::schema::SchemaRegistry;

use crate::conduit::Conduit;
use crate::conduit::ConduitError;
use crate::hooks::Hooks;

// ============================================================================
//  ERRORS
// ============================================================================

/// Failures while pushing a frame back through the conduit.
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Conduit(#[from] ConduitError),
}

pub type Result<T> = std::result::Result<T, PushError>;

// ============================================================================
//  THE CONTEXT
// ============================================================================

/// One invocation, from the handler's point of view.
pub struct Context {
    /// The package the invoke was addressed to.
    pub package_id: u32,
    /// The connection the invoke arrived on. Pushes go back to it.
    pub socket_id: String,
    /// Transport headers from the inbound envelope.
    pub headers: HashMap<String, String>,
    /// Cookies the peer attached to the invoke.
    pub cookies: HashMap<String, String>,
    /// The request record, decoded against the handler's request schema.
    pub data: Record,
    pub(crate) module_id: u32,
    pub(crate) handler_id: u32,
    pub(crate) schemas: Arc<SchemaRegistry>,
    pub(crate) conduit: Arc<dyn Conduit>,
    pub(crate) hooks: Arc<Hooks>,
}

impl Context {
    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    pub fn handler_id(&self) -> u32 {
        self.handler_id
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// A fresh, empty record for the named schema, ready to fill and push.
    pub fn model(&self, name: &str) -> Option<Record> {
        Record::named(&self.schemas, name)
    }

    /// Pushes a state record to the peer.
    ///
    /// Records whose schema is not a state shape have nowhere to land on the
    /// other side, so pushing one is a logged no-op, not an error.
    pub async fn set_state(&self, state: &Record) -> Result<()> {
        let Some(module_id) = state.schema().module_id else {
            debug!(
                schema_id = state.schema().id,
                "record is not a state shape, ignoring push"
            );
            return Ok(());
        };
        self.hooks.run_on_set_state(self, state).await;
        let record = state.encode()?;
        let payload = StatePush {
            package_id: state.schema().package_id,
            module_id,
            record: &record,
        }
        .encode()?;
        let frame = Envelope::wrap(self.package_id, &payload)?;
        self.conduit.send_message(&self.socket_id, frame)?;
        Ok(())
    }

    /// Alias for [`Context::set_state`].
    pub async fn render(&self, state: &Record) -> Result<()> {
        self.set_state(state).await
    }

    /// Asks the peer to set a cookie on this connection's session.
    /// `max_age_seconds` of zero means session-scoped.
    pub fn set_cookie(
        &self,
        name: &str,
        value: &str,
        max_age_seconds: u32,
        private: bool,
    ) -> Result<()> {
        let payload = SetCookie {
            name,
            value,
            max_age_seconds,
            private,
        }
        .encode()?;
        let frame = Envelope::wrap(self.package_id, &payload)?;
        self.conduit.send_message(&self.socket_id, frame)?;
        Ok(())
    }
}
