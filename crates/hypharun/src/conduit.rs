//! # Core Conduit
//!
//! The boundary between this runtime and the native core. The core owns the
//! sockets, the sessions, and the routing tables; the runtime only ever sees
//! it through this trait: one handshake call, one start call, a stream of
//! inbound frames, and a queue for outbound frames.
//!
//! ## Philosophy
//!
//! The trait is object-safe on purpose. Everything above it holds an
//! `Arc<dyn Conduit>`, so a production core and an in-process mock are
//! interchangeable and the dispatch machinery can be tested without a socket
//! in sight.

use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
//  ERRORS
// ============================================================================

/// Failures at the core boundary.
#[derive(Debug, Clone, Error)]
pub enum ConduitError {
    /// The core rejected or failed the metadata handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The core went away, or its frame stream ended unexpectedly.
    #[error("conduit closed: {0}")]
    Closed(String),
    /// An I/O failure inside the core boundary.
    #[error("conduit i/o: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ConduitError>;

// ============================================================================
//  THE CONDUIT
// ============================================================================

/// A handle to the native core.
#[async_trait]
pub trait Conduit: Send + Sync + 'static {
    /// Performs the one-shot metadata handshake: hands the core an encoded
    /// init request, gets back the core's encoded metadata snapshot.
    fn init(&self, request: Vec<u8>) -> Result<Vec<u8>>;

    /// Starts the core's own machinery. Called exactly once, after a
    /// successful `init` and after the registries are built.
    fn run(&self) -> Result<()>;

    /// Awaits the next inbound frame. `Ok(None)` means the stream is done
    /// and the dispatch loop should wind down.
    ///
    /// # invariants
    ///
    /// - The runtime is the sole reader. Frames come back in arrival order.
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Queues one outbound frame for the connection behind `socket_id`.
    /// Must not block on the network.
    fn send_message(&self, socket_id: &str, frame: Vec<u8>) -> Result<()>;
}
