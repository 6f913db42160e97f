//! In-process cores for tests and demos.
//!
//! [`MockConduit`] answers the handshake from a canned snapshot, feeds the
//! dispatch loop from a channel, and captures every outbound frame for
//! inspection. No sockets anywhere.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use rmpv::Value as Wire;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use hypharpc::codec;
use hypharpc::envelope::TAG_INVOKE;
use hypharpc::metadata::MetadataSnapshot;

use crate::conduit::Conduit;
use crate::conduit::Result;

/// One captured outbound frame.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub socket_id: String,
    pub frame: Vec<u8>,
}

/// A scripted core.
pub struct MockConduit {
    handshake: Vec<u8>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    init_request: StdMutex<Option<Vec<u8>>>,
    sent: StdMutex<Vec<SentFrame>>,
}

/// The test's side of a [`MockConduit`]: feeds frames in, ends the stream.
pub struct MockHandle {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockConduit {
    /// A core that answers the handshake with `snapshot`.
    pub fn new(snapshot: &MetadataSnapshot) -> (Arc<Self>, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conduit = Arc::new(Self {
            handshake: snapshot.to_bytes().expect("snapshot encodes"),
            inbound: Mutex::new(rx),
            init_request: StdMutex::new(None),
            sent: StdMutex::new(Vec::new()),
        });
        (conduit, MockHandle { inbound: tx })
    }

    /// The init request captured during the handshake, if one happened.
    pub fn init_request(&self) -> Option<Vec<u8>> {
        self.init_request.lock().unwrap().clone()
    }

    /// Every frame sent so far, in order.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Conduit for MockConduit {
    fn init(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        *self.init_request.lock().unwrap() = Some(request);
        Ok(self.handshake.clone())
    }

    fn run(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await)
    }

    fn send_message(&self, socket_id: &str, frame: Vec<u8>) -> Result<()> {
        self.sent.lock().unwrap().push(SentFrame {
            socket_id: socket_id.to_string(),
            frame,
        });
        Ok(())
    }
}

impl MockHandle {
    /// Queues a raw inbound frame.
    pub fn push_frame(&self, frame: Vec<u8>) {
        let _ = self.inbound.send(frame);
    }

    /// Queues an invoke addressed by id triple, wrapped like a core would.
    pub fn push_invoke(
        &self,
        package_id: u32,
        socket_id: &str,
        module_id: u32,
        handler_id: u32,
        body: Option<Vec<u8>>,
    ) {
        self.push_frame(invoke_frame(package_id, socket_id, module_id, handler_id, body));
    }

    /// Ends the inbound stream. Queued frames still drain; then the dispatch
    /// loop returns cleanly.
    pub fn close(self) {}
}

/// Encodes an invoke inside an inbound envelope, byte-for-byte what a core
/// would deliver. Headers and cookies are left empty.
pub fn invoke_frame(
    package_id: u32,
    socket_id: &str,
    module_id: u32,
    handler_id: u32,
    body: Option<Vec<u8>>,
) -> Vec<u8> {
    let payload = codec::encode_multi(&[
        Wire::from(TAG_INVOKE),
        Wire::from(module_id),
        Wire::from(handler_id),
        Wire::Map(Vec::new()),
        match body {
            Some(bytes) => Wire::Binary(bytes),
            None => Wire::Nil,
        },
    ])
    .expect("invoke payload encodes");
    codec::encode_multi(&[
        Wire::from(package_id),
        Wire::Map(Vec::new()),
        Wire::Binary(payload),
        Wire::from(socket_id),
    ])
    .expect("envelope encodes")
}
