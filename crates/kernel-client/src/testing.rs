//! An in-memory kernel for connection and comm tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use kernel_wire::{decode, encode, KernelMessage, MessageType};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{ClientError, Result};
use crate::kernel::{ConnectionStatus, KernelConnection, KernelConnectionOptions};
use crate::kernel_manager::KernelModel;
use crate::poll::Backoff;
use crate::server::ServerConnection;
use crate::settings::ServerSettings;
use crate::transport::{Connector, TransportEvent, TransportHandle, TransportPeer};

pub(crate) struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    failing: AtomicBool,
    attempts: AtomicU32,
}

impl MockConnector {
    pub(crate) fn fail_from_now_on(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        _kernel_id: &str,
        _client_id: &str,
    ) -> BoxFuture<'static, Result<TransportHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ClientError::Transport("connection refused".into())) });
        }
        let (handle, transport) = TransportHandle::pair();
        let _ = self.peers.send(MockPeer { transport });
        Box::pin(async move { Ok(handle) })
    }
}

/// Plays the kernel on the far side of one transport.
pub(crate) struct MockPeer {
    transport: TransportPeer,
}

impl MockPeer {
    pub(crate) async fn next_message(&mut self) -> KernelMessage {
        let frame = self
            .transport
            .received
            .recv()
            .await
            .expect("client closed the transport");
        decode(&frame).expect("client sent an undecodable frame")
    }

    pub(crate) fn send(&self, msg: KernelMessage) {
        let frame = encode(&msg).expect("encodable message");
        let _ = self.transport.events.send(TransportEvent::Frame(frame));
    }

    /// Reply to `parent` on the channel it came in on.
    pub(crate) fn reply(&self, parent: &KernelMessage, kind: MessageType, content: Value) {
        self.send(
            KernelMessage::new(kind, parent.channel, "kernel", "", content)
                .with_parent(&parent.header),
        );
    }

    pub(crate) fn iopub(&self, parent: &KernelMessage, kind: MessageType, content: Value) {
        self.send(
            KernelMessage::new(kind, kernel_wire::Channel::IOPub, "kernel", "", content)
                .with_parent(&parent.header),
        );
    }

    pub(crate) fn status(&self, parent: &KernelMessage, state: &str) {
        self.iopub(parent, MessageType::Status, json!({"execution_state": state}));
    }

    pub(crate) fn close(&self) {
        let _ = self
            .transport
            .events
            .send(TransportEvent::Closed { reason: None });
    }
}

pub(crate) struct Harness {
    pub kernel: KernelConnection,
    pub peer: MockPeer,
    pub peers: mpsc::UnboundedReceiver<MockPeer>,
    pub connector: Arc<MockConnector>,
}

/// Reconnect schedule used by [`harness`].
pub(crate) fn reconnect_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(40))
}

/// A connection to a mock kernel, already connected.
pub(crate) async fn harness() -> Harness {
    let (tx, mut peers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        peers: tx,
        failing: AtomicBool::new(false),
        attempts: AtomicU32::new(0),
    });
    let options = KernelConnectionOptions {
        client_id: None,
        username: "tester".into(),
        reconnect: reconnect_backoff(),
        max_reconnect_attempts: 3,
    };
    let server = Arc::new(ServerConnection::new(ServerSettings::default()).expect("http client"));
    let kernel = KernelConnection::with_connector(
        &KernelModel::new("k1", "python3"),
        server,
        options,
        connector.clone(),
    );
    let peer = peers.recv().await.expect("first transport");
    kernel
        .watch_connection_status()
        .wait_for(|s| *s == ConnectionStatus::Connected)
        .await
        .expect("connected");
    Harness {
        kernel,
        peer,
        peers,
        connector,
    }
}
