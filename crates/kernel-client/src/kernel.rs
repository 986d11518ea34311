//! A live connection to one kernel.
//!
//! Every [`KernelConnection`] is backed by a single worker task that owns the
//! transport, the pending request futures and the open comms. Public methods
//! only build messages and hand commands to the worker, so sending never
//! blocks and inbound dispatch happens in one place, in arrival order.
//!
//! Lifecycle:
//! - transport open: connection status `connected`, kernel status
//!   `connecting` until the kernel reports one, `kernel_info_request` sent,
//!   queued frames flushed;
//! - transport closed: reconnect with backoff, up to `max_reconnect_attempts`;
//! - iopub `restarting`: futures and comms dropped, transport reopened;
//! - iopub `dead`: futures and comms dropped, no reconnect.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kernel_wire::{decode, encode, Channel, Header, KernelMessage, MessageType, WireFrame};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::comm::{Comm, CommEntry, CommEvent, CommOpen};
use crate::error::{ClientError, Result};
use crate::future::{FutureEntry, KernelFuture, Routed};
use crate::kernel_manager::{self, KernelModel};
use crate::poll::{sleep_until, Backoff};
use crate::server::ServerConnection;
use crate::transport::{Connector, TransportEvent, TransportHandle, WebSocketConnector};

/// Kernel execution status as tracked by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Terminating,
    Restarting,
    Autorestarting,
    Dead,
    Connecting,
}

impl KernelStatus {
    /// Parse the `execution_state` of an iopub `status` message.
    pub fn from_execution_state(state: &str) -> Self {
        match state {
            "starting" => KernelStatus::Starting,
            "idle" => KernelStatus::Idle,
            "busy" => KernelStatus::Busy,
            "terminating" => KernelStatus::Terminating,
            "restarting" => KernelStatus::Restarting,
            "autorestarting" => KernelStatus::Autorestarting,
            "dead" => KernelStatus::Dead,
            "connecting" => KernelStatus::Connecting,
            _ => KernelStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelStatus::Unknown => "unknown",
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Terminating => "terminating",
            KernelStatus::Restarting => "restarting",
            KernelStatus::Autorestarting => "autorestarting",
            KernelStatus::Dead => "dead",
            KernelStatus::Connecting => "connecting",
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the transport underneath a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Notifications broadcast to every subscriber of a connection.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    StatusChanged(KernelStatus),
    ConnectionStatusChanged(ConnectionStatus),
    /// The transport failed to open or errored. Carries a description.
    ConnectionFailure(String),
    /// Every iopub message, after it has been routed.
    IOPub(KernelMessage),
    /// A reply or prompt whose parent request is not pending.
    Unhandled(KernelMessage),
    Disposed,
}

/// Content of an `execute_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Value,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: json!({}),
            allow_stdin: true,
            stop_on_error: false,
        }
    }
}

/// Options for opening a [`KernelConnection`].
#[derive(Debug, Clone)]
pub struct KernelConnectionOptions {
    /// Session id stamped on every message; random when unset.
    pub client_id: Option<String>,
    pub username: String,
    /// Delay schedule between reconnect attempts.
    pub reconnect: Backoff,
    pub max_reconnect_attempts: u32,
}

impl Default for KernelConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            username: String::new(),
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(64)),
            max_reconnect_attempts: 7,
        }
    }
}

/// Work handed to the connection worker.
pub(crate) enum Command {
    Send {
        msg: KernelMessage,
        entry: Option<FutureEntry>,
    },
    DisposeFuture(String),
    RegisterComm {
        comm_id: String,
        entry: CommEntry,
    },
    CloseComm {
        msg: KernelMessage,
        entry: FutureEntry,
    },
    DisposeComm(String),
    HasComm {
        comm_id: String,
        reply: oneshot::Sender<bool>,
    },
    RegisterTarget {
        target_name: String,
        sender: mpsc::UnboundedSender<CommOpen>,
    },
    RemoveTarget(String),
    Reconnect,
    Restarting,
    MarkDead,
    Dispose,
}

/// What comms and futures need to reach the worker.
#[derive(Clone)]
pub(crate) struct Link {
    commands: mpsc::UnboundedSender<Command>,
    client_id: String,
    username: String,
    status: watch::Receiver<KernelStatus>,
    disposed: Arc<AtomicBool>,
}

impl Link {
    pub(crate) fn message(&self, kind: MessageType, channel: Channel, content: Value) -> KernelMessage {
        KernelMessage::new(kind, channel, &self.client_id, &self.username, content)
    }

    pub(crate) fn check_available(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::KernelUnavailable("connection is disposed".into()));
        }
        if *self.status.borrow() == KernelStatus::Dead {
            return Err(ClientError::KernelUnavailable("kernel is dead".into()));
        }
        Ok(())
    }

    pub(crate) fn command(&self, command: Command) {
        let _ = self.commands.send(command);
    }

    /// Register a future for `msg` and queue it for sending.
    pub(crate) fn send(
        &self,
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<KernelFuture> {
        self.check_available()?;
        let (future, entry) =
            KernelFuture::new(msg.clone(), expect_reply, dispose_on_done, self.commands.clone());
        self.command(Command::Send {
            msg,
            entry: Some(entry),
        });
        Ok(future)
    }

    /// Build a future for `msg` without queueing anything.
    pub(crate) fn prepare(
        &self,
        msg: &KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> (KernelFuture, FutureEntry) {
        KernelFuture::new(msg.clone(), expect_reply, dispose_on_done, self.commands.clone())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

struct Shared {
    id: String,
    name: String,
    link: Link,
    server: Arc<ServerConnection>,
    events: broadcast::Sender<KernelEvent>,
    connection_status: watch::Receiver<ConnectionStatus>,
    kernel_info: watch::Receiver<Option<KernelMessage>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.link.disposed.store(true, Ordering::SeqCst);
        self.link.command(Command::Dispose);
    }
}

/// Handle to a kernel connection. Clones share the same connection; the
/// connection is disposed when the last clone is dropped.
#[derive(Clone)]
pub struct KernelConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConnection")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("client_id", &self.shared.link.client_id)
            .field("status", &self.status())
            .finish()
    }
}

impl KernelConnection {
    /// Connect to a running kernel over the server's WebSocket endpoint.
    pub fn connect(
        model: &KernelModel,
        server: Arc<ServerConnection>,
        options: KernelConnectionOptions,
    ) -> Self {
        let connector = Arc::new(WebSocketConnector::new(server.clone()));
        Self::with_connector(model, server, options, connector)
    }

    /// Connect through a custom transport.
    pub fn with_connector(
        model: &KernelModel,
        server: Arc<ServerConnection>,
        options: KernelConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let client_id = options
            .client_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(KernelStatus::Unknown);
        let (connection_tx, connection_rx) = watch::channel(ConnectionStatus::Connecting);
        let (info_tx, info_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(256);
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();

        let link = Link {
            commands: commands_tx,
            client_id,
            username: options.username,
            status: status_rx,
            disposed: Arc::new(AtomicBool::new(false)),
        };

        let worker = Worker {
            id: model.id.clone(),
            link: link.clone(),
            connector,
            status: status_tx,
            connection_status: connection_tx,
            kernel_info: info_tx,
            events: events.clone(),
            outgoing: None,
            incoming: None,
            queue: VecDeque::new(),
            futures: HashMap::new(),
            comms: HashMap::new(),
            targets: HashMap::new(),
            backoff: options.reconnect,
            max_attempts: options.max_reconnect_attempts,
            attempts: 0,
            generation: 0,
            connected_tx,
            reconnect_at: None,
            info_request: None,
        };
        info!(
            "[kernel-connection] Connecting to kernel {} ({}) as {}",
            model.id, model.name, link.client_id
        );
        tokio::spawn(worker.run(commands_rx, connected_rx));

        Self {
            shared: Arc::new(Shared {
                id: model.id.clone(),
                name: model.name.clone(),
                link,
                server,
                events,
                connection_status: connection_rx,
                kernel_info: info_rx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn client_id(&self) -> &str {
        &self.shared.link.client_id
    }

    pub fn username(&self) -> &str {
        &self.shared.link.username
    }

    pub fn model(&self) -> KernelModel {
        KernelModel::new(&self.shared.id, &self.shared.name)
    }

    pub fn status(&self) -> KernelStatus {
        *self.shared.link.status.borrow()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.shared.connection_status.borrow()
    }

    /// The most recent `kernel_info_reply`.
    pub fn kernel_info(&self) -> Option<KernelMessage> {
        self.shared.kernel_info.borrow().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.link.is_disposed()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.shared.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.shared.link.status.clone()
    }

    pub fn watch_connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.connection_status.clone()
    }

    /// Wait until the kernel reports `target`.
    pub async fn wait_for_status(&self, target: KernelStatus) -> Result<()> {
        let mut status = self.watch_status();
        status
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Disposed)
    }

    /// Dispose the connection: every pending future fails with
    /// [`ClientError::Disposed`] and every comm is closed locally.
    pub fn dispose(&self) {
        if !self.shared.link.disposed.swap(true, Ordering::SeqCst) {
            self.shared.link.command(Command::Dispose);
        }
    }

    /// Build a message stamped with this connection's session and username.
    pub fn create_message(&self, kind: MessageType, channel: Channel, content: Value) -> KernelMessage {
        self.shared.link.message(kind, channel, content)
    }

    pub fn send_shell_message(
        &self,
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<KernelFuture> {
        expect_channel(&msg, Channel::Shell)?;
        self.shared.link.send(msg, expect_reply, dispose_on_done)
    }

    pub fn send_control_message(
        &self,
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<KernelFuture> {
        expect_channel(&msg, Channel::Control)?;
        self.shared.link.send(msg, expect_reply, dispose_on_done)
    }

    pub fn request_execute(
        &self,
        content: ExecuteRequest,
        dispose_on_done: bool,
        metadata: Option<Value>,
    ) -> Result<KernelFuture> {
        let mut msg = self.create_message(
            MessageType::ExecuteRequest,
            Channel::Shell,
            serde_json::to_value(content)?,
        );
        if let Some(metadata) = metadata {
            msg = msg.with_metadata(metadata);
        }
        self.send_shell_message(msg, true, dispose_on_done)
    }

    pub async fn request_kernel_info(&self) -> Result<KernelMessage> {
        self.request_reply(MessageType::KernelInfoRequest, json!({})).await
    }

    pub async fn request_complete(&self, code: &str, cursor_pos: usize) -> Result<KernelMessage> {
        self.request_reply(
            MessageType::CompleteRequest,
            json!({"code": code, "cursor_pos": cursor_pos}),
        )
        .await
    }

    pub async fn request_inspect(
        &self,
        code: &str,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<KernelMessage> {
        self.request_reply(
            MessageType::InspectRequest,
            json!({"code": code, "cursor_pos": cursor_pos, "detail_level": detail_level}),
        )
        .await
    }

    /// `content` is a full `history_request` body (`hist_access_type`, ...).
    pub async fn request_history(&self, content: Value) -> Result<KernelMessage> {
        self.request_reply(MessageType::HistoryRequest, content).await
    }

    pub async fn request_is_complete(&self, code: &str) -> Result<KernelMessage> {
        self.request_reply(MessageType::IsCompleteRequest, json!({"code": code}))
            .await
    }

    pub async fn request_comm_info(&self, target_name: Option<&str>) -> Result<KernelMessage> {
        let content = match target_name {
            Some(target) => json!({"target_name": target}),
            None => json!({}),
        };
        self.request_reply(MessageType::CommInfoRequest, content).await
    }

    /// Send a `debug_request` on the control channel.
    pub fn request_debug(&self, content: Value, dispose_on_done: bool) -> Result<KernelFuture> {
        let msg = self.create_message(MessageType::DebugRequest, Channel::Control, content);
        self.send_control_message(msg, true, dispose_on_done)
    }

    /// Answer an `input_request`. No future is created.
    pub fn send_input_reply(&self, content: Value, parent: &Header) -> Result<()> {
        let link = &self.shared.link;
        link.check_available()?;
        let msg = link
            .message(MessageType::InputReply, Channel::Stdin, content)
            .with_parent(parent);
        link.command(Command::Send { msg, entry: None });
        Ok(())
    }

    /// Create a comm for `target_name`. It is registered before this returns,
    /// so messages for it are routed even before `open()`.
    pub fn create_comm(&self, target_name: &str, comm_id: Option<String>) -> Result<Comm> {
        let link = &self.shared.link;
        link.check_available()?;
        let comm_id = comm_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (comm, entry) = Comm::new(&comm_id, target_name, link.clone());
        link.command(Command::RegisterComm { comm_id, entry });
        Ok(comm)
    }

    pub async fn has_comm(&self, comm_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        self.shared.link.command(Command::HasComm {
            comm_id: comm_id.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Receive comms the kernel opens for `target_name`.
    pub fn register_comm_target(
        &self,
        target_name: &str,
    ) -> Result<mpsc::UnboundedReceiver<CommOpen>> {
        self.shared.link.check_available()?;
        let (sender, rx) = mpsc::unbounded_channel();
        self.shared.link.command(Command::RegisterTarget {
            target_name: target_name.to_string(),
            sender,
        });
        Ok(rx)
    }

    pub fn remove_comm_target(&self, target_name: &str) {
        self.shared
            .link
            .command(Command::RemoveTarget(target_name.to_string()));
    }

    /// Drop the current transport and connect again, resetting the attempt
    /// counter.
    pub fn reconnect(&self) {
        self.shared.link.command(Command::Reconnect);
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.check_alive()?;
        kernel_manager::interrupt_kernel(&self.shared.server, &self.shared.id).await
    }

    /// Restart the kernel through the server, then reconnect.
    pub async fn restart(&self) -> Result<()> {
        self.check_alive()?;
        self.shared.link.command(Command::Restarting);
        kernel_manager::restart_kernel(&self.shared.server, &self.shared.id).await?;
        self.shared.link.command(Command::Reconnect);
        Ok(())
    }

    /// Shut the kernel down through the server and dispose this connection.
    pub async fn shutdown(&self) -> Result<()> {
        if self.status() != KernelStatus::Dead {
            kernel_manager::shutdown_kernel(&self.shared.server, &self.shared.id).await?;
        }
        self.shared.link.command(Command::MarkDead);
        self.dispose();
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        if self.status() == KernelStatus::Dead {
            return Err(ClientError::KernelDead);
        }
        Ok(())
    }

    async fn request_reply(&self, kind: MessageType, content: Value) -> Result<KernelMessage> {
        let msg = self.create_message(kind, Channel::Shell, content);
        let mut future = self.send_shell_message(msg, true, true)?;
        future.done().await?.ok_or(ClientError::Disposed)
    }
}

fn expect_channel(msg: &KernelMessage, expected: Channel) -> Result<()> {
    if msg.channel != expected {
        return Err(ClientError::InvalidChannel {
            channel: msg.channel,
            expected,
        });
    }
    Ok(())
}

struct Worker {
    id: String,
    link: Link,
    connector: Arc<dyn Connector>,
    status: watch::Sender<KernelStatus>,
    connection_status: watch::Sender<ConnectionStatus>,
    kernel_info: watch::Sender<Option<KernelMessage>>,
    events: broadcast::Sender<KernelEvent>,
    outgoing: Option<mpsc::UnboundedSender<WireFrame>>,
    incoming: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// Frames written while no transport is open.
    queue: VecDeque<WireFrame>,
    futures: HashMap<String, FutureEntry>,
    comms: HashMap<String, CommEntry>,
    targets: HashMap<String, mpsc::UnboundedSender<CommOpen>>,
    backoff: Backoff,
    max_attempts: u32,
    attempts: u32,
    /// Bumped on every connect so stale connect results are ignored.
    generation: u64,
    connected_tx: mpsc::UnboundedSender<(u64, Result<TransportHandle>)>,
    reconnect_at: Option<Instant>,
    info_request: Option<String>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connected: mpsc::UnboundedReceiver<(u64, Result<TransportHandle>)>,
    ) {
        self.connect();
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                Some((generation, result)) = connected.recv() => {
                    self.on_connected(generation, result);
                }
                event = next_transport_event(&mut self.incoming) => {
                    self.on_transport_event(event);
                }
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect();
                }
            }
        }
        self.shutdown();
    }

    /// Returns `false` when the worker should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Send { msg, entry } => self.send(msg, entry),
            Command::DisposeFuture(msg_id) => {
                if self.futures.remove(&msg_id).is_some() {
                    debug!("[kernel-connection] Disposed future {}", msg_id);
                }
            }
            Command::RegisterComm { comm_id, entry } => {
                if let Some(previous) = self.comms.insert(comm_id.clone(), entry) {
                    warn!("[kernel-connection] Replaced existing comm {}", comm_id);
                    previous.dispose();
                }
            }
            Command::CloseComm { msg, entry } => self.close_comm(msg, entry),
            Command::DisposeComm(comm_id) => {
                if let Some(comm) = self.comms.remove(&comm_id) {
                    comm.dispose();
                }
            }
            Command::HasComm { comm_id, reply } => {
                let _ = reply.send(self.comms.contains_key(&comm_id));
            }
            Command::RegisterTarget {
                target_name,
                sender,
            } => {
                self.targets.insert(target_name, sender);
            }
            Command::RemoveTarget(target_name) => {
                self.targets.remove(&target_name);
            }
            Command::Reconnect => {
                if self.current_status() != KernelStatus::Dead {
                    self.attempts = 0;
                    self.reconnect_at = None;
                    self.connect();
                }
            }
            Command::Restarting => {
                self.set_status(KernelStatus::Restarting);
                self.clear_kernel_state(|| ClientError::KernelRestarting);
            }
            Command::MarkDead => self.mark_dead(),
            Command::Dispose => return false,
        }
        true
    }

    fn current_status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    fn set_status(&mut self, status: KernelStatus) {
        let previous = self.current_status();
        if previous == status || previous == KernelStatus::Dead {
            return;
        }
        self.status.send_replace(status);
        debug!(
            "[kernel-connection] Kernel {} status {} -> {}",
            self.id, previous, status
        );
        let _ = self.events.send(KernelEvent::StatusChanged(status));
    }

    fn set_connection_status(&mut self, status: ConnectionStatus) {
        let previous = *self.connection_status.borrow();
        if previous == status {
            return;
        }
        self.connection_status.send_replace(status);
        info!(
            "[kernel-connection] Kernel {} connection {}",
            self.id, status
        );
        let _ = self
            .events
            .send(KernelEvent::ConnectionStatusChanged(status));
    }

    fn connect(&mut self) {
        self.generation += 1;
        self.outgoing = None;
        self.incoming = None;
        self.set_connection_status(ConnectionStatus::Connecting);
        self.set_status(KernelStatus::Connecting);

        let generation = self.generation;
        let connector = self.connector.clone();
        let kernel_id = self.id.clone();
        let client_id = self.link.client_id.clone();
        let tx = self.connected_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&kernel_id, &client_id).await;
            let _ = tx.send((generation, result));
        });
    }

    fn on_connected(&mut self, generation: u64, result: Result<TransportHandle>) {
        if generation != self.generation || self.current_status() == KernelStatus::Dead {
            debug!("[kernel-connection] Ignoring stale connect result");
            return;
        }
        match result {
            Ok(handle) => {
                self.outgoing = Some(handle.outgoing);
                self.incoming = Some(handle.incoming);
                self.attempts = 0;
                self.set_connection_status(ConnectionStatus::Connected);

                let info = self.link.message(MessageType::KernelInfoRequest, Channel::Shell, json!({}));
                self.info_request = Some(info.msg_id().to_string());
                if let Err(e) = self.transmit(&info) {
                    warn!("[kernel-connection] Could not request kernel info: {}", e);
                }
                while let Some(frame) = self.queue.pop_front() {
                    if !self.write(frame) {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(
                    "[kernel-connection] Connection to kernel {} failed: {}",
                    self.id, e
                );
                let _ = self
                    .events
                    .send(KernelEvent::ConnectionFailure(e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.outgoing = None;
        self.incoming = None;
        if self.current_status() == KernelStatus::Dead {
            self.set_connection_status(ConnectionStatus::Disconnected);
            return;
        }
        if self.attempts >= self.max_attempts {
            error!(
                "[kernel-connection] Giving up on kernel {} after {} attempts",
                self.id, self.attempts
            );
            self.set_connection_status(ConnectionStatus::Disconnected);
            let _ = self.events.send(KernelEvent::ConnectionFailure(format!(
                "could not reconnect after {} attempts",
                self.attempts
            )));
            return;
        }
        let delay = self.backoff.delay(self.attempts);
        self.attempts += 1;
        info!(
            "[kernel-connection] Reconnecting to kernel {} in {:?} (attempt {} of {})",
            self.id, delay, self.attempts, self.max_attempts
        );
        self.set_connection_status(ConnectionStatus::Connecting);
        self.set_status(KernelStatus::Connecting);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => match decode(&frame) {
                Ok(msg) => self.dispatch(msg),
                Err(e) => warn!("[kernel-connection] Dropping undecodable frame: {}", e),
            },
            TransportEvent::Error(e) => {
                warn!("[kernel-connection] Transport error: {}", e);
                let _ = self.events.send(KernelEvent::ConnectionFailure(e));
            }
            TransportEvent::Closed { reason } => {
                info!(
                    "[kernel-connection] Transport to kernel {} closed{}",
                    self.id,
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                self.schedule_reconnect();
            }
        }
    }

    /// Queue or write one frame. Returns `false` if it had to be queued.
    fn write(&mut self, frame: WireFrame) -> bool {
        match &self.outgoing {
            Some(outgoing) => match outgoing.send(frame) {
                Ok(()) => true,
                Err(mpsc::error::SendError(frame)) => {
                    self.queue.push_front(frame);
                    false
                }
            },
            None => {
                self.queue.push_back(frame);
                false
            }
        }
    }

    fn transmit(&mut self, msg: &KernelMessage) -> Result<()> {
        let frame = encode(msg)?;
        self.write(frame);
        Ok(())
    }

    fn send(&mut self, msg: KernelMessage, entry: Option<FutureEntry>) {
        if self.current_status() == KernelStatus::Dead {
            if let Some(entry) = entry {
                entry.fail(ClientError::KernelDead);
            }
            return;
        }
        let msg_id = msg.msg_id().to_string();
        if let Some(entry) = entry {
            self.futures.insert(msg_id.clone(), entry);
        }
        if let Err(e) = self.transmit(&msg) {
            error!("[kernel-connection] Could not encode {}: {}", msg.header.msg_type, e);
            if let Some(entry) = self.futures.remove(&msg_id) {
                entry.fail(e);
            }
        }
    }

    fn dispatch(&mut self, msg: KernelMessage) {
        let kind = msg.msg_type();
        match msg.channel {
            Channel::Shell | Channel::Control => self.on_reply(msg, kind),
            Channel::Stdin => self.on_stdin(msg),
            Channel::IOPub => self.on_iopub(msg, kind),
        }
    }

    fn on_reply(&mut self, msg: KernelMessage, kind: MessageType) {
        if kind == MessageType::KernelInfoReply {
            self.kernel_info.send_replace(Some(msg.clone()));
        }
        let parent = msg.parent_msg_id().map(str::to_string);
        if parent.is_some() && parent == self.info_request {
            self.info_request = None;
            return;
        }
        match parent.as_deref().and_then(|id| self.futures.get_mut(id)) {
            Some(entry) => {
                let routed = entry.on_reply(msg);
                self.settle(parent.as_deref(), routed);
            }
            None => self.unhandled(msg),
        }
    }

    fn on_stdin(&mut self, msg: KernelMessage) {
        match msg.parent_msg_id().and_then(|id| self.futures.get_mut(id)) {
            Some(entry) => entry.on_stdin(msg),
            None => self.unhandled(msg),
        }
    }

    fn on_iopub(&mut self, msg: KernelMessage, kind: MessageType) {
        let parent = msg.parent_msg_id().map(str::to_string);
        if let Some(entry) = parent.as_deref().and_then(|id| self.futures.get_mut(id)) {
            let routed = entry.on_iopub(msg.clone());
            self.settle(parent.as_deref(), routed);
        } else if msg.parent_header.as_ref().map(|h| h.session.as_str())
            == Some(self.link.client_id.as_str())
        {
            debug!(
                "[kernel-connection] No future for iopub {} (parent {:?})",
                kind, parent
            );
        }

        match kind {
            MessageType::Status => {
                let state = msg.content_str("execution_state").unwrap_or("unknown");
                self.on_status(KernelStatus::from_execution_state(state));
            }
            MessageType::CommOpen => self.on_comm_open(&msg),
            MessageType::CommMsg => {
                if let Some(comm) = msg.content_str("comm_id").and_then(|id| self.comms.get(id)) {
                    comm.deliver(CommEvent::Msg(msg.clone()));
                }
            }
            MessageType::CommClose => {
                if let Some(comm) = msg.content_str("comm_id").and_then(|id| self.comms.remove(id)) {
                    comm.deliver(CommEvent::Close(msg.clone()));
                    comm.dispose();
                }
            }
            _ => {}
        }

        let _ = self.events.send(KernelEvent::IOPub(msg));
    }

    fn on_status(&mut self, status: KernelStatus) {
        match status {
            // Requested through `restart()`, which reconnects once the server answers.
            KernelStatus::Restarting if self.current_status() == KernelStatus::Restarting => {
                debug!("[kernel-connection] Kernel {} restart already in progress", self.id);
            }
            KernelStatus::Restarting => {
                info!("[kernel-connection] Kernel {} restarted by the server", self.id);
                self.set_status(KernelStatus::Autorestarting);
                self.clear_kernel_state(|| ClientError::KernelRestarting);
                self.attempts = 0;
                self.reconnect_at = None;
                self.connect();
            }
            KernelStatus::Dead => self.mark_dead(),
            other => self.set_status(other),
        }
    }

    fn settle(&mut self, msg_id: Option<&str>, routed: Routed) {
        if let (Routed::Finished, Some(id)) = (routed, msg_id) {
            self.futures.remove(id);
        }
    }

    fn unhandled(&mut self, msg: KernelMessage) {
        debug!(
            "[kernel-connection] Unhandled {} on {} (parent {:?})",
            msg.header.msg_type,
            msg.channel,
            msg.parent_msg_id()
        );
        let _ = self.events.send(KernelEvent::Unhandled(msg));
    }

    fn on_comm_open(&mut self, msg: &KernelMessage) {
        let (Some(comm_id), Some(target_name)) =
            (msg.content_str("comm_id"), msg.content_str("target_name"))
        else {
            warn!("[kernel-connection] comm_open without comm_id or target_name");
            return;
        };
        if self.comms.contains_key(comm_id) {
            return;
        }

        let delivered = match self.targets.get(target_name) {
            Some(sender) => {
                let (comm, entry) = Comm::new(comm_id, target_name, self.link.clone());
                let opened = CommOpen {
                    comm,
                    msg: msg.clone(),
                };
                sender.send(opened).is_ok().then_some(entry)
            }
            None => None,
        };
        match delivered {
            Some(entry) => {
                self.comms.insert(comm_id.to_string(), entry);
            }
            None => {
                self.targets.remove(target_name);
                warn!(
                    "[kernel-connection] No comm target for {}, closing comm {}",
                    target_name, comm_id
                );
                let close = self.link.message(
                    MessageType::CommClose,
                    Channel::Shell,
                    json!({"comm_id": comm_id, "data": {}}),
                );
                if let Err(e) = self.transmit(&close) {
                    warn!("[kernel-connection] Could not close comm {}: {}", comm_id, e);
                }
            }
        }
    }

    /// The handle already delivered its local close event.
    fn close_comm(&mut self, msg: KernelMessage, entry: FutureEntry) {
        let comm_id = msg.content_str("comm_id").map(str::to_string);
        self.send(msg, Some(entry));

        if let Some(comm) = comm_id.and_then(|id| self.comms.remove(&id)) {
            comm.dispose();
        }
    }

    /// Fail every pending future and drop every comm.
    fn clear_kernel_state(&mut self, reason: impl Fn() -> ClientError) {
        for (_, entry) in self.futures.drain() {
            entry.fail(reason());
        }
        for (_, comm) in self.comms.drain() {
            comm.dispose();
        }
        self.queue.clear();
    }

    fn mark_dead(&mut self) {
        info!("[kernel-connection] Kernel {} is dead", self.id);
        self.set_status(KernelStatus::Dead);
        self.clear_kernel_state(|| ClientError::KernelDead);
        self.outgoing = None;
        self.incoming = None;
        self.reconnect_at = None;
        self.set_connection_status(ConnectionStatus::Disconnected);
    }

    fn shutdown(&mut self) {
        self.link.disposed.store(true, Ordering::SeqCst);
        self.clear_kernel_state(|| ClientError::Disposed);
        self.targets.clear();
        self.outgoing = None;
        self.incoming = None;
        self.set_connection_status(ConnectionStatus::Disconnected);
        let _ = self.events.send(KernelEvent::Disposed);
        debug!("[kernel-connection] Connection to kernel {} disposed", self.id);
    }
}

async fn next_transport_event(
    incoming: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    match incoming {
        Some(rx) => {
            let event = rx
                .recv()
                .await
                .unwrap_or(TransportEvent::Closed { reason: None });
            if matches!(event, TransportEvent::Closed { .. }) {
                *incoming = None;
            }
            event
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureEvent;
    use crate::testing::{harness, reconnect_backoff, Harness};

    #[tokio::test]
    async fn open_requests_kernel_info_and_caches_the_reply() {
        let Harness {
            kernel, mut peer, ..
        } = harness().await;
        assert_eq!(kernel.connection_status(), ConnectionStatus::Connected);
        assert_eq!(kernel.status(), KernelStatus::Connecting);

        let request = peer.next_message().await;
        assert_eq!(request.msg_type(), MessageType::KernelInfoRequest);
        assert_eq!(request.header.session, kernel.client_id());

        peer.reply(&request, MessageType::KernelInfoReply, json!({"status": "ok", "implementation": "mock"}));
        peer.status(&request, "idle");
        kernel.wait_for_status(KernelStatus::Idle).await.unwrap();
        let info = kernel.kernel_info().unwrap();
        assert_eq!(info.content["implementation"], "mock");
    }

    #[tokio::test]
    async fn execute_future_sees_its_own_messages() {
        let Harness {
            kernel, mut peer, ..
        } = harness().await;
        peer.next_message().await;

        let mut events = kernel.subscribe();
        let mut future = kernel
            .request_execute(ExecuteRequest::new("print('hi')"), true, None)
            .unwrap();
        let request = peer.next_message().await;
        assert_eq!(request.msg_id(), future.msg_id());

        // A reply to a request nobody is waiting for.
        let stranger = kernel.create_message(MessageType::ExecuteRequest, Channel::Shell, json!({}));
        peer.reply(&stranger, MessageType::ExecuteReply, json!({"status": "ok"}));

        peer.status(&request, "busy");
        peer.iopub(&request, MessageType::Stream, json!({"name": "stdout", "text": "hi\n"}));
        peer.reply(&request, MessageType::ExecuteReply, json!({"status": "ok", "execution_count": 1}));
        peer.status(&request, "idle");

        let mut kinds = Vec::new();
        while let Some(event) = future.next_event().await {
            kinds.push(match event {
                FutureEvent::Reply(m) => format!("reply:{}", m.header.msg_type),
                FutureEvent::IOPub(m) => format!("iopub:{}", m.header.msg_type),
                FutureEvent::Stdin(m) => format!("stdin:{}", m.header.msg_type),
            });
        }
        assert_eq!(
            kinds,
            vec!["iopub:status", "iopub:stream", "reply:execute_reply", "iopub:status"]
        );
        let reply = future.done().await.unwrap().unwrap();
        assert_eq!(reply.content["execution_count"], 1);

        let mut saw_unhandled = false;
        while let Ok(event) = events.try_recv() {
            if let KernelEvent::Unhandled(msg) = event {
                assert_eq!(msg.parent_msg_id(), Some(stranger.msg_id()));
                saw_unhandled = true;
            }
        }
        assert!(saw_unhandled);
    }

    #[tokio::test]
    async fn wrong_channel_is_rejected() {
        let Harness { kernel, .. } = harness().await;
        let msg = kernel.create_message(MessageType::DebugRequest, Channel::Control, json!({}));
        assert!(matches!(
            kernel.send_shell_message(msg, true, true),
            Err(ClientError::InvalidChannel { .. })
        ));
    }

    #[tokio::test]
    async fn stdin_prompts_reach_the_future() {
        let Harness {
            kernel, mut peer, ..
        } = harness().await;
        peer.next_message().await;

        let mut future = kernel
            .request_execute(ExecuteRequest::new("input()"), true, None)
            .unwrap();
        let request = peer.next_message().await;
        peer.send(
            KernelMessage::new(MessageType::InputRequest, Channel::Stdin, "kernel", "", json!({"prompt": "? "}))
                .with_parent(&request.header),
        );
        let Some(FutureEvent::Stdin(prompt)) = future.next_event().await else {
            panic!("expected an input request");
        };

        kernel
            .send_input_reply(json!({"status": "ok", "value": "42"}), &prompt.header)
            .unwrap();
        let reply = peer.next_message().await;
        assert_eq!(reply.msg_type(), MessageType::InputReply);
        assert_eq!(reply.channel, Channel::Stdin);
        assert_eq!(reply.parent_msg_id(), Some(prompt.msg_id()));
    }

    #[tokio::test]
    async fn server_restart_fails_pending_futures_and_reconnects() {
        let Harness {
            kernel,
            mut peer,
            mut peers,
            ..
        } = harness().await;
        peer.next_message().await;
        let mut events = kernel.subscribe();

        let mut future = kernel
            .request_execute(ExecuteRequest::new("import time; time.sleep(100)"), true, None)
            .unwrap();
        let request = peer.next_message().await;
        peer.status(&request, "restarting");

        assert!(matches!(future.done().await, Err(ClientError::KernelRestarting)));
        let mut second = peers.recv().await.unwrap();
        let info = second.next_message().await;
        assert_eq!(info.msg_type(), MessageType::KernelInfoRequest);

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let KernelEvent::StatusChanged(status) = event {
                statuses.push(status);
            }
        }
        assert!(statuses.contains(&KernelStatus::Autorestarting));
    }

    #[tokio::test]
    async fn requested_restart_ignores_the_kernels_restarting_status() {
        let Harness {
            kernel,
            peer,
            mut peers,
            connector,
        } = harness().await;
        let mut events = kernel.subscribe();

        kernel.shared.link.command(Command::Restarting);
        kernel.wait_for_status(KernelStatus::Restarting).await.unwrap();
        let request = kernel.create_message(MessageType::ShutdownRequest, Channel::Control, json!({}));
        peer.status(&request, "restarting");

        loop {
            match events.recv().await.unwrap() {
                KernelEvent::IOPub(msg) if msg.msg_type() == MessageType::Status => break,
                KernelEvent::StatusChanged(status) => {
                    assert_ne!(status, KernelStatus::Autorestarting)
                }
                _ => {}
            }
        }
        assert_eq!(kernel.status(), KernelStatus::Restarting);
        assert_eq!(connector.attempts(), 1);
        assert!(peers.try_recv().is_err());

        kernel.reconnect();
        let mut second = peers.recv().await.unwrap();
        let info = second.next_message().await;
        assert_eq!(info.msg_type(), MessageType::KernelInfoRequest);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn dead_kernels_refuse_new_work() {
        let Harness {
            kernel, mut peer, ..
        } = harness().await;
        let info = peer.next_message().await;

        let mut future = kernel
            .request_execute(ExecuteRequest::new("1"), true, None)
            .unwrap();
        peer.next_message().await;
        peer.status(&info, "dead");

        assert!(matches!(future.done().await, Err(ClientError::KernelDead)));
        assert_eq!(kernel.status(), KernelStatus::Dead);
        assert!(matches!(
            kernel.request_execute(ExecuteRequest::new("2"), true, None),
            Err(ClientError::KernelUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_sent_while_disconnected_are_flushed_in_order() {
        let Harness {
            kernel,
            mut peer,
            mut peers,
            ..
        } = harness().await;
        peer.next_message().await;
        peer.close();

        let mut connection = kernel.watch_connection_status();
        connection
            .wait_for(|s| *s == ConnectionStatus::Connecting)
            .await
            .unwrap();
        let first = kernel.request_execute(ExecuteRequest::new("a = 1"), true, None).unwrap();
        let second = kernel.request_execute(ExecuteRequest::new("b = 2"), true, None).unwrap();

        let mut reopened = peers.recv().await.unwrap();
        assert_eq!(reopened.next_message().await.msg_type(), MessageType::KernelInfoRequest);
        assert_eq!(reopened.next_message().await.msg_id(), first.msg_id());
        assert_eq!(reopened.next_message().await.msg_id(), second.msg_id());
    }

    #[tokio::test(start_paused = true)]
    async fn first_reconnect_waits_the_base_interval() {
        let Harness {
            kernel: _kernel,
            peer,
            mut peers,
            connector,
        } = harness().await;
        let backoff = reconnect_backoff();

        let closed_at = Instant::now();
        peer.close();
        let mut reopened = peers.recv().await.unwrap();
        let waited = closed_at.elapsed();
        assert!(waited >= backoff.delay(0), "reconnected after {waited:?}");
        assert!(waited < backoff.delay(1), "reconnected after {waited:?}");
        assert_eq!(reopened.next_message().await.msg_type(), MessageType::KernelInfoRequest);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let Harness { kernel, peer, connector, .. } = harness().await;
        let mut events = kernel.subscribe();
        connector.fail_from_now_on();
        drop(peer);

        let mut connection = kernel.watch_connection_status();
        connection
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await
            .unwrap();

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, KernelEvent::ConnectionFailure(_)) {
                failures += 1;
            }
        }
        // One per failed attempt plus the final give-up.
        assert_eq!(failures, 3 + 1);
        assert_eq!(connector.attempts(), 1 + 3);
    }

    #[tokio::test]
    async fn disposing_fails_everything_pending() {
        let Harness {
            kernel, mut peer, ..
        } = harness().await;
        peer.next_message().await;
        let mut future = kernel
            .request_execute(ExecuteRequest::new("1"), true, None)
            .unwrap();
        let mut events = kernel.subscribe();

        kernel.dispose();
        assert!(matches!(future.done().await, Err(ClientError::Disposed)));
        assert!(kernel.is_disposed());
        assert!(matches!(
            kernel.create_comm("jupyter.widget", None),
            Err(ClientError::KernelUnavailable(_))
        ));
        loop {
            if let KernelEvent::Disposed = events.recv().await.unwrap() {
                break;
            }
        }
    }

    #[test]
    fn status_names_round_trip_through_execution_state() {
        for status in [
            KernelStatus::Starting,
            KernelStatus::Idle,
            KernelStatus::Busy,
            KernelStatus::Autorestarting,
            KernelStatus::Dead,
        ] {
            assert_eq!(KernelStatus::from_execution_state(status.as_str()), status);
        }
        assert_eq!(KernelStatus::from_execution_state("sleepy"), KernelStatus::Unknown);
    }
}
