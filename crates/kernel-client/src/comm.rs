//! Comms: named sub-channels multiplexed over a kernel connection.
//!
//! A [`Comm`] is created locally with [`KernelConnection::create_comm`] or
//! handed out by a comm target when the kernel opens one. Messages for the
//! comm's id arrive on its own event stream.
//!
//! [`KernelConnection::create_comm`]: crate::kernel::KernelConnection::create_comm

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use kernel_wire::{Channel, KernelMessage, MessageType};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::catalog::lock;
use crate::error::{ClientError, Result};
use crate::future::{FutureEvent, KernelFuture};
use crate::kernel::{Command, Link};

/// A message delivered to a comm.
#[derive(Debug, Clone)]
pub enum CommEvent {
    Msg(KernelMessage),
    /// Always the last event. Synthesized locally when this side closes.
    Close(KernelMessage),
}

/// A comm the kernel opened for a registered target.
#[derive(Debug)]
pub struct CommOpen {
    pub comm: Comm,
    /// The kernel's `comm_open` message.
    pub msg: KernelMessage,
}

type Callback = Box<dyn FnMut(&KernelMessage) + Send>;

/// Callback groups for the messages a comm request causes.
#[derive(Default)]
pub struct CommCallbacks {
    pub shell_reply: Option<Callback>,
    pub iopub_status: Option<Callback>,
    pub iopub_clear_output: Option<Callback>,
    /// `display_data`, `execute_result`, `stream` and `error`.
    pub iopub_output: Option<Callback>,
    pub input: Option<Callback>,
}

impl CommCallbacks {
    fn dispatch(&mut self, event: &FutureEvent) {
        let (slot, msg) = match event {
            FutureEvent::Reply(msg) => (&mut self.shell_reply, msg),
            FutureEvent::Stdin(msg) => (&mut self.input, msg),
            FutureEvent::IOPub(msg) => match msg.msg_type() {
                MessageType::Status => (&mut self.iopub_status, msg),
                MessageType::ClearOutput => (&mut self.iopub_clear_output, msg),
                MessageType::DisplayData
                | MessageType::ExecuteResult
                | MessageType::Stream
                | MessageType::Error => (&mut self.iopub_output, msg),
                _ => return,
            },
        };
        if let Some(callback) = slot {
            callback(msg);
        }
    }

    fn attach(mut self, mut future: KernelFuture) -> String {
        let msg_id = future.msg_id().to_string();
        tokio::spawn(async move {
            while let Some(event) = future.next_event().await {
                self.dispatch(&event);
            }
        });
        msg_id
    }
}

struct CommState {
    disposed: AtomicBool,
    /// Taken when the comm closes, which ends its event stream.
    events: Mutex<Option<mpsc::UnboundedSender<CommEvent>>>,
}

impl CommState {
    fn deliver(&self, event: CommEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    /// Deliver the final event and end the stream.
    fn finish(&self, close: Option<KernelMessage>) {
        self.disposed.store(true, Ordering::SeqCst);
        let mut events = lock(&self.events);
        if let (Some(tx), Some(msg)) = (events.as_ref(), close) {
            let _ = tx.send(CommEvent::Close(msg));
        }
        *events = None;
    }
}

/// The connection's side of a comm.
pub(crate) struct CommEntry {
    state: Arc<CommState>,
}

impl CommEntry {
    pub(crate) fn deliver(&self, event: CommEvent) {
        match event {
            CommEvent::Close(msg) => self.state.finish(Some(msg)),
            event => self.state.deliver(event),
        }
    }

    pub(crate) fn dispose(self) {
        self.state.finish(None);
    }
}

pub struct Comm {
    comm_id: String,
    target_name: String,
    link: Link,
    state: Arc<CommState>,
    events: mpsc::UnboundedReceiver<CommEvent>,
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comm")
            .field("comm_id", &self.comm_id)
            .field("target_name", &self.target_name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Comm {
    pub(crate) fn new(comm_id: &str, target_name: &str, link: Link) -> (Comm, CommEntry) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(CommState {
            disposed: AtomicBool::new(false),
            events: Mutex::new(Some(tx)),
        });
        let comm = Comm {
            comm_id: comm_id.to_string(),
            target_name: target_name.to_string(),
            link,
            state: state.clone(),
            events: rx,
        };
        (comm, CommEntry { state })
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    pub async fn next_event(&mut self) -> Option<CommEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<CommEvent> {
        self.events.try_recv().ok()
    }

    /// Send `comm_open` for this comm.
    pub fn open(
        &self,
        data: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<KernelFuture> {
        let content = json!({
            "comm_id": self.comm_id,
            "target_name": self.target_name,
            "data": data,
        });
        let msg = self.build(MessageType::CommOpen, content, metadata, buffers)?;
        self.link.send(msg, false, true)
    }

    /// Send a `comm_msg`.
    pub fn send(
        &self,
        data: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
        dispose_on_done: bool,
    ) -> Result<KernelFuture> {
        let content = json!({"comm_id": self.comm_id, "data": data});
        let msg = self.build(MessageType::CommMsg, content, metadata, buffers)?;
        self.link.send(msg, false, dispose_on_done)
    }

    /// Send `comm_close`. A matching [`CommEvent::Close`] is already on the
    /// comm's event stream when this returns, and every later call fails with
    /// [`ClientError::CommDisposed`].
    pub fn close(
        &self,
        data: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<KernelFuture> {
        let content = json!({"comm_id": self.comm_id, "data": data});
        let msg = self.build(MessageType::CommClose, content, metadata, buffers)?;
        let (future, entry) = self.link.prepare(&msg, false, true);
        let local = self
            .link
            .message(MessageType::CommClose, Channel::IOPub, msg.content.clone())
            .with_parent(&msg.header);
        self.state.finish(Some(local));
        self.link.command(Command::CloseComm { msg, entry });
        Ok(future)
    }

    /// [`open`](Self::open), routing what the request causes to `callbacks`.
    /// Returns the request's `msg_id`.
    pub fn open_with_callbacks(
        &self,
        data: Value,
        callbacks: CommCallbacks,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<String> {
        Ok(callbacks.attach(self.open(data, metadata, buffers)?))
    }

    pub fn send_with_callbacks(
        &self,
        data: Value,
        callbacks: CommCallbacks,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<String> {
        Ok(callbacks.attach(self.send(data, metadata, buffers, true)?))
    }

    pub fn close_with_callbacks(
        &self,
        data: Value,
        callbacks: CommCallbacks,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<String> {
        Ok(callbacks.attach(self.close(data, metadata, buffers)?))
    }

    /// Forget the comm locally without telling the kernel.
    pub fn dispose(&self) {
        if !self.state.disposed.swap(true, Ordering::SeqCst) {
            self.link.command(Command::DisposeComm(self.comm_id.clone()));
        }
    }

    fn build(
        &self,
        kind: MessageType,
        content: Value,
        metadata: Option<Value>,
        buffers: Vec<Bytes>,
    ) -> Result<KernelMessage> {
        if self.is_disposed() {
            return Err(ClientError::CommDisposed {
                comm_id: self.comm_id.clone(),
            });
        }
        self.link.check_available()?;
        let mut msg = self
            .link
            .message(kind, Channel::Shell, content)
            .with_buffers(buffers);
        if let Some(metadata) = metadata {
            msg = msg.with_metadata(metadata);
        }
        Ok(msg)
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        self.dispose();
    }
}
