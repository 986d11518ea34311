//! Correlation of one outgoing request with the messages it causes.
//!
//! The caller holds a [`KernelFuture`]; the connection worker holds the
//! matching [`FutureEntry`] in its pending map. Replies, iopub side effects
//! and stdin prompts whose `parent_header.msg_id` names the request flow
//! from the entry to the handle as [`FutureEvent`]s.

use kernel_wire::{KernelMessage, MessageType};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ClientError, Result};
use crate::kernel::Command;

/// A message routed to a request future.
#[derive(Debug, Clone)]
pub enum FutureEvent {
    /// The shell or control reply.
    Reply(KernelMessage),
    /// A side effect broadcast on iopub.
    IOPub(KernelMessage),
    /// An input prompt from the kernel.
    Stdin(KernelMessage),
}

impl FutureEvent {
    pub fn message(&self) -> &KernelMessage {
        match self {
            FutureEvent::Reply(msg) | FutureEvent::IOPub(msg) | FutureEvent::Stdin(msg) => msg,
        }
    }
}

type DoneSender = oneshot::Sender<Result<Option<KernelMessage>>>;

/// Caller side of a pending request.
///
/// Dropping the handle disposes the request: the connection forgets it and
/// discards any later messages for it.
pub struct KernelFuture {
    msg: KernelMessage,
    events: mpsc::UnboundedReceiver<FutureEvent>,
    done: Option<oneshot::Receiver<Result<Option<KernelMessage>>>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for KernelFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelFuture")
            .field("msg_id", &self.msg.msg_id())
            .field("msg_type", &self.msg.header.msg_type)
            .finish()
    }
}

impl KernelFuture {
    /// Create the handle and the worker-side entry for `msg`.
    pub(crate) fn new(
        msg: KernelMessage,
        expect_reply: bool,
        dispose_on_done: bool,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (KernelFuture, FutureEntry) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let kind = msg.msg_type();
        let entry = FutureEntry {
            expects_idle: kind == MessageType::ExecuteRequest || !expect_reply,
            got_reply: !expect_reply,
            got_idle: false,
            reply: None,
            dispose_on_done,
            events: Some(events_tx),
            done: Some(done_tx),
        };
        let handle = KernelFuture {
            msg,
            events: events_rx,
            done: Some(done_rx),
            commands,
        };
        (handle, entry)
    }

    /// The request message this future tracks.
    pub fn msg(&self) -> &KernelMessage {
        &self.msg
    }

    pub fn msg_id(&self) -> &str {
        self.msg.msg_id()
    }

    /// Next routed message. Returns `None` once the future is done (or
    /// disposed) and every queued message has been read.
    pub async fn next_event(&mut self) -> Option<FutureEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<FutureEvent> {
        self.events.try_recv().ok()
    }

    /// Wait until the request is done.
    ///
    /// Yields the reply, `None` for requests sent without expecting one, or
    /// the reason the future was disposed first. Only the first call
    /// observes the outcome; later calls return [`ClientError::Disposed`].
    pub async fn done(&mut self) -> Result<Option<KernelMessage>> {
        let Some(done) = self.done.take() else {
            return Err(ClientError::Disposed);
        };
        done.await.unwrap_or(Err(ClientError::Disposed))
    }

    /// Forget the request. Same as dropping the handle.
    pub fn dispose(self) {}
}

impl Drop for KernelFuture {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(Command::DisposeFuture(self.msg.msg_id().to_string()));
    }
}

/// Worker side of a pending request.
#[derive(Debug)]
pub(crate) struct FutureEntry {
    expects_idle: bool,
    got_reply: bool,
    got_idle: bool,
    reply: Option<KernelMessage>,
    dispose_on_done: bool,
    events: Option<mpsc::UnboundedSender<FutureEvent>>,
    done: Option<DoneSender>,
}

/// What the worker should do with an entry after routing a message to it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Routed {
    Pending,
    /// Done and should be removed from the pending map.
    Finished,
    /// Done but stays registered until disposed.
    Retained,
}

impl FutureEntry {
    pub(crate) fn on_reply(&mut self, msg: KernelMessage) -> Routed {
        if self.done.is_some() && !self.got_reply {
            self.got_reply = true;
            self.reply = Some(msg.clone());
        }
        self.emit(FutureEvent::Reply(msg));
        self.check_done()
    }

    pub(crate) fn on_iopub(&mut self, msg: KernelMessage) -> Routed {
        if msg.msg_type() == MessageType::Status
            && msg.content_str("execution_state") == Some("idle")
        {
            self.got_idle = true;
        }
        self.emit(FutureEvent::IOPub(msg));
        self.check_done()
    }

    pub(crate) fn on_stdin(&mut self, msg: KernelMessage) {
        self.emit(FutureEvent::Stdin(msg));
    }

    /// Resolve `done()` with `err` and end the event stream.
    pub(crate) fn fail(mut self, err: ClientError) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(err));
        }
    }

    fn emit(&self, event: FutureEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn check_done(&mut self) -> Routed {
        let complete = self.got_reply && (!self.expects_idle || self.got_idle);
        if !complete {
            return Routed::Pending;
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(self.reply.take()));
        }
        if self.dispose_on_done {
            self.events = None;
            Routed::Finished
        } else {
            Routed::Retained
        }
    }
}
