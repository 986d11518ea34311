//! The duplex frame channel between a kernel connection and the server.
//!
//! A [`Connector`] opens one transport per connection attempt. The kernel
//! connection only sees a pair of channels: frames it writes to
//! [`TransportHandle::outgoing`] and [`TransportEvent`]s it reads from
//! [`TransportHandle::incoming`]. Dropping the outgoing sender closes the
//! socket.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use kernel_wire::WireFrame;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{ClientError, Result};
use crate::server::ServerConnection;

/// Something that happened on an open transport.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(WireFrame),
    /// The socket is gone. Always the last event of a transport.
    Closed { reason: Option<String> },
    /// A read failed; a `Closed` follows.
    Error(String),
}

/// Both ends of one open transport.
pub struct TransportHandle {
    pub outgoing: mpsc::UnboundedSender<WireFrame>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// A connected in-memory pair: the handle for the client and the far end
    /// for whoever plays the server.
    pub fn pair() -> (TransportHandle, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            TransportHandle {
                outgoing: out_tx,
                incoming: in_rx,
            },
            TransportPeer {
                received: out_rx,
                events: in_tx,
            },
        )
    }
}

/// The server side of an in-memory transport.
pub struct TransportPeer {
    /// Frames the client sent.
    pub received: mpsc::UnboundedReceiver<WireFrame>,
    /// Events delivered to the client.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// Opens transports to a kernel.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        kernel_id: &str,
        client_id: &str,
    ) -> BoxFuture<'static, Result<TransportHandle>>;
}

/// Connects to `api/kernels/{id}/channels` on the Jupyter server.
pub struct WebSocketConnector {
    server: Arc<ServerConnection>,
}

impl WebSocketConnector {
    pub fn new(server: Arc<ServerConnection>) -> Self {
        Self { server }
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        kernel_id: &str,
        client_id: &str,
    ) -> BoxFuture<'static, Result<TransportHandle>> {
        let settings = self.server.settings();
        let url = settings.kernel_channels_url(kernel_id, client_id);
        let token = settings.token.clone();
        Box::pin(async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            if let Some(token) = token {
                let value = HeaderValue::from_str(&format!("token {token}"))
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            debug!("[transport] Connecting to {}", redact(&url));
            let (stream, _) = connect_async(request)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            info!("[transport] Connected to {}", redact(&url));
            Ok(spawn_pumps(stream))
        })
    }
}

fn spawn_pumps<S>(stream: tokio_tungstenite::WebSocketStream<S>) -> TransportHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (handle, peer) = TransportHandle::pair();
    let TransportPeer {
        mut received,
        events,
    } = peer;

    tokio::spawn(async move {
        while let Some(frame) = received.recv().await {
            let message = match frame {
                WireFrame::Text(text) => Message::Text(text),
                WireFrame::Binary(data) => Message::Binary(data.to_vec()),
            };
            if let Err(e) = sink.send(message).await {
                warn!("[transport] Write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        let mut reason = None;
        while let Some(item) = source.next().await {
            let event = match item {
                Ok(Message::Text(text)) => TransportEvent::Frame(WireFrame::Text(text)),
                Ok(Message::Binary(data)) => {
                    TransportEvent::Frame(WireFrame::Binary(bytes::Bytes::from(data)))
                }
                Ok(Message::Close(frame)) => {
                    reason = frame.map(|f| f.reason.to_string());
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
        let _ = events.send(TransportEvent::Closed { reason });
    });

    handle
}

fn redact(url: &str) -> &str {
    match url.find("&token=") {
        Some(at) => &url[..at],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_frames_both_ways() {
        let (mut handle, mut peer) = TransportHandle::pair();
        handle
            .outgoing
            .send(WireFrame::Text("ping".into()))
            .unwrap();
        assert_eq!(
            peer.received.recv().await,
            Some(WireFrame::Text("ping".into()))
        );

        peer.events
            .send(TransportEvent::Closed { reason: None })
            .unwrap();
        assert!(matches!(
            handle.incoming.recv().await,
            Some(TransportEvent::Closed { reason: None })
        ));
    }

    #[test]
    fn tokens_are_not_logged() {
        assert_eq!(
            redact("ws://h/api/kernels/k/channels?session_id=s&token=secret"),
            "ws://h/api/kernels/k/channels?session_id=s"
        );
    }
}
