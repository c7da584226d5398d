//! Duplex frame transport.
//!
//! The connection only needs text frames in, close frames in both
//! directions, and a way to dial a URL. [`Socket`] captures that as a
//! `Stream + Sink` of [`Frame`]s; [`WsConnector`] provides it over
//! `tokio-tungstenite`. Ping/pong and binary frames are handled (or ignored)
//! below this layer.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::error::TransportError;

/// How long a graceful close may take before the socket is simply dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseFrame>),
}

/// A duplex frame socket.
pub trait Socket:
    Stream<Item = Result<Frame, TransportError>> + Sink<Frame, Error = TransportError> + Send + Unpin
{
}

impl<T> Socket for T where
    T: Stream<Item = Result<Frame, TransportError>>
        + Sink<Frame, Error = TransportError>
        + Send
        + Unpin
{
}

pub type BoxSocket = Box<dyn Socket>;

/// Dials a URL and returns a connected socket.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<BoxSocket, TransportError>;
}

/// Send a close frame and flush it, bounded by a grace period.
pub async fn close_socket(socket: &mut BoxSocket, code: u16, reason: &str) {
    let frame = Frame::Close(Some(CloseFrame {
        code,
        reason: reason.to_string(),
    }));
    match tokio::time::timeout(CLOSE_GRACE, socket.send(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(code, error = %e, "close frame not delivered"),
        Err(_) => debug!(code, "close frame timed out"),
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Real WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<BoxSocket, TransportError> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        debug!(url, "websocket connected");
        Ok(Box::new(WsSocket { inner: ws }))
    }
}

struct WsSocket {
    inner: WsStream,
}

impl Stream for WsSocket {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let next = match self.inner.poll_next_unpin(cx) {
                Poll::Ready(next) => next,
                Poll::Pending => return Poll::Pending,
            };
            let frame = match next {
                None => None,
                Some(Ok(Message::Text(text))) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Some(Ok(Message::Close(close))) => Some(Ok(Frame::Close(close.map(|c| {
                    CloseFrame {
                        code: u16::from(c.code),
                        reason: c.reason.as_str().to_owned(),
                    }
                })))),
                // tungstenite answers pings itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => None,
                Some(Err(e)) => Some(Err(TransportError::Read(e.to_string()))),
            };
            return Poll::Ready(frame);
        }
    }
}

impl Sink<Frame> for WsSocket {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready_unpin(cx)
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let message = match item {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
                code: CloseCode::from(c.code),
                reason: c.reason.into(),
            })),
        };
        self.inner
            .start_send_unpin(message)
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_flush_unpin(cx)
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_close_unpin(cx)
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

/// In-memory sockets for exercising the connection without a network.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;

    /// Test-side end of a [`MemorySocket`].
    #[derive(Clone)]
    pub struct SocketHandle {
        tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    impl SocketHandle {
        pub fn push_text(&self, text: impl Into<String>) {
            let _ = self.tx.send(Ok(Frame::Text(text.into())));
        }

        pub fn push_close(&self, code: u16, reason: &str) {
            let _ = self.tx.send(Ok(Frame::Close(Some(CloseFrame {
                code,
                reason: reason.to_string(),
            }))));
        }

        pub fn push_error(&self, message: &str) {
            let _ = self.tx.send(Err(TransportError::Read(message.to_string())));
        }

        pub fn sent(&self) -> Vec<Frame> {
            self.sent.lock().unwrap().clone()
        }

        /// The close frame this socket was closed with, if any.
        pub fn close_frame(&self) -> Option<CloseFrame> {
            self.sent().into_iter().find_map(|f| match f {
                Frame::Close(c) => c,
                Frame::Text(_) => None,
            })
        }
    }

    pub struct MemorySocket {
        rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    pub fn memory_socket() -> (MemorySocket, SocketHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            MemorySocket {
                rx,
                sent: sent.clone(),
            },
            SocketHandle { tx, sent },
        )
    }

    impl Stream for MemorySocket {
        type Item = Result<Frame, TransportError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.rx.poll_recv(cx)
        }
    }

    impl Sink<Frame> for MemorySocket {
        type Error = TransportError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Hands out queued sockets in order, recording the dialed URLs.
    #[derive(Default)]
    pub struct MemoryConnector {
        sockets: Mutex<VecDeque<MemorySocket>>,
        dialed: Mutex<Vec<String>>,
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a socket for the next `connect` call and return its handle.
        pub fn queue(&self) -> SocketHandle {
            let (socket, handle) = memory_socket();
            self.sockets.lock().unwrap().push_back(socket);
            handle
        }

        pub fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<BoxSocket, TransportError> {
            self.dialed.lock().unwrap().push(url.to_string());
            match self.sockets.lock().unwrap().pop_front() {
                Some(socket) => Ok(Box::new(socket)),
                None => Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "no socket queued".into(),
                }),
            }
        }
    }

    /// Standard EventSub frames.
    pub mod frames {
        use serde_json::json;

        use crate::messages::{
            CHAT_MESSAGE_TYPE, NOTIFICATION, REVOCATION, SESSION_KEEPALIVE, SESSION_RECONNECT,
            SESSION_WELCOME,
        };

        pub fn welcome(session_id: &str, keepalive_secs: u64) -> String {
            json!({
                "metadata": {"message_id": format!("w-{session_id}"), "message_type": SESSION_WELCOME},
                "payload": {"session": {"id": session_id, "keepalive_timeout_seconds": keepalive_secs}}
            })
            .to_string()
        }

        pub fn keepalive(id: &str) -> String {
            json!({
                "metadata": {"message_id": id, "message_type": SESSION_KEEPALIVE},
                "payload": {}
            })
            .to_string()
        }

        pub fn reconnect(url: &str) -> String {
            json!({
                "metadata": {"message_id": "r-1", "message_type": SESSION_RECONNECT},
                "payload": {"session": {"id": "old", "reconnect_url": url}}
            })
            .to_string()
        }

        pub fn chat(message_id: &str, login: &str, chatter: &str, text: &str) -> String {
            json!({
                "metadata": {
                    "message_id": message_id,
                    "message_type": NOTIFICATION,
                    "subscription_type": CHAT_MESSAGE_TYPE
                },
                "payload": {
                    "subscription": {
                        "id": format!("sub-{login}"),
                        "type": CHAT_MESSAGE_TYPE,
                        "status": "enabled",
                        "condition": {"broadcaster_user_id": format!("id-{login}")}
                    },
                    "event": {
                        "broadcaster_user_id": format!("id-{login}"),
                        "broadcaster_user_login": login,
                        "broadcaster_user_name": login.to_uppercase(),
                        "chatter_user_id": chatter,
                        "chatter_user_login": chatter,
                        "chatter_user_name": chatter,
                        "message_id": format!("chat-{message_id}"),
                        "message": {"text": text}
                    }
                }
            })
            .to_string()
        }

        pub fn revocation(subscription_id: &str, status: &str) -> String {
            json!({
                "metadata": {"message_id": format!("rev-{subscription_id}"), "message_type": REVOCATION},
                "payload": {"subscription": {
                    "id": subscription_id,
                    "type": CHAT_MESSAGE_TYPE,
                    "status": status
                }}
            })
            .to_string()
        }
    }
}
