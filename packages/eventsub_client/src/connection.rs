//! EventSub WebSocket connection.
//!
//! One [`EventSubConnection`] owns one upstream socket and a background task
//! that reads it. The task classifies each frame and dispatches it to the
//! [`EventHandlers`] registered at construction time.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting --welcome--> Connected --session_reconnect--> Reconnecting
//!     |                      ^  |                              |
//!     |                      |  +--close/keepalive expiry--+   |
//!     |                      +-------welcome on new socket-|---+
//!     +------------------------------------------------> Closed
//! ```
//!
//! A server-directed reconnect opens a second socket. The swap only happens
//! once that socket delivers a `session_welcome`; until then the old socket
//! keeps delivering notifications. Any other first message abandons the swap.
//!
//! Closing is terminal. The connection never redials on its own except for the
//! server-directed path; owners watch the close handlers and build a new one.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::messages::{Notification, Revocation, ServerMessage, Welcome, parse_message};
use crate::transport::{BoxSocket, Connector, Frame, close_socket};

/// Normal closure requested by the owner.
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Peer vanished without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;
/// Close frame carried no status code.
pub const NO_STATUS_CODE: u16 = 1005;
/// The keep-alive window elapsed without traffic.
pub const KEEPALIVE_EXPIRED_CODE: u16 = 4900;
/// The socket was replaced by the one named in a `session_reconnect`.
pub const SESSION_MIGRATED_CODE: u16 = 4901;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected { session_id: String },
    /// A second socket is being brought up; the first is still live.
    Reconnecting { session_id: String },
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

type Handler<T> = Box<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Callbacks invoked by the connection task, grouped by event kind.
///
/// Handlers of one kind run in registration order. A handler that returns an
/// error is logged and skipped; the remaining handlers still run.
#[derive(Default)]
pub struct EventHandlers {
    welcome: Vec<Handler<Welcome>>,
    notification: Vec<Handler<Notification>>,
    revocation: Vec<Handler<Revocation>>,
    close: Vec<Handler<CloseInfo>>,
    error: Vec<Handler<TransportError>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_welcome(
        mut self,
        f: impl Fn(&Welcome) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.welcome.push(Box::new(f));
        self
    }

    pub fn on_notification(
        mut self,
        f: impl Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.notification.push(Box::new(f));
        self
    }

    pub fn on_revocation(
        mut self,
        f: impl Fn(&Revocation) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.revocation.push(Box::new(f));
        self
    }

    pub fn on_close(
        mut self,
        f: impl Fn(&CloseInfo) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.close.push(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&TransportError) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.error.push(Box::new(f));
        self
    }
}

fn dispatch<T>(kind: &'static str, handlers: &[Handler<T>], value: &T) {
    for (index, handler) in handlers.iter().enumerate() {
        if let Err(e) = handler(value) {
            warn!(kind, handler = index, error = %e, "eventsub handler failed");
        }
    }
}

/// Tunables for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How often the keep-alive window is checked.
    pub keepalive_check_interval: Duration,
    /// Used when a welcome omits `keepalive_timeout_seconds`.
    pub default_keepalive_timeout: Duration,
    /// Number of recent notification ids remembered for dedupe.
    pub dedupe_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_check_interval: Duration::from_secs(10),
            default_keepalive_timeout: Duration::from_secs(10),
            dedupe_capacity: 256,
        }
    }
}

/// Handle to a live EventSub connection. Dropping it closes the connection.
pub struct EventSubConnection {
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl EventSubConnection {
    /// Dial `url` and start reading. The returned connection is `Connecting`
    /// until the server's welcome arrives.
    pub async fn open(
        url: &str,
        connector: Arc<dyn Connector>,
        handlers: EventHandlers,
        config: ConnectionConfig,
    ) -> Result<Self, TransportError> {
        let socket = connector.connect(url).await?;
        info!(url, "eventsub socket opened");
        Ok(Self::start(socket, connector, handlers, config))
    }

    /// Start reading an already-connected socket.
    pub fn start(
        socket: BoxSocket,
        connector: Arc<dyn Connector>,
        handlers: EventHandlers,
        config: ConnectionConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let actor = ConnectionActor {
            primary: socket,
            migration: None,
            connector,
            handlers,
            state_tx,
            session_id: None,
            keepalive_timeout: None,
            last_activity: Instant::now(),
            recent_ids: RecentIds::new(config.dedupe_capacity),
            cancel: cancel.clone(),
            config,
        };
        tokio::spawn(actor.run());

        Self {
            state: state_rx,
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        match &*self.state.borrow() {
            ConnectionState::Connected { session_id }
            | ConnectionState::Reconnecting { session_id } => Some(session_id.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Closed { .. })
    }

    /// Wait until the welcome handshake has completed and return the session id.
    pub async fn wait_for_session(&self, timeout: Duration) -> Result<String, TransportError> {
        let mut rx = self.state.clone();
        let wait = async move {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected { session_id }
                    | ConnectionState::Reconnecting { session_id } => return Ok(session_id),
                    ConnectionState::Closed { .. } => return Err(TransportError::Closed),
                    ConnectionState::Connecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::WelcomeTimeout)?
    }

    /// Close the socket with a normal close code. Close handlers still run.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventSubConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bounded memory of recently seen notification ids.
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// The second socket during a server-directed reconnect.
enum Migration {
    Dialing(BoxFuture<'static, Result<BoxSocket, TransportError>>),
    AwaitingWelcome(BoxSocket),
}

enum MigrationEvent {
    Dialed(Result<BoxSocket, TransportError>),
    Frame(Option<Result<Frame, TransportError>>),
}

async fn next_migration_event(migration: &mut Option<Migration>) -> MigrationEvent {
    match migration {
        Some(Migration::Dialing(dial)) => MigrationEvent::Dialed(dial.await),
        Some(Migration::AwaitingWelcome(socket)) => MigrationEvent::Frame(socket.next().await),
        None => std::future::pending().await,
    }
}

struct ConnectionActor {
    primary: BoxSocket,
    migration: Option<Migration>,
    connector: Arc<dyn Connector>,
    handlers: EventHandlers,
    state_tx: watch::Sender<ConnectionState>,
    session_id: Option<String>,
    keepalive_timeout: Option<Duration>,
    last_activity: Instant,
    recent_ids: RecentIds,
    cancel: CancellationToken,
    config: ConnectionConfig,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut keepalive_check = tokio::time::interval_at(
            Instant::now() + self.config.keepalive_check_interval,
            self.config.keepalive_check_interval,
        );
        keepalive_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let close = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close_socket(&mut self.primary, NORMAL_CLOSE_CODE, "client closing").await;
                    break CloseInfo::new(NORMAL_CLOSE_CODE, "client closing");
                }

                frame = self.primary.next() => match frame {
                    None => break CloseInfo::new(ABNORMAL_CLOSE_CODE, "socket ended"),
                    Some(Ok(Frame::Close(frame))) => {
                        break match frame {
                            Some(f) => CloseInfo::new(f.code, f.reason),
                            None => CloseInfo::new(NO_STATUS_CODE, ""),
                        };
                    }
                    Some(Ok(Frame::Text(text))) => self.handle_text(&text),
                    Some(Err(e)) => {
                        warn!(error = %e, "eventsub socket error");
                        dispatch("error", &self.handlers.error, &e);
                    }
                },

                event = next_migration_event(&mut self.migration), if self.migration.is_some() => {
                    self.handle_migration_event(event).await;
                }

                _ = keepalive_check.tick() => {
                    if self.keepalive_expired() {
                        warn!(
                            session_id = self.session_id.as_deref().unwrap_or("-"),
                            "eventsub keepalive expired"
                        );
                        close_socket(&mut self.primary, KEEPALIVE_EXPIRED_CODE, "keepalive timeout").await;
                        break CloseInfo::new(KEEPALIVE_EXPIRED_CODE, "keepalive timeout");
                    }
                }
            }
        };

        if let Some(Migration::AwaitingWelcome(mut socket)) = self.migration.take() {
            close_socket(&mut socket, NORMAL_CLOSE_CODE, "primary closed").await;
        }

        info!(code = close.code, reason = %close.reason, "eventsub connection closed");
        self.state_tx.send_replace(ConnectionState::Closed {
            code: close.code,
            reason: close.reason.clone(),
        });
        dispatch("close", &self.handlers.close, &close);
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn keepalive_expired(&self) -> bool {
        match self.keepalive_timeout {
            Some(timeout) => self.last_activity.elapsed() > timeout,
            None => false,
        }
    }

    fn handle_text(&mut self, text: &str) {
        let (metadata, message) = match parse_message(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "dropping malformed eventsub frame");
                return;
            }
        };

        match message {
            ServerMessage::Welcome(welcome) => self.apply_welcome(welcome),
            ServerMessage::Keepalive => {
                self.touch();
                debug!("eventsub keepalive");
            }
            ServerMessage::Notification(notification) => {
                self.touch();
                if !self.recent_ids.insert(&notification.message_id) {
                    debug!(message_id = %notification.message_id, "dropping duplicate notification");
                    return;
                }
                dispatch("notification", &self.handlers.notification, &notification);
            }
            ServerMessage::Reconnect(reconnect) => self.begin_migration(reconnect.reconnect_url),
            ServerMessage::Revocation(revocation) => {
                info!(
                    subscription_id = %revocation.subscription.id,
                    reason = revocation.reason(),
                    "eventsub subscription revoked"
                );
                dispatch("revocation", &self.handlers.revocation, &revocation);
            }
            ServerMessage::Unknown(kind) => {
                warn!(message_type = %kind, message_id = %metadata.message_id, "dropping unknown eventsub message");
            }
        }
    }

    fn apply_welcome(&mut self, welcome: Welcome) {
        self.session_id = Some(welcome.session_id.clone());
        self.keepalive_timeout = Some(
            welcome
                .keepalive_timeout
                .unwrap_or(self.config.default_keepalive_timeout),
        );
        self.touch();
        info!(
            session_id = %welcome.session_id,
            keepalive = ?self.keepalive_timeout,
            "eventsub session welcomed"
        );
        self.state_tx.send_replace(ConnectionState::Connected {
            session_id: welcome.session_id.clone(),
        });
        dispatch("welcome", &self.handlers.welcome, &welcome);
    }

    fn begin_migration(&mut self, url: String) {
        if self.migration.is_some() {
            debug!(url, "reconnect already in progress; ignoring");
            return;
        }
        info!(url, "eventsub reconnect requested");
        if let Some(session_id) = self.session_id.clone() {
            self.state_tx
                .send_replace(ConnectionState::Reconnecting { session_id });
        }
        let connector = self.connector.clone();
        self.migration = Some(Migration::Dialing(Box::pin(async move {
            connector.connect(&url).await
        })));
    }

    async fn handle_migration_event(&mut self, event: MigrationEvent) {
        match event {
            MigrationEvent::Dialed(Ok(socket)) => {
                debug!("reconnect socket dialed; awaiting welcome");
                self.migration = Some(Migration::AwaitingWelcome(socket));
            }
            MigrationEvent::Dialed(Err(e)) => {
                warn!(error = %e, "reconnect dial failed; staying on current socket");
                dispatch("error", &self.handlers.error, &e);
                self.abandon_migration().await;
            }
            MigrationEvent::Frame(Some(Ok(Frame::Text(text)))) => match parse_message(&text) {
                Ok((_, ServerMessage::Welcome(welcome))) => self.complete_migration(welcome).await,
                Ok((metadata, _)) => {
                    warn!(
                        message_type = %metadata.message_type,
                        "reconnect socket did not start with a welcome; abandoning"
                    );
                    self.abandon_migration().await;
                }
                Err(e) => {
                    warn!(error = %e, "malformed first frame on reconnect socket; abandoning");
                    self.abandon_migration().await;
                }
            },
            MigrationEvent::Frame(Some(Ok(Frame::Close(frame)))) => {
                warn!(?frame, "reconnect socket closed before welcome; abandoning");
                self.abandon_migration().await;
            }
            MigrationEvent::Frame(Some(Err(e))) => {
                warn!(error = %e, "reconnect socket error before welcome; abandoning");
                self.abandon_migration().await;
            }
            MigrationEvent::Frame(None) => {
                warn!("reconnect socket ended before welcome; abandoning");
                self.abandon_migration().await;
            }
        }
    }

    async fn complete_migration(&mut self, welcome: Welcome) {
        let Some(Migration::AwaitingWelcome(socket)) = self.migration.take() else {
            return;
        };
        let mut old = std::mem::replace(&mut self.primary, socket);
        close_socket(&mut old, SESSION_MIGRATED_CODE, "session migrated").await;
        drop(old);
        info!(session_id = %welcome.session_id, "eventsub reconnect complete");
        self.apply_welcome(welcome);
    }

    async fn abandon_migration(&mut self) {
        if let Some(Migration::AwaitingWelcome(mut socket)) = self.migration.take() {
            close_socket(&mut socket, NORMAL_CLOSE_CODE, "reconnect abandoned").await;
        }
        self.migration = None;
        if let Some(session_id) = self.session_id.clone() {
            self.state_tx
                .send_replace(ConnectionState::Connected { session_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::testing::{MemoryConnector, SocketHandle, frames, memory_socket};
    use crate::transport::CloseFrame;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_handlers(log: &Log) -> EventHandlers {
        let welcome = log.clone();
        let notification = log.clone();
        let revocation = log.clone();
        let close = log.clone();
        let error = log.clone();
        EventHandlers::new()
            .on_welcome(move |w| {
                welcome.lock().unwrap().push(format!("welcome:{}", w.session_id));
                Ok(())
            })
            .on_notification(move |n| {
                let text = n.chat_message().map(|c| c.message.text).unwrap_or_default();
                notification.lock().unwrap().push(format!("notification:{text}"));
                Ok(())
            })
            .on_revocation(move |r| {
                revocation.lock().unwrap().push(format!("revocation:{}", r.reason()));
                Ok(())
            })
            .on_close(move |c| {
                close.lock().unwrap().push(format!("close:{}", c.code));
                Ok(())
            })
            .on_error(move |e| {
                error.lock().unwrap().push(format!("error:{e}"));
                Ok(())
            })
    }

    fn start(log: &Log) -> (EventSubConnection, SocketHandle, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let (socket, handle) = memory_socket();
        let conn = EventSubConnection::start(
            Box::new(socket),
            connector.clone(),
            recording_handlers(log),
            ConnectionConfig::default(),
        );
        (conn, handle, connector)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn welcome_establishes_session() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        socket.push_text(frames::welcome("sess-1", 10));
        let session = conn.wait_for_session(Duration::from_secs(1)).await.unwrap();

        assert_eq!(session, "sess-1");
        assert_eq!(conn.session_id().as_deref(), Some("sess-1"));
        assert_eq!(entries(&log), vec!["welcome:sess-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_session_times_out_without_welcome() {
        let log = Log::default();
        let (conn, _socket, _) = start(&log);
        let err = conn
            .wait_for_session(Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::WelcomeTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_does_not_block_later_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let second = seen.clone();
        let handlers = EventHandlers::new()
            .on_notification(|_| anyhow::bail!("boom"))
            .on_notification(move |n| {
                second.lock().unwrap().push(n.message_id.clone());
                Ok(())
            });
        let (socket, handle) = memory_socket();
        let conn = EventSubConnection::start(
            Box::new(socket),
            Arc::new(MemoryConnector::new()),
            handlers,
            ConnectionConfig::default(),
        );

        handle.push_text(frames::welcome("s", 10));
        handle.push_text(frames::chat("n-1", "streamer", "u1", "item A"));
        handle.push_text(frames::chat("n-2", "streamer", "u1", "item B"));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["n-1", "n-2"]);
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_notifications_are_dropped() {
        let log = Log::default();
        let (_conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        socket.push_text(frames::chat("n-1", "streamer", "u1", "first"));
        socket.push_text(frames::chat("n-1", "streamer", "u1", "first"));
        settle().await;

        assert_eq!(entries(&log), vec!["welcome:s", "notification:first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_unknown_frames_are_ignored() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        socket.push_text("{not json");
        socket.push_text(
            serde_json::json!({"metadata": {"message_id": "x", "message_type": "mystery"}})
                .to_string(),
        );
        socket.push_text(frames::chat("n-1", "streamer", "u1", "still here"));
        settle().await;

        assert_eq!(entries(&log), vec!["welcome:s", "notification:still here"]);
        assert_eq!(
            conn.state(),
            ConnectionState::Connected {
                session_id: "s".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn socket_errors_reach_error_handlers_and_keep_connection() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        socket.push_error("hiccup");
        settle().await;

        let log = entries(&log);
        assert_eq!(log.len(), 2);
        assert!(log[1].starts_with("error:"));
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_expiry_closes_with_distinct_code() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        settle().await;

        tokio::time::sleep(Duration::from_secs(25)).await;

        assert!(conn.is_closed());
        assert_eq!(
            socket.close_frame(),
            Some(CloseFrame {
                code: KEEPALIVE_EXPIRED_CODE,
                reason: "keepalive timeout".into()
            })
        );
        assert_eq!(entries(&log).last().unwrap(), "close:4900");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalives_hold_the_connection_open() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        settle().await;

        for i in 0..6 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            socket.push_text(frames::keepalive(&format!("k-{i}")));
        }
        settle().await;

        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_swaps_to_new_socket() {
        let log = Log::default();
        let (conn, old, connector) = start(&log);
        let new = connector.queue();

        old.push_text(frames::welcome("sess-1", 10));
        old.push_text(frames::reconnect("wss://reconnect.example/ws"));
        settle().await;
        assert_eq!(connector.dialed(), vec!["wss://reconnect.example/ws"]);
        assert_eq!(
            conn.state(),
            ConnectionState::Reconnecting {
                session_id: "sess-1".into()
            }
        );

        new.push_text(frames::welcome("sess-2", 10));
        settle().await;

        assert_eq!(conn.session_id().as_deref(), Some("sess-2"));
        assert_eq!(
            old.close_frame().map(|c| c.code),
            Some(SESSION_MIGRATED_CODE)
        );

        // Only the promoted socket is read from now on.
        old.push_text(frames::chat("n-old", "streamer", "u1", "old"));
        new.push_text(frames::chat("n-new", "streamer", "u1", "new"));
        new.push_text(frames::chat("n-new", "streamer", "u1", "new"));
        settle().await;

        assert_eq!(
            entries(&log),
            vec!["welcome:sess-1", "welcome:sess-2", "notification:new"]
        );
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_without_welcome_is_abandoned() {
        let log = Log::default();
        let (conn, old, connector) = start(&log);
        let new = connector.queue();

        old.push_text(frames::welcome("sess-1", 10));
        old.push_text(frames::reconnect("wss://reconnect.example/ws"));
        settle().await;
        new.push_text(frames::keepalive("k-1"));
        settle().await;

        assert_eq!(new.close_frame().map(|c| c.code), Some(NORMAL_CLOSE_CODE));
        assert!(old.close_frame().is_none());
        assert_eq!(
            conn.state(),
            ConnectionState::Connected {
                session_id: "sess-1".into()
            }
        );

        old.push_text(frames::chat("n-1", "streamer", "u1", "old still works"));
        settle().await;
        assert_eq!(
            entries(&log),
            vec!["welcome:sess-1", "notification:old still works"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_dial_keeps_old_socket() {
        let log = Log::default();
        let (conn, old, _connector) = start(&log);
        old.push_text(frames::welcome("sess-1", 10));
        old.push_text(frames::reconnect("wss://nowhere/ws"));
        settle().await;

        assert!(!conn.is_closed());
        assert!(entries(&log).iter().any(|e| e.starts_with("error:")));
        assert_eq!(conn.session_id().as_deref(), Some("sess-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_reaches_revocation_handlers_only() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        socket.push_text(frames::revocation("sub-1", "authorization_revoked"));
        settle().await;

        assert_eq!(
            entries(&log),
            vec!["welcome:s", "revocation:authorization_revoked"]
        );
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_is_reported_with_its_code() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        socket.push_close(4003, "connection unused");
        settle().await;

        assert_eq!(
            conn.state(),
            ConnectionState::Closed {
                code: 4003,
                reason: "connection unused".into()
            }
        );
        assert_eq!(entries(&log).last().unwrap(), "close:4003");
    }

    #[tokio::test(start_paused = true)]
    async fn owner_close_sends_normal_close() {
        let log = Log::default();
        let (conn, socket, _) = start(&log);
        socket.push_text(frames::welcome("s", 10));
        settle().await;

        conn.close();
        settle().await;

        assert_eq!(socket.close_frame().map(|c| c.code), Some(NORMAL_CLOSE_CODE));
        assert_eq!(entries(&log).last().unwrap(), "close:1000");
    }

    #[test]
    fn recent_ids_evicts_oldest() {
        let mut ids = RecentIds::new(2);
        assert!(ids.insert("a"));
        assert!(ids.insert("b"));
        assert!(!ids.insert("a"));
        assert!(ids.insert("c"));
        assert!(ids.insert("a"));
    }
}
