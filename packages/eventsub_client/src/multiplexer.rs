//! One EventSub connection shared by many per-channel listeners.
//!
//! Each channel with at least one listener has a *broadcast*: the resolved
//! channel identity, the upstream subscription id, and the ordered listener
//! callbacks. Broadcasts are keyed by normalized login and also reachable by
//! normalized display name and numeric id.
//!
//! The connection is opened lazily by the first subscribe. When it closes,
//! every listener receives [`ChannelSignal::Closed`] and all broadcasts are
//! dropped; the next subscribe opens a fresh connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{CloseInfo, ConnectionConfig, EventHandlers, EventSubConnection};
use crate::helix::{ChannelDirectory, ChannelInfo, CreateOutcome, SubscriptionApi};
use crate::messages::{ChatMessageEvent, Notification, Revocation};
use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl From<u64> for ListenerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What a listener callback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Message(ChatMessageEvent),
    /// The shared connection closed; the listener is no longer subscribed.
    Closed { code: u16, reason: String },
    /// Upstream revoked this channel's subscription.
    Revoked { reason: String },
}

pub type SignalCallback = Arc<dyn Fn(&ChannelSignal) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed(ListenerId),
    /// No channel by that name exists.
    InvalidChannel,
    /// The upstream subscription budget is exhausted.
    Full,
}

/// Per-channel chat subscription seam used by listeners.
#[async_trait]
pub trait ChatSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
        callback: SignalCallback,
    ) -> anyhow::Result<SubscribeOutcome>;

    async fn unsubscribe(&self, listener: ListenerId);
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub eventsub_url: String,
    /// How long a fresh connection may take to deliver its welcome.
    pub welcome_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            eventsub_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
            welcome_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Trim and lower-case a channel name for use as a map key.
pub fn normalize_channel(name: &str) -> String {
    name.trim().to_lowercase()
}

struct Broadcast {
    info: ChannelInfo,
    /// `None` when upstream reported the subscription as already existing.
    subscription_id: Option<String>,
    listeners: Vec<(ListenerId, SignalCallback)>,
}

#[derive(Default)]
struct Shared {
    connection: Option<Arc<EventSubConnection>>,
    /// Bumped per opened connection so stale close handlers are ignored.
    generation: u64,
    broadcasts: HashMap<String, Broadcast>,
    aliases: HashMap<String, String>,
    listener_index: HashMap<ListenerId, String>,
    next_id: u64,
}

impl Shared {
    fn resolve_key(&self, name: &str) -> Option<String> {
        let name = normalize_channel(name);
        if self.broadcasts.contains_key(&name) {
            return Some(name);
        }
        self.aliases.get(&name).cloned()
    }

    fn add_listener(&mut self, key: &str, callback: SignalCallback) -> Option<ListenerId> {
        let broadcast = self.broadcasts.get_mut(key)?;
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        broadcast.listeners.push((id, callback));
        self.listener_index.insert(id, key.to_string());
        Some(id)
    }

    fn remove_broadcast(&mut self, key: &str) -> Option<Broadcast> {
        let broadcast = self.broadcasts.remove(key)?;
        self.aliases.retain(|_, target| target != key);
        for (id, _) in &broadcast.listeners {
            self.listener_index.remove(id);
        }
        Some(broadcast)
    }

    fn callbacks(&self, key: &str) -> Vec<SignalCallback> {
        self.broadcasts
            .get(key)
            .map(|b| b.listeners.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }
}

fn deliver(channel: &str, callbacks: &[SignalCallback], signal: &ChannelSignal) {
    for callback in callbacks {
        if let Err(e) = callback(signal) {
            warn!(channel, error = %e, "channel listener callback failed");
        }
    }
}

/// Multiplexes per-channel chat subscriptions over one EventSub connection.
pub struct SubscriptionMultiplexer {
    directory: Arc<dyn ChannelDirectory>,
    api: Arc<dyn SubscriptionApi>,
    connector: Arc<dyn Connector>,
    config: MultiplexerConfig,
    /// Serializes subscribe/unsubscribe decisions across their await points.
    decisions: tokio::sync::Mutex<()>,
    shared: Arc<Mutex<Shared>>,
}

impl SubscriptionMultiplexer {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        api: Arc<dyn SubscriptionApi>,
        connector: Arc<dyn Connector>,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            directory,
            api,
            connector,
            config,
            decisions: tokio::sync::Mutex::new(()),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Channels (normalized logins) that currently have listeners.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.shared.lock().broadcasts.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        let shared = self.shared.lock();
        shared
            .resolve_key(channel)
            .and_then(|key| shared.broadcasts.get(&key))
            .map(|b| b.listeners.len())
            .unwrap_or(0)
    }

    /// Close the shared connection. Listeners receive [`ChannelSignal::Closed`].
    pub fn shutdown(&self) {
        let connection = self.shared.lock().connection.clone();
        if let Some(connection) = connection {
            info!("closing eventsub connection");
            connection.close();
        }
    }

    /// Return the session id of a live connection, opening one if needed.
    async fn session_id(&self) -> anyhow::Result<String> {
        let existing = {
            let shared = self.shared.lock();
            shared
                .connection
                .as_ref()
                .filter(|c| !c.is_closed())
                .cloned()
        };
        let connection = match existing {
            Some(connection) => connection,
            None => self.open_connection().await?,
        };

        match connection.wait_for_session(self.config.welcome_timeout).await {
            Ok(session_id) => Ok(session_id),
            Err(e) => {
                connection.close();
                Err(e).context("eventsub session not established")
            }
        }
    }

    async fn open_connection(&self) -> anyhow::Result<Arc<EventSubConnection>> {
        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.generation
        };
        let handlers = connection_handlers(Arc::downgrade(&self.shared), generation);
        let connection = EventSubConnection::open(
            &self.config.eventsub_url,
            self.connector.clone(),
            handlers,
            self.config.connection.clone(),
        )
        .await
        .context("failed to open eventsub connection")?;
        let connection = Arc::new(connection);

        let mut shared = self.shared.lock();
        if shared.generation == generation {
            shared.connection = Some(connection.clone());
        }
        Ok(connection)
    }
}

#[async_trait]
impl ChatSubscriber for SubscriptionMultiplexer {
    async fn subscribe(
        &self,
        channel: &str,
        callback: SignalCallback,
    ) -> anyhow::Result<SubscribeOutcome> {
        let _guard = self.decisions.lock().await;

        {
            let mut shared = self.shared.lock();
            if let Some(key) = shared.resolve_key(channel) {
                if let Some(id) = shared.add_listener(&key, callback.clone()) {
                    debug!(channel = %key, listener = %id, "joined existing broadcast");
                    return Ok(SubscribeOutcome::Subscribed(id));
                }
            }
        }

        let Some(info) = self
            .directory
            .lookup(channel)
            .await
            .with_context(|| format!("failed to look up channel {channel:?}"))?
        else {
            info!(channel, "channel not found");
            return Ok(SubscribeOutcome::InvalidChannel);
        };
        let key = normalize_channel(&info.login);

        // The caller may have used an id or display name for a live broadcast.
        {
            let mut shared = self.shared.lock();
            if let Some(id) = shared.add_listener(&key, callback.clone()) {
                return Ok(SubscribeOutcome::Subscribed(id));
            }
        }

        let session_id = self.session_id().await?;
        let subscription_id = match self
            .api
            .create_chat_subscription(&info.id, &session_id)
            .await
            .with_context(|| format!("failed to subscribe to chat for {}", info.login))?
        {
            CreateOutcome::Created { id } => Some(id),
            CreateOutcome::AlreadySubscribed => None,
            CreateOutcome::Full => return Ok(SubscribeOutcome::Full),
        };

        let mut shared = self.shared.lock();
        if shared.connection.is_none() {
            // The connection closed while the subscription was being created.
            anyhow::bail!("eventsub connection closed while subscribing to {}", info.login);
        }
        shared
            .aliases
            .insert(normalize_channel(&info.display_name), key.clone());
        shared.aliases.insert(info.id.clone(), key.clone());
        info!(
            channel = %key,
            broadcaster_id = %info.id,
            subscription_id = subscription_id.as_deref().unwrap_or("-"),
            "broadcast created"
        );
        shared.broadcasts.insert(
            key.clone(),
            Broadcast {
                info,
                subscription_id,
                listeners: Vec::new(),
            },
        );
        let id = shared
            .add_listener(&key, callback)
            .context("broadcast vanished after insert")?;
        Ok(SubscribeOutcome::Subscribed(id))
    }

    async fn unsubscribe(&self, listener: ListenerId) {
        let _guard = self.decisions.lock().await;

        let revoke = {
            let mut shared = self.shared.lock();
            let Some(key) = shared.listener_index.remove(&listener) else {
                debug!(%listener, "unsubscribe for unknown listener");
                return;
            };
            let empty = match shared.broadcasts.get_mut(&key) {
                Some(broadcast) => {
                    broadcast.listeners.retain(|(id, _)| *id != listener);
                    broadcast.listeners.is_empty()
                }
                None => false,
            };
            debug!(channel = %key, %listener, "listener removed");
            if empty {
                shared.remove_broadcast(&key)
            } else {
                None
            }
        };

        let Some(broadcast) = revoke else { return };
        info!(channel = %broadcast.info.login, "last listener left; removing broadcast");
        let Some(subscription_id) = broadcast.subscription_id else {
            return;
        };
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.delete_subscription(&subscription_id).await {
                warn!(subscription_id, error = %e, "failed to delete upstream subscription");
            }
        });
    }
}

fn connection_handlers(shared: Weak<Mutex<Shared>>, generation: u64) -> EventHandlers {
    let on_notification = shared.clone();
    let on_revocation = shared.clone();
    let on_close = shared;
    EventHandlers::new()
        .on_notification(move |n| {
            route_notification(&on_notification, n);
            Ok(())
        })
        .on_revocation(move |r| {
            route_revocation(&on_revocation, r);
            Ok(())
        })
        .on_close(move |close| {
            route_close(&on_close, generation, close);
            Ok(())
        })
        .on_error(|e| {
            debug!(error = %e, "eventsub transport error");
            Ok(())
        })
}

fn route_notification(shared: &Weak<Mutex<Shared>>, notification: &Notification) {
    let Some(shared) = shared.upgrade() else { return };
    let Some(event) = notification.chat_message() else {
        debug!(kind = %notification.subscription.kind, "ignoring non-chat notification");
        return;
    };

    let (key, callbacks) = {
        let shared = shared.lock();
        let key = shared
            .resolve_key(&event.broadcaster_user_login)
            .or_else(|| shared.aliases.get(&event.broadcaster_user_id).cloned());
        let Some(key) = key else {
            debug!(channel = %event.broadcaster_user_login, "chat message for unknown broadcast");
            return;
        };
        let callbacks = shared.callbacks(&key);
        (key, callbacks)
    };

    deliver(&key, &callbacks, &ChannelSignal::Message(event));
}

fn route_revocation(shared: &Weak<Mutex<Shared>>, revocation: &Revocation) {
    let Some(shared) = shared.upgrade() else { return };
    let removed = {
        let mut shared = shared.lock();
        let by_subscription = shared
            .broadcasts
            .iter()
            .find(|(_, b)| b.subscription_id.as_deref() == Some(revocation.subscription.id.as_str()))
            .map(|(key, _)| key.clone());
        let key = by_subscription.or_else(|| {
            revocation
                .subscription
                .broadcaster_user_id()
                .and_then(|id| shared.aliases.get(id).cloned())
        });
        key.and_then(|key| shared.remove_broadcast(&key).map(|b| (key, b)))
    };

    let Some((key, broadcast)) = removed else {
        debug!(subscription_id = %revocation.subscription.id, "revocation for unknown broadcast");
        return;
    };
    warn!(channel = %key, reason = revocation.reason(), "chat subscription revoked");
    let callbacks: Vec<SignalCallback> = broadcast.listeners.into_iter().map(|(_, cb)| cb).collect();
    deliver(
        &key,
        &callbacks,
        &ChannelSignal::Revoked {
            reason: revocation.reason().to_string(),
        },
    );
}

fn route_close(shared: &Weak<Mutex<Shared>>, generation: u64, close: &CloseInfo) {
    let Some(shared) = shared.upgrade() else { return };
    let broadcasts = {
        let mut shared = shared.lock();
        if shared.generation != generation {
            return;
        }
        shared.connection = None;
        shared.aliases.clear();
        shared.listener_index.clear();
        std::mem::take(&mut shared.broadcasts)
    };

    info!(
        code = close.code,
        reason = %close.reason,
        broadcasts = broadcasts.len(),
        "eventsub connection lost; notifying listeners"
    );
    let signal = ChannelSignal::Closed {
        code: close.code,
        reason: close.reason.clone(),
    };
    for (key, broadcast) in broadcasts {
        let callbacks: Vec<SignalCallback> =
            broadcast.listeners.into_iter().map(|(_, cb)| cb).collect();
        deliver(&key, &callbacks, &signal);
    }
}
