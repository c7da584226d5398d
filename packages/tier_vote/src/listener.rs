//! Keeps channels subscribed while something is interested in them.
//!
//! Callers `listen()` to a channel and keep calling it as a heartbeat. Each
//! live channel has a registration with one worker task that applies chat
//! messages to the channel's editor in arrival order and checks the
//! heartbeat. A stale heartbeat unsubscribes; a closed or revoked
//! subscription just drops the registration so the next `listen()` starts
//! over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use eventsub_client::{
    ChannelSignal, ChatMessageEvent, ChatSubscriber, ListenerId, SignalCallback, SubscribeOutcome,
    normalize_channel,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::StateCache;
use crate::metrics::IngestMetrics;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How often each registration checks its heartbeat.
    pub check_interval: Duration,
    /// A registration without a heartbeat for this long is torn down.
    pub heartbeat_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    Listening,
    InvalidChannel,
    Full,
}

enum RegistrationEvent {
    Message(ChatMessageEvent),
    Ended(String),
}

#[derive(Clone, Copy)]
enum Teardown {
    /// The subscription is already gone upstream.
    Ended,
    /// No heartbeat within the timeout; unsubscribe.
    Expired(Duration),
}

struct Registration {
    /// Distinguishes this registration from later ones for the same channel.
    serial: u64,
    listener_id: ListenerId,
    last_heartbeat: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

struct Shared {
    subscriber: Arc<dyn ChatSubscriber>,
    cache: Arc<StateCache>,
    metrics: Arc<IngestMetrics>,
    config: ListenerConfig,
    registrations: tokio::sync::Mutex<HashMap<String, Registration>>,
    next_serial: AtomicU64,
}

#[derive(Clone)]
pub struct ChannelListener {
    shared: Arc<Shared>,
}

impl ChannelListener {
    pub fn new(
        subscriber: Arc<dyn ChatSubscriber>,
        cache: Arc<StateCache>,
        metrics: Arc<IngestMetrics>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscriber,
                cache,
                metrics,
                config,
                registrations: tokio::sync::Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    /// Start listening to `channel`, or refresh its heartbeat if already
    /// listening.
    pub async fn listen(&self, channel: &str) -> Result<ListenOutcome> {
        let key = normalize_channel(channel);
        if key.is_empty() {
            return Ok(ListenOutcome::InvalidChannel);
        }

        let mut registrations = self.shared.registrations.lock().await;
        if let Some(registration) = registrations.get(&key) {
            *registration.last_heartbeat.lock() = Instant::now();
            debug!(channel = %key, "heartbeat");
            return Ok(ListenOutcome::Listening);
        }

        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = match self
            .shared
            .subscriber
            .subscribe(&key, signal_callback(tx, self.shared.metrics.clone()))
            .await?
        {
            SubscribeOutcome::Subscribed(id) => id,
            SubscribeOutcome::InvalidChannel => return Ok(ListenOutcome::InvalidChannel),
            SubscribeOutcome::Full => return Ok(ListenOutcome::Full),
        };

        let last_heartbeat = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        registrations.insert(
            key.clone(),
            Registration {
                serial,
                listener_id,
                last_heartbeat: last_heartbeat.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(registrations);

        info!(channel = %key, listener = %listener_id, "listening");
        tokio::spawn(run_registration(
            Arc::downgrade(&self.shared),
            key,
            serial,
            rx,
            last_heartbeat,
            cancel,
        ));
        Ok(ListenOutcome::Listening)
    }

    pub async fn is_listening(&self, channel: &str) -> bool {
        self.shared
            .registrations
            .lock()
            .await
            .contains_key(&normalize_channel(channel))
    }

    /// Channels with a live registration.
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .shared
            .registrations
            .lock()
            .await
            .keys()
            .cloned()
            .collect();
        channels.sort();
        channels
    }
}

fn signal_callback(
    tx: mpsc::UnboundedSender<RegistrationEvent>,
    metrics: Arc<IngestMetrics>,
) -> SignalCallback {
    Arc::new(move |signal: &ChannelSignal| {
        metrics.signal_received();
        let event = match signal {
            ChannelSignal::Message(message) => RegistrationEvent::Message(message.clone()),
            ChannelSignal::Closed { code, reason } => {
                RegistrationEvent::Ended(format!("connection closed ({code}: {reason})"))
            }
            ChannelSignal::Revoked { reason } => {
                RegistrationEvent::Ended(format!("subscription revoked ({reason})"))
            }
        };
        // A closed receiver means the registration is already gone.
        let _ = tx.send(event);
        Ok(())
    })
}

async fn run_registration(
    shared: Weak<Shared>,
    key: String,
    serial: u64,
    mut rx: mpsc::UnboundedReceiver<RegistrationEvent>,
    last_heartbeat: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    let (check_interval, heartbeat_timeout) = match shared.upgrade() {
        Some(s) => (s.config.check_interval, s.config.heartbeat_timeout),
        None => return,
    };
    let mut check = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = rx.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                match event {
                    Some(RegistrationEvent::Message(message)) => shared.apply_vote(&key, message).await,
                    Some(RegistrationEvent::Ended(reason)) => {
                        info!(channel = %key, %reason, "subscription ended");
                        shared.teardown(&key, serial, Teardown::Ended).await;
                        break;
                    }
                    None => break,
                }
            }

            _ = check.tick() => {
                let idle = last_heartbeat.lock().elapsed();
                if idle > heartbeat_timeout {
                    let Some(shared) = shared.upgrade() else { break };
                    if shared.teardown(&key, serial, Teardown::Expired(heartbeat_timeout)).await {
                        info!(channel = %key, idle_secs = idle.as_secs(), "heartbeat expired");
                        break;
                    }
                }
            }
        }
    }
    debug!(channel = %key, "registration task stopped");
}

impl Shared {
    async fn apply_vote(&self, key: &str, message: ChatMessageEvent) {
        let editor = match self.cache.get_editor(&message.broadcaster_user_id).await {
            Ok(editor) => editor,
            Err(e) => {
                warn!(channel = %key, error = %e, "no editor for chat message");
                return;
            }
        };
        match editor.vote(&message.chatter_user_id, &message.message.text) {
            Ok(()) => {
                self.metrics.vote_accepted();
                debug!(channel = %key, voter = %message.chatter_user_login, "vote accepted");
            }
            Err(rejection) => {
                self.metrics.vote_rejected();
                debug!(channel = %key, voter = %message.chatter_user_login, %rejection, "vote rejected");
            }
        }
    }

    /// Remove the registration started as `serial`, if it is still the live
    /// one. Runs at most once per registration. Returns false only when an
    /// expiry lost the race to a fresh heartbeat and the registration stays.
    async fn teardown(&self, key: &str, serial: u64, reason: Teardown) -> bool {
        let removed = {
            let mut registrations = self.registrations.lock().await;
            match registrations.get(key) {
                Some(r) if r.serial == serial => {
                    if let Teardown::Expired(timeout) = reason {
                        if r.last_heartbeat.lock().elapsed() <= timeout {
                            return false;
                        }
                    }
                    registrations.remove(key)
                }
                _ => None,
            }
        };
        let Some(registration) = removed else {
            debug!(channel = %key, serial, "registration already gone");
            return true;
        };
        registration.cancel.cancel();
        if matches!(reason, Teardown::Expired(_)) {
            self.subscriber.unsubscribe(registration.listener_id).await;
        }
        info!(channel = %key, listener = %registration.listener_id, "stopped listening");
        true
    }
}
