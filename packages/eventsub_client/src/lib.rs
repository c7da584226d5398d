//! EventSub client - Twitch chat ingestion over a single WebSocket
//!
//! This crate owns the upstream side of chat ingestion: the EventSub socket
//! (welcome, keep-alive, server-directed reconnect), the Helix REST calls
//! that create chat subscriptions, and a multiplexer that fans one
//! connection's chat notifications out to any number of per-channel
//! listeners. It knows nothing about what listeners do with the messages.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use eventsub_client::{
//!     ChannelSignal, ChatSubscriber, HelixClient, HelixConfig, MultiplexerConfig,
//!     SubscriptionMultiplexer, WsConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let helix = Arc::new(HelixClient::new(HelixConfig {
//!         base_url: "https://api.twitch.tv".into(),
//!         client_id: "client-id".into(),
//!         access_token: "token".into(),
//!         user_id: "12345".into(),
//!     })?);
//!     let mux = SubscriptionMultiplexer::new(
//!         helix.clone(),
//!         helix,
//!         Arc::new(WsConnector),
//!         MultiplexerConfig::default(),
//!     );
//!
//!     mux.subscribe(
//!         "some_channel",
//!         Arc::new(|signal: &ChannelSignal| {
//!             if let ChannelSignal::Message(msg) = signal {
//!                 println!("{}: {}", msg.chatter_user_name, msg.message.text);
//!             }
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
mod error;
pub mod helix;
pub mod messages;
pub mod multiplexer;
pub mod transport;

pub use connection::{
    CloseInfo, ConnectionConfig, ConnectionState, EventHandlers, EventSubConnection,
    KEEPALIVE_EXPIRED_CODE, SESSION_MIGRATED_CODE,
};
pub use error::{HelixError, TransportError};
pub use helix::{
    ChannelDirectory, ChannelInfo, CreateOutcome, HelixClient, HelixConfig, SubscriptionApi,
};
pub use messages::{ChatMessageEvent, Notification, Revocation, Welcome};
pub use multiplexer::{
    ChannelSignal, ChatSubscriber, ListenerId, MultiplexerConfig, SignalCallback,
    SubscribeOutcome, SubscriptionMultiplexer, normalize_channel,
};
pub use transport::{Connector, WsConnector};
