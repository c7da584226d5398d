//! Tier list voting driven by live chat.
//!
//! Chat messages of the form `<item> <tier>` arriving on a subscribed
//! channel become votes on that channel's tier list. State lives in SQLite
//! and is reached only through a bounded cache of [`editor::Editor`]s, each
//! of which owns one channel's list and saves it in the background after
//! edits settle.

pub mod cache;
pub mod config;
pub mod db;
pub mod editor;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod vote;

pub use cache::{CacheConfig, EditorLoader, StateCache, store_loader};
pub use editor::{Editor, EditorContext, ItemPatch, TierPatch};
pub use error::{EditError, TemplateError, VoteRejection};
pub use listener::{ChannelListener, ListenOutcome, ListenerConfig};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use models::{Item, ItemTally, Tier, TierListState, TierListTemplate, ValidTemplate};
pub use repository::{StateStore, TierListRepository};
