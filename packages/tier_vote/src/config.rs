use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use eventsub_client::{ConnectionConfig, HelixConfig, MultiplexerConfig};

use crate::cache::CacheConfig;
use crate::listener::ListenerConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [twitch]
//                    client_id = "abc"
//
//   env var:         TIER_VOTE_TWITCH__CLIENT_ID=abc   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub twitch: TwitchFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub listener: ListenerFileConfig,
    #[serde(default)]
    pub cache: CacheFileConfig,
}

/// Upstream credentials and endpoints (lives under `[twitch]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TwitchFileConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub access_token: String,
    /// User the access token belongs to; reads chat on the broadcaster's behalf.
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_eventsub_url")]
    pub eventsub_url: String,
    #[serde(default = "default_helix_url")]
    pub helix_url: String,
    #[serde(default = "default_welcome_timeout_secs")]
    pub welcome_timeout_secs: u64,
}

impl Default for TwitchFileConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            access_token: String::new(),
            user_id: String::new(),
            eventsub_url: default_eventsub_url(),
            helix_url: default_helix_url(),
            welcome_timeout_secs: default_welcome_timeout_secs(),
        }
    }
}

/// Socket keep-alive tunables (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_keepalive_check_secs")]
    pub keepalive_check_secs: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            keepalive_check_secs: default_keepalive_check_secs(),
        }
    }
}

/// Listener liveness tunables (lives under `[listener]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerFileConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for ListenerFileConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

/// Editor cache tunables (lives under `[cache]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheFileConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,
}

impl Default for CacheFileConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            save_delay_ms: default_save_delay_ms(),
        }
    }
}

fn default_eventsub_url() -> String {
    "wss://eventsub.wss.twitch.tv/ws".to_string()
}
fn default_helix_url() -> String {
    "https://api.twitch.tv".to_string()
}
fn default_welcome_timeout_secs() -> u64 {
    10
}
fn default_keepalive_check_secs() -> u64 {
    10
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_heartbeat_timeout_secs() -> u64 {
    100
}
fn default_capacity() -> usize {
    100
}
fn default_save_delay_ms() -> u64 {
    5000
}

/// Build a figment that layers: defaults → config.toml → TIER_VOTE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TIER_VOTE_TWITCH__ACCESS_TOKEN=...`  →  `twitch.access_token = ...`
///   `TIER_VOTE_CACHE__CAPACITY=50`        →  `cache.capacity = 50`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TIER_VOTE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub helix: HelixConfig,
    pub multiplexer: MultiplexerConfig,
    pub listener: ListenerConfig,
    pub cache: CacheConfig,
}

impl RuntimeConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            helix: HelixConfig {
                base_url: fc.twitch.helix_url.clone(),
                client_id: fc.twitch.client_id.clone(),
                access_token: fc.twitch.access_token.clone(),
                user_id: fc.twitch.user_id.clone(),
            },
            multiplexer: MultiplexerConfig {
                eventsub_url: fc.twitch.eventsub_url.clone(),
                welcome_timeout: Duration::from_secs(fc.twitch.welcome_timeout_secs),
                connection: ConnectionConfig {
                    keepalive_check_interval: Duration::from_secs(
                        fc.connection.keepalive_check_secs.max(1),
                    ),
                    ..Default::default()
                },
            },
            listener: ListenerConfig {
                check_interval: Duration::from_secs(fc.listener.check_interval_secs.max(1)),
                heartbeat_timeout: Duration::from_secs(fc.listener.heartbeat_timeout_secs),
            },
            cache: CacheConfig {
                capacity: fc.cache.capacity.max(1),
                save_delay: Duration::from_millis(fc.cache.save_delay_ms),
            },
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DataDir {
    pub root: PathBuf,
    pub db_path: PathBuf,
}

impl DataDir {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let root = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".tier_vote"),
        };

        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create data directory: {:?}", root))?;

        let db_path = root.join("tier_vote.db");
        info!("Data directory: {}", root.display());

        Ok(Self { root, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}
