//! EventSub WebSocket wire messages.
//!
//! Every frame is a JSON object with a `metadata` block (carrying the
//! `message_type` tag) and a `payload` whose shape depends on the tag:
//!
//! | `message_type`      | payload                                          |
//! |---------------------|--------------------------------------------------|
//! | `session_welcome`   | `session.id`, `session.keepalive_timeout_seconds` |
//! | `session_keepalive` | empty                                            |
//! | `notification`      | `subscription`, `event`                          |
//! | `session_reconnect` | `session.reconnect_url`                          |
//! | `revocation`        | `subscription` (with `status` as the reason)     |

use std::time::Duration;

use serde::Deserialize;

pub const SESSION_WELCOME: &str = "session_welcome";
pub const SESSION_KEEPALIVE: &str = "session_keepalive";
pub const NOTIFICATION: &str = "notification";
pub const SESSION_RECONNECT: &str = "session_reconnect";
pub const REVOCATION: &str = "revocation";

/// Subscription type for chat messages in a channel.
pub const CHAT_MESSAGE_TYPE: &str = "channel.chat.message";

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: Option<String>,
    #[serde(default)]
    pub subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: Session,
}

#[derive(Debug, Deserialize)]
struct Session {
    id: String,
    #[serde(default)]
    keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    subscription: SubscriptionInfo,
    #[serde(default)]
    event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
    subscription: SubscriptionInfo,
}

/// The `subscription` object attached to notifications and revocations.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub condition: serde_json::Value,
}

impl SubscriptionInfo {
    /// `condition.broadcaster_user_id`, when present.
    pub fn broadcaster_user_id(&self) -> Option<&str> {
        self.condition
            .get("broadcaster_user_id")
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub session_id: String,
    /// Server-declared keep-alive window. `None` when the server omitted it.
    pub keepalive_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconnect {
    pub session_id: String,
    pub reconnect_url: String,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub message_id: String,
    pub subscription: SubscriptionInfo,
    pub event: serde_json::Value,
}

impl Notification {
    /// Decode the event as a chat message, if this is a
    /// `channel.chat.message` notification.
    pub fn chat_message(&self) -> Option<ChatMessageEvent> {
        if self.subscription.kind != CHAT_MESSAGE_TYPE {
            return None;
        }
        serde_json::from_value(self.event.clone()).ok()
    }
}

#[derive(Debug, Clone)]
pub struct Revocation {
    pub subscription: SubscriptionInfo,
}

impl Revocation {
    pub fn reason(&self) -> &str {
        self.subscription.status.as_deref().unwrap_or("unknown")
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Welcome(Welcome),
    Keepalive,
    Notification(Notification),
    Reconnect(Reconnect),
    Revocation(Revocation),
    /// A well-formed frame with a type tag this client does not know.
    Unknown(String),
}

/// `channel.chat.message` event body.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatMessageEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub broadcaster_user_name: String,
    pub chatter_user_id: String,
    #[serde(default)]
    pub chatter_user_login: String,
    #[serde(default)]
    pub chatter_user_name: String,
    #[serde(default)]
    pub message_id: String,
    pub message: ChatMessageBody,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChatMessageBody {
    pub text: String,
}

/// Parse a text frame into its metadata and classified message.
pub fn parse_message(text: &str) -> Result<(Metadata, ServerMessage), serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let metadata = envelope.metadata;
    let payload = envelope.payload;

    let message = match metadata.message_type.as_str() {
        SESSION_WELCOME => {
            let p: SessionPayload = serde_json::from_value(payload)?;
            ServerMessage::Welcome(Welcome {
                session_id: p.session.id,
                keepalive_timeout: p
                    .session
                    .keepalive_timeout_seconds
                    .map(Duration::from_secs),
            })
        }
        SESSION_KEEPALIVE => ServerMessage::Keepalive,
        NOTIFICATION => {
            let p: NotificationPayload = serde_json::from_value(payload)?;
            ServerMessage::Notification(Notification {
                message_id: metadata.message_id.clone(),
                subscription: p.subscription,
                event: p.event,
            })
        }
        SESSION_RECONNECT => {
            let p: SessionPayload = serde_json::from_value(payload)?;
            let Some(reconnect_url) = p.session.reconnect_url else {
                return Err(serde::de::Error::missing_field("reconnect_url"));
            };
            ServerMessage::Reconnect(Reconnect {
                session_id: p.session.id,
                reconnect_url,
            })
        }
        REVOCATION => {
            let p: RevocationPayload = serde_json::from_value(payload)?;
            ServerMessage::Revocation(Revocation {
                subscription: p.subscription,
            })
        }
        other => ServerMessage::Unknown(other.to_string()),
    };

    Ok((metadata, message))
}
