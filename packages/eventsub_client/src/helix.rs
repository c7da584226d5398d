//! Helix REST API: channel lookup and EventSub subscription management.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::HelixError;
use crate::messages::CHAT_MESSAGE_TYPE;

/// Resolved identity of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

/// Outcome of creating an upstream chat subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { id: String },
    /// The subscription already exists for this session.
    AlreadySubscribed,
    /// The session or account has no subscription budget left.
    Full,
}

/// Resolves channel names to identities.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Look up a channel by login, or by user id when `name` is all digits.
    async fn lookup(&self, name: &str) -> Result<Option<ChannelInfo>, HelixError>;
}

/// Creates and deletes upstream EventSub subscriptions.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create_chat_subscription(
        &self,
        broadcaster_id: &str,
        session_id: &str,
    ) -> Result<CreateOutcome, HelixError>;

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), HelixError>;
}

#[derive(Debug, Clone)]
pub struct HelixConfig {
    pub base_url: String,
    pub client_id: String,
    pub access_token: String,
    /// The authenticated user reading chat on the broadcaster's behalf.
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CreatedSubscription {
    id: String,
}

/// `reqwest`-backed Helix client.
#[derive(Debug, Clone)]
pub struct HelixClient {
    http: reqwest::Client,
    config: HelixConfig,
}

impl HelixClient {
    pub fn new(config: HelixConfig) -> Result<Self, HelixError> {
        if config.client_id.is_empty() {
            return Err(HelixError::MissingCredential("client_id"));
        }
        if config.access_token.is_empty() {
            return Err(HelixError::MissingCredential("access_token"));
        }
        if config.user_id.is_empty() {
            return Err(HelixError::MissingCredential("user_id"));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Client-Id", &self.config.client_id)
            .bearer_auth(&self.config.access_token)
    }
}

async fn status_error(resp: reqwest::Response) -> HelixError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    HelixError::Status { status, body }
}

#[async_trait]
impl ChannelDirectory for HelixClient {
    async fn lookup(&self, name: &str) -> Result<Option<ChannelInfo>, HelixError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let key = if name.chars().all(|c| c.is_ascii_digit()) {
            "id"
        } else {
            "login"
        };
        let lowered = name.to_lowercase();

        let resp = self
            .authed(self.http.get(self.url("/helix/users")))
            .query(&[(key, lowered.as_str())])
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                let envelope: DataEnvelope<ChannelInfo> = resp.json().await?;
                let found = envelope.data.into_iter().next();
                debug!(name, found = found.is_some(), "helix user lookup");
                Ok(found)
            }
            // Helix answers malformed logins with 400 rather than an empty list.
            StatusCode::BAD_REQUEST => Ok(None),
            _ => Err(status_error(resp).await),
        }
    }
}

#[async_trait]
impl SubscriptionApi for HelixClient {
    async fn create_chat_subscription(
        &self,
        broadcaster_id: &str,
        session_id: &str,
    ) -> Result<CreateOutcome, HelixError> {
        let body = json!({
            "type": CHAT_MESSAGE_TYPE,
            "version": "1",
            "condition": {
                "broadcaster_user_id": broadcaster_id,
                "user_id": self.config.user_id,
            },
            "transport": {
                "method": "websocket",
                "session_id": session_id,
            },
        });

        let resp = self
            .authed(self.http.post(self.url("/helix/eventsub/subscriptions")))
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                let envelope: DataEnvelope<CreatedSubscription> = resp.json().await?;
                let created = envelope
                    .data
                    .into_iter()
                    .next()
                    .ok_or(HelixError::EmptyResponse)?;
                info!(broadcaster_id, subscription_id = %created.id, "chat subscription created");
                Ok(CreateOutcome::Created { id: created.id })
            }
            StatusCode::CONFLICT => {
                debug!(broadcaster_id, "chat subscription already exists");
                Ok(CreateOutcome::AlreadySubscribed)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!(broadcaster_id, "subscription limit reached");
                Ok(CreateOutcome::Full)
            }
            _ => Err(status_error(resp).await),
        }
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), HelixError> {
        let resp = self
            .authed(self.http.delete(self.url("/helix/eventsub/subscriptions")))
            .query(&[("id", subscription_id)])
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // Already gone.
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HelixClient {
        HelixClient::new(HelixConfig {
            base_url: server.uri(),
            client_id: "cid".into(),
            access_token: "tok".into(),
            user_id: "900".into(),
        })
        .unwrap()
    }

    #[test]
    fn new_rejects_missing_credentials() {
        let err = HelixClient::new(HelixConfig {
            base_url: "http://localhost".into(),
            client_id: String::new(),
            access_token: "tok".into(),
            user_id: "1".into(),
        })
        .unwrap_err();
        assert!(matches!(err, HelixError::MissingCredential("client_id")));
    }

    #[tokio::test]
    async fn lookup_by_login_sends_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(query_param("login", "streamer"))
            .and(header("Client-Id", "cid"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "1001", "login": "streamer", "display_name": "Streamer"}]
            })))
            .mount(&server)
            .await;

        let info = client(&server).lookup(" Streamer ").await.unwrap().unwrap();
        assert_eq!(
            info,
            ChannelInfo {
                id: "1001".into(),
                login: "streamer".into(),
                display_name: "Streamer".into(),
            }
        );
    }

    #[tokio::test]
    async fn lookup_by_numeric_id_uses_id_param() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(query_param("id", "1001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "1001", "login": "streamer", "display_name": "Streamer"}]
            })))
            .mount(&server)
            .await;

        let info = client(&server).lookup("1001").await.unwrap().unwrap();
        assert_eq!(info.login, "streamer");
    }

    #[tokio::test]
    async fn lookup_unknown_channel_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        assert!(client(&server).lookup("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_server_error_is_err() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let err = client(&server).lookup("streamer").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn create_maps_status_codes_to_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(body_partial_json(json!({
                "type": "channel.chat.message",
                "condition": {"broadcaster_user_id": "1", "user_id": "900"},
                "transport": {"method": "websocket", "session_id": "sess"}
            })))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"data": [{"id": "sub-1"}]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"condition": {"broadcaster_user_id": "2"}})))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"condition": {"broadcaster_user_id": "3"}})))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"condition": {"broadcaster_user_id": "4"}})))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let helix = client(&server);
        assert_eq!(
            helix.create_chat_subscription("1", "sess").await.unwrap(),
            CreateOutcome::Created { id: "sub-1".into() }
        );
        assert_eq!(
            helix.create_chat_subscription("2", "sess").await.unwrap(),
            CreateOutcome::AlreadySubscribed
        );
        assert_eq!(
            helix.create_chat_subscription("3", "sess").await.unwrap(),
            CreateOutcome::Full
        );
        let err = helix.create_chat_subscription("4", "sess").await.unwrap_err();
        assert_eq!(err.status(), Some(403));
    }

    #[tokio::test]
    async fn delete_treats_missing_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/helix/eventsub/subscriptions"))
            .and(query_param("id", "sub-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(query_param("id", "sub-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let helix = client(&server);
        helix.delete_subscription("sub-1").await.unwrap();
        helix.delete_subscription("sub-gone").await.unwrap();
    }
}
