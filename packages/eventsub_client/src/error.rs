//! Error types for the EventSub socket transport and the Helix REST client.

/// Errors raised by a [`Socket`](crate::transport::Socket) or a
/// [`Connector`](crate::transport::Connector).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("socket read failed: {0}")]
    Read(String),

    #[error("socket write failed: {0}")]
    Write(String),

    #[error("timed out waiting for session_welcome")]
    WelcomeTimeout,

    #[error("connection closed")]
    Closed,
}

/// Errors raised by the Helix REST API client.
#[derive(Debug, thiserror::Error)]
pub enum HelixError {
    #[error("helix request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("helix returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("helix response contained no data")]
    EmptyResponse,

    #[error("missing helix credential: {0}")]
    MissingCredential(&'static str),
}

impl HelixError {
    /// HTTP status code, if the error came from a non-success response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_exposed_for_status_errors() {
        let err = HelixError::Status {
            status: 429,
            body: "too many".into(),
        };
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("429"));
    }

    #[test]
    fn status_is_none_for_missing_credentials() {
        assert_eq!(HelixError::MissingCredential("client_id").status(), None);
        assert_eq!(HelixError::EmptyResponse.status(), None);
    }
}
