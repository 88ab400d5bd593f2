use thiserror::Error;

use parley_types::error::{ErrorKind, MessagingError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway connection failed: {0}")]
    Gateway(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gateway connection is closed")]
    GatewayClosed,

    #[error("no conversation is open")]
    NoConversation,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api { status, .. } => match status {
                404 => ErrorKind::NotFound,
                401 | 403 => ErrorKind::Unauthorized,
                400 | 422 => ErrorKind::InvalidInput,
                409 => ErrorKind::Conflict,
                429 | 502 | 503 | 504 => ErrorKind::Transient,
                _ => ErrorKind::Internal,
            },
            Self::Messaging(e) => e.kind(),
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::Transient,
            Self::Http(_) => ErrorKind::Internal,
            Self::Gateway(_) | Self::GatewayClosed => ErrorKind::Transient,
            Self::NoConversation => ErrorKind::InvalidInput,
        }
    }

    /// Only transient failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify_like_the_server_maps_them() {
        let api = |status| ClientError::Api {
            status,
            message: String::new(),
        };
        assert_eq!(api(404).kind(), ErrorKind::NotFound);
        assert_eq!(api(403).kind(), ErrorKind::Unauthorized);
        assert_eq!(api(409).kind(), ErrorKind::Conflict);
        assert!(api(503).is_transient());
        assert!(!api(500).is_transient());
        assert!(ClientError::from(MessagingError::Transient("busy".into())).is_transient());
    }
}
