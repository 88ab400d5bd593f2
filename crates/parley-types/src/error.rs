use thiserror::Error;
use uuid::Uuid;

/// Failures of the messaging core operations.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("message {0} not found")]
    MessageNotFound(Uuid),

    #[error("user {0} not found")]
    UserNotFound(Uuid),

    #[error("participant {0} does not exist")]
    ParticipantNotFound(Uuid),

    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotAParticipant { conversation_id: Uuid, user_id: Uuid },

    #[error("a conversation needs at least two distinct participants")]
    InvalidParticipantSet,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification used for propagation and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    InvalidInput,
    Conflict,
    Transient,
    Internal,
}

impl MessagingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConversationNotFound(_)
            | Self::MessageNotFound(_)
            | Self::UserNotFound(_)
            | Self::ParticipantNotFound(_) => ErrorKind::NotFound,
            Self::NotAParticipant { .. } => ErrorKind::Unauthorized,
            Self::InvalidParticipantSet | Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
