use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationView, Message};

/// A fan-out subscription key.
///
/// Wire form is a string: `conversation:<id>` or `userConversations:<user_id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Message stream of one conversation.
    Conversation(Uuid),
    /// Conversation-list changes for one user.
    UserConversations(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{}", id),
            Self::UserConversations(id) => write!(f, "userConversations:{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed topic '{}'", s))?;
        let id: Uuid = id.parse().map_err(|e| format!("bad id in topic '{}': {}", s, e))?;
        match kind {
            "conversation" => Ok(Self::Conversation(id)),
            "userConversations" => Ok(Self::UserConversations(id)),
            _ => Err(format!("unknown topic kind '{}'", kind)),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.to_string()
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, handle: String },

    /// A message was committed to a conversation
    MessageCreated { message: Message },

    /// Read receipt or moderation annotations changed on a message
    MessageUpdated { message: Message },

    /// A conversation's `updated_at` moved forward
    ConversationTouched {
        conversation_id: Uuid,
        updated_at: DateTime<Utc>,
    },

    /// The user was made a participant of a conversation
    ConversationCreated { conversation: ConversationView },

    /// The subscriber's queue overflowed and events were dropped.
    /// The session must refetch everything it displays.
    Resync,

    /// A command was rejected
    Error { message: String },
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "Ready",
            Self::MessageCreated { .. } => "MessageCreated",
            Self::MessageUpdated { .. } => "MessageUpdated",
            Self::ConversationTouched { .. } => "ConversationTouched",
            Self::ConversationCreated { .. } => "ConversationCreated",
            Self::Resync => "Resync",
            Self::Error { .. } => "Error",
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving events for the given topics.
    Subscribe { topics: Vec<Topic> },

    /// Stop receiving events for the given topics.
    Unsubscribe { topics: Vec<Topic> },
}
