use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Moderator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Moderator => "moderator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "moderator" => Some(Self::Moderator),
            _ => None,
        }
    }
}

/// Identity record. Owned by the identity layer; the messaging core only
/// holds references to `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub role: Role,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }
}

/// The slice of a user that conversation views embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
}

impl UserSummary {
    /// Display name, falling back to the handle.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.handle)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub user: UserSummary,
    pub joined_at: DateTime<Utc>,
}

/// A conversation with its resolved participant list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<ParticipantView>,
}

/// How a conversation presents itself to one particular viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationKind {
    /// `peer` is `None` only if the other participant's row is missing.
    Direct { peer: Option<UserSummary> },
    Group { members: Vec<UserSummary> },
}

impl ConversationView {
    pub fn id(&self) -> Uuid {
        self.conversation.id
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.user.id == user_id)
    }

    /// Classify relative to `viewer`; the viewer is excluded from the result.
    pub fn kind(&self, viewer: Uuid) -> ConversationKind {
        let others = self
            .participants
            .iter()
            .filter(|p| p.user.id != viewer)
            .map(|p| p.user.clone());

        if self.conversation.is_group {
            ConversationKind::Group {
                members: others.collect(),
            }
        } else {
            ConversationKind::Direct {
                peer: others.into_iter().next(),
            }
        }
    }

    /// Title shown in a conversation list.
    pub fn title(&self, viewer: Uuid) -> String {
        match self.kind(viewer) {
            ConversationKind::Direct { peer } => peer
                .map(|p| p.label().to_string())
                .unwrap_or_else(|| "User".to_string()),
            ConversationKind::Group { members } if members.is_empty() => "Group Chat".to_string(),
            ConversationKind::Group { members } => members
                .iter()
                .map(|m| m.label())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Entry of the "my conversations" list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub view: ConversationView,
    pub last_message: Option<Message>,
}

impl ConversationSummary {
    pub fn id(&self) -> Uuid {
        self.view.conversation.id
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.view.conversation.updated_at
    }

    /// Conversation list order: most recently updated first, ties by id descending.
    pub fn recency_cmp(&self, other: &Self) -> Ordering {
        other
            .updated_at()
            .cmp(&self.updated_at())
            .then_with(|| other.id().cmp(&self.id()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationStatus {
    Allowed,
    Warned,
    Blocked,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Warned => "warned",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allowed" => Some(Self::Allowed),
            "warned" => Some(Self::Warned),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Moderation annotations. Written by the moderation service, stored and
/// forwarded as-is; `Blocked` is a display hint only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Moderation {
    pub toxicity_score: Option<f64>,
    pub toxicity_category: Option<String>,
    pub status: Option<ModerationStatus>,
    pub rewritten_version: Option<String>,
    pub is_flagged: Option<bool>,
}

impl Moderation {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub is_read: bool,
    /// Pending marker supplied by the sending client, echoed back so it can
    /// match its optimistic copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
    #[serde(flatten)]
    pub moderation: Moderation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Display order within a conversation: `(created_at, id)`.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}
