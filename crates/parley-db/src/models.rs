//! Row mapping between SQLite and the shared `parley-types` models, plus
//! the result types of the write operations.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use uuid::Uuid;

use parley_types::api::SortOrder;
use parley_types::models::{
    Conversation, ConversationView, Message, Moderation, ModerationStatus, Role, User,
    UserSummary,
};

use crate::clock::from_sql;

/// A user together with the stored password hash, for login.
pub struct UserRow {
    pub user: User,
    pub password: String,
}

/// Outcome of an append: the committed message, the conversation's
/// resulting `updated_at`, and who should hear about it.
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    pub conversation_updated_at: DateTime<Utc>,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CreatedConversation {
    pub conversation: ConversationView,
    /// `false` when an existing direct conversation was returned.
    pub created: bool,
}

/// Paging window for message listing. Cursors are message ids and are
/// exclusive.
#[derive(Debug, Clone, Copy)]
pub struct MessagePage {
    pub order: SortOrder,
    pub limit: u32,
    pub before: Option<Uuid>,
    pub after: Option<Uuid>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

impl Default for MessagePage {
    fn default() -> Self {
        Self {
            order: SortOrder::Asc,
            limit: DEFAULT_PAGE_SIZE,
            before: None,
            after: None,
        }
    }
}

pub(crate) const USER_COLUMNS: &str =
    "id, handle, display_name, avatar_ref, role, is_online, last_seen, created_at";

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, is_read, \
     client_ref, toxicity_score, toxicity_category, status, rewritten_version, is_flagged, \
     created_at, updated_at";

pub(crate) const CONVERSATION_COLUMNS: &str = "id, is_group, created_at, updated_at";

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw.parse().map(Some).map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

pub(crate) fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_sql(&raw)
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| from_sql(&raw))
        .transpose()
}

/// Reads `USER_COLUMNS` starting at column 0.
pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(4)?;
    Ok(User {
        id: uuid_at(row, 0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        avatar_ref: row.get(3)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        is_online: row.get(5)?,
        last_seen: opt_ts_at(row, 6)?,
        created_at: ts_at(row, 7)?,
    })
}

/// Reads `id, handle, display_name, avatar_ref` starting at `offset`.
pub(crate) fn user_summary_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<UserSummary> {
    Ok(UserSummary {
        id: uuid_at(row, offset)?,
        handle: row.get(offset + 1)?,
        display_name: row.get(offset + 2)?,
        avatar_ref: row.get(offset + 3)?,
    })
}

/// Reads `CONVERSATION_COLUMNS` starting at column 0.
pub(crate) fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        is_group: row.get(1)?,
        created_at: ts_at(row, 2)?,
        updated_at: ts_at(row, 3)?,
    })
}

/// Reads `MESSAGE_COLUMNS` starting at column 0.
pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let status: Option<String> = row.get(8)?;
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        sender_id: uuid_at(row, 2)?,
        content: row.get(3)?,
        is_read: row.get(4)?,
        client_ref: opt_uuid_at(row, 5)?,
        moderation: Moderation {
            toxicity_score: row.get(6)?,
            toxicity_category: row.get(7)?,
            status: status.as_deref().and_then(ModerationStatus::parse),
            rewritten_version: row.get(9)?,
            is_flagged: row.get(10)?,
        },
        created_at: ts_at(row, 11)?,
        updated_at: ts_at(row, 12)?,
    })
}
