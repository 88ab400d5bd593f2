use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use parley_types::error::{MessagingError, MessagingResult};
use parley_types::models::{ConversationSummary, ConversationView, Message, ParticipantView};

use super::OptionalExt;
use super::users::user_exists;
use crate::clock::to_sql;
use crate::models::{
    CONVERSATION_COLUMNS, CreatedConversation, MESSAGE_COLUMNS, conversation_from_row, message_from_row,
    ts_at, user_summary_at, uuid_at,
};
use crate::{Database, classify};

impl Database {
    // -- Conversation factory --

    /// Create a conversation between `creator_id` and `participant_ids`.
    ///
    /// Two distinct members make a direct conversation. A direct conversation
    /// is claimed through the `direct_pairs` key inside the same transaction
    /// that inserts the conversation and its participants; when the pair is
    /// already claimed the existing conversation is returned with
    /// `created == false`.
    ///
    /// `on_commit` runs after commit while the writer is still held; it is
    /// not called when an existing conversation is returned.
    pub fn create_conversation<F>(
        &self,
        creator_id: Uuid,
        participant_ids: &[Uuid],
        on_commit: F,
    ) -> MessagingResult<CreatedConversation>
    where
        F: FnOnce(&CreatedConversation),
    {
        let members: Vec<Uuid> = std::iter::once(creator_id)
            .chain(participant_ids.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if members.len() < 2 {
            return Err(MessagingError::InvalidParticipantSet);
        }
        let is_group = members.len() > 2;
        let now = self.now();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for &member in &members {
                if !user_exists(&tx, member)? {
                    return Err(MessagingError::ParticipantNotFound(member).into());
                }
            }

            let id = Uuid::new_v4();

            if !is_group {
                // members is sorted, so [0] < [1]
                let claimed = tx.execute(
                    "INSERT INTO direct_pairs (user_low, user_high, conversation_id)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_low, user_high) DO NOTHING",
                    rusqlite::params![members[0].to_string(), members[1].to_string(), id.to_string()],
                )?;

                if claimed == 0 {
                    let existing: String = tx.query_row(
                        "SELECT conversation_id FROM direct_pairs WHERE user_low = ?1 AND user_high = ?2",
                        rusqlite::params![members[0].to_string(), members[1].to_string()],
                        |row| row.get(0),
                    )?;
                    let existing: Uuid = existing.parse()?;
                    debug!("Direct conversation {} already exists for {} and {}", existing, members[0], members[1]);
                    let conversation = load_view(&tx, existing)?
                        .ok_or(MessagingError::ConversationNotFound(existing))?;
                    // Nothing was written; dropping the transaction rolls back.
                    return Ok(CreatedConversation {
                        conversation,
                        created: false,
                    });
                }
            }

            tx.execute(
                "INSERT INTO conversations (id, is_group, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![id.to_string(), is_group, to_sql(now)],
            )?;

            {
                let mut insert = tx.prepare(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                )?;
                for member in &members {
                    insert.execute(rusqlite::params![id.to_string(), member.to_string(), to_sql(now)])?;
                }
            }

            let conversation = load_view(&tx, id)?.ok_or(MessagingError::ConversationNotFound(id))?;
            tx.commit()?;

            info!(
                "Created {} conversation {} with {} participants",
                if is_group { "group" } else { "direct" },
                id,
                members.len()
            );

            let created = CreatedConversation {
                conversation,
                created: true,
            };
            on_commit(&created);
            Ok(created)
        })
        .map_err(|e| match classify(e) {
            MessagingError::Conflict(msg) => {
                // direct_pairs makes this unreachable; seeing it means the
                // uniqueness key is missing.
                error!("Conversation creation hit a uniqueness conflict: {}", msg);
                MessagingError::Conflict(msg)
            }
            other => other,
        })
    }

    /// Add a member to an existing group conversation. Returns `false` when
    /// the user was already a participant.
    pub fn add_participant<F>(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        on_commit: F,
    ) -> MessagingResult<(ConversationView, bool)>
    where
        F: FnOnce(&ConversationView, bool),
    {
        let now = self.now();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let is_group: bool = tx
                .query_row(
                    "SELECT is_group FROM conversations WHERE id = ?1",
                    [conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(MessagingError::ConversationNotFound(conversation_id))?;

            if !is_group {
                return Err(MessagingError::InvalidInput(
                    "participants can only be added to group conversations".into(),
                )
                .into());
            }
            if !user_exists(&tx, user_id)? {
                return Err(MessagingError::UserNotFound(user_id).into());
            }

            let added = tx.execute(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![conversation_id.to_string(), user_id.to_string(), to_sql(now)],
            )? == 1;

            let view = load_view(&tx, conversation_id)?
                .ok_or(MessagingError::ConversationNotFound(conversation_id))?;
            tx.commit()?;

            if added {
                info!("Added {} to conversation {}", user_id, conversation_id);
            }
            on_commit(&view, added);
            Ok((view, added))
        })
        .map_err(classify)
    }

    // -- Conversation registry --

    pub fn get_conversation(&self, conversation_id: Uuid) -> MessagingResult<ConversationView> {
        self.with_conn(|conn| load_view(conn, conversation_id))
            .map_err(classify)?
            .ok_or(MessagingError::ConversationNotFound(conversation_id))
    }

    /// The conversation list of `user_id`: most recently updated first,
    /// ties broken by id descending, each with its latest message.
    pub fn list_conversations_for_user(&self, user_id: Uuid) -> MessagingResult<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let uid = user_id.to_string();

            let sql = format!(
                "SELECT {} FROM conversations
                 WHERE id IN (SELECT conversation_id FROM conversation_participants WHERE user_id = ?1)
                 ORDER BY updated_at DESC, id DESC",
                CONVERSATION_COLUMNS
            );
            let conversations = conn
                .prepare(&sql)?
                .query_map([&uid], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            // Participants of all listed conversations in one query
            let mut participants: HashMap<Uuid, Vec<ParticipantView>> = HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT p.conversation_id, u.id, u.handle, u.display_name, u.avatar_ref, p.joined_at
                 FROM conversation_participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.conversation_id IN
                     (SELECT conversation_id FROM conversation_participants WHERE user_id = ?1)
                 ORDER BY p.joined_at, u.id",
            )?;
            let rows = stmt.query_map([&uid], |row| {
                Ok((
                    uuid_at(row, 0)?,
                    ParticipantView {
                        user: user_summary_at(row, 1)?,
                        joined_at: ts_at(row, 5)?,
                    },
                ))
            })?;
            for row in rows {
                let (cid, participant) = row?;
                participants.entry(cid).or_default().push(participant);
            }

            // Latest message per conversation by (created_at, id)
            let sql = format!(
                "SELECT {cols} FROM (
                     SELECT {cols}, ROW_NUMBER() OVER (
                         PARTITION BY conversation_id ORDER BY created_at DESC, id DESC
                     ) AS rn
                     FROM messages
                     WHERE conversation_id IN
                         (SELECT conversation_id FROM conversation_participants WHERE user_id = ?1)
                 ) WHERE rn = 1",
                cols = MESSAGE_COLUMNS
            );
            let mut last_messages: HashMap<Uuid, Message> = conn
                .prepare(&sql)?
                .query_map([&uid], message_from_row)?
                .map(|m| m.map(|m| (m.conversation_id, m)))
                .collect::<std::result::Result<_, _>>()?;

            Ok(conversations
                .into_iter()
                .map(|conversation| ConversationSummary {
                    last_message: last_messages.remove(&conversation.id),
                    view: ConversationView {
                        participants: participants.remove(&conversation.id).unwrap_or_default(),
                        conversation,
                    },
                })
                .collect())
        })
        .map_err(classify)
    }

    /// `updated_at = max(updated_at, ts)`. Idempotent and order-insensitive.
    /// Returns the resulting value.
    pub fn bump_updated_at(&self, conversation_id: Uuid, ts: DateTime<Utc>) -> MessagingResult<DateTime<Utc>> {
        self.with_conn_mut(|conn| bump(conn, conversation_id, ts)).map_err(classify)
    }

    pub fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> MessagingResult<bool> {
        self.with_conn(|conn| is_member(conn, conversation_id, user_id))
            .map_err(classify)
    }

    pub fn participant_ids(&self, conversation_id: Uuid) -> MessagingResult<Vec<Uuid>> {
        self.with_conn(|conn| member_ids(conn, conversation_id))
            .map_err(classify)
    }
}

pub(crate) fn bump(conn: &Connection, conversation_id: Uuid, ts: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    conn.query_row(
        "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1 RETURNING updated_at",
        rusqlite::params![conversation_id.to_string(), to_sql(ts)],
        |row| ts_at(row, 0),
    )
    .optional()?
    .ok_or_else(|| MessagingError::ConversationNotFound(conversation_id).into())
}

pub(crate) fn is_member(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id.to_string(), user_id.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn member_ids(conn: &Connection, conversation_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
    let ids = conn
        .prepare("SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY user_id")?
        .query_map([conversation_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub(crate) fn load_view(conn: &Connection, conversation_id: Uuid) -> anyhow::Result<Option<ConversationView>> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    let Some(conversation) = conn
        .query_row(&sql, [conversation_id.to_string()], conversation_from_row)
        .optional()?
    else {
        return Ok(None);
    };

    let participants = conn
        .prepare(
            "SELECT u.id, u.handle, u.display_name, u.avatar_ref, p.joined_at
             FROM conversation_participants p
             JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ?1
             ORDER BY p.joined_at, u.id",
        )?
        .query_map([conversation_id.to_string()], |row| {
            Ok(ParticipantView {
                user: user_summary_at(row, 0)?,
                joined_at: ts_at(row, 4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(ConversationView {
        conversation,
        participants,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::queries::users::tests::seed_user;

    fn noop(_: &CreatedConversation) {}

    #[test]
    fn first_dm_is_visible_to_both_sides() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");

        let created = db.create_conversation(a, &[b], noop).unwrap();
        assert!(created.created);
        let x = created.conversation.id();
        assert!(!created.conversation.conversation.is_group);

        for user in [a, b] {
            let list = db.list_conversations_for_user(user).unwrap();
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].id(), x);
            assert!(!list[0].view.conversation.is_group);
            assert!(list[0].last_message.is_none());
            assert_eq!(list[0].view.participants.len(), 2);
        }
    }

    #[test]
    fn reverse_dm_returns_existing_conversation() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");

        let x = db.create_conversation(a, &[b], noop).unwrap().conversation.id();
        let mut fired = false;
        let again = db.create_conversation(b, &[a], |_| fired = true).unwrap();
        assert!(!fired, "nothing was committed");
        assert!(!again.created);
        assert_eq!(again.conversation.id(), x);
        assert_eq!(db.list_conversations_for_user(a).unwrap().len(), 1);
    }

    #[test]
    fn group_includes_creator() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");
        let c = seed_user(&db, "c");

        let created = db.create_conversation(a, &[b, c], noop).unwrap();
        let view = created.conversation;
        assert!(view.conversation.is_group);
        assert_eq!(view.participants.len(), 3);
        assert!(view.has_participant(a));

        // Groups are never deduplicated
        let second = db.create_conversation(a, &[b, c], noop).unwrap();
        assert!(second.created);
        assert_ne!(second.conversation.id(), view.id());
    }

    #[test]
    fn invalid_participant_sets() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");

        assert!(matches!(
            db.create_conversation(a, &[], noop),
            Err(MessagingError::InvalidParticipantSet)
        ));
        assert!(matches!(
            db.create_conversation(a, &[a, a], noop),
            Err(MessagingError::InvalidParticipantSet)
        ));

        let ghost = Uuid::new_v4();
        assert!(matches!(
            db.create_conversation(a, &[ghost], noop),
            Err(MessagingError::ParticipantNotFound(id)) if id == ghost
        ));
        assert!(db.list_conversations_for_user(a).unwrap().is_empty());
    }

    #[test]
    fn concurrent_dm_creation_yields_one_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("race.db")).unwrap());
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                let (me, them) = if i % 2 == 0 { (a, b) } else { (b, a) };
                std::thread::spawn(move || db.create_conversation(me, &[them], noop).unwrap())
            })
            .collect();

        let results: Vec<CreatedConversation> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = results[0].conversation.id();
        assert!(results.iter().all(|r| r.conversation.id() == first));
        assert_eq!(results.iter().filter(|r| r.created).count(), 1);

        let rows: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn bump_is_idempotent_and_monotonic() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");
        let view = db.create_conversation(a, &[b], noop).unwrap().conversation;
        let c = view.id();
        let t = view.conversation.updated_at + Duration::seconds(10);

        assert_eq!(db.bump_updated_at(c, t).unwrap(), t);
        assert_eq!(db.bump_updated_at(c, t).unwrap(), t);
        assert_eq!(db.bump_updated_at(c, t - Duration::seconds(5)).unwrap(), t);
        assert_eq!(db.get_conversation(c).unwrap().conversation.updated_at, t);

        assert!(matches!(
            db.bump_updated_at(Uuid::new_v4(), t),
            Err(MessagingError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn list_orders_by_recency_then_id() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");
        let c = seed_user(&db, "c");
        let ab = db.create_conversation(a, &[b], noop).unwrap().conversation;
        let ac = db.create_conversation(a, &[c], noop).unwrap().conversation;

        let t = ab.conversation.updated_at.max(ac.conversation.updated_at) + Duration::seconds(1);
        db.bump_updated_at(ab.id(), t).unwrap();
        db.bump_updated_at(ac.id(), t).unwrap();

        let ids: Vec<Uuid> = db.list_conversations_for_user(a).unwrap().iter().map(|s| s.id()).collect();
        let mut expected = vec![ab.id(), ac.id()];
        expected.sort_by(|x, y| y.cmp(x));
        assert_eq!(ids, expected);

        db.bump_updated_at(expected[1], t + Duration::seconds(1)).unwrap();
        let top = db.list_conversations_for_user(a).unwrap()[0].id();
        assert_eq!(top, expected[1]);
    }

    #[test]
    fn add_participant_only_to_groups() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");
        let c = seed_user(&db, "c");
        let d = seed_user(&db, "d");

        let dm = db.create_conversation(a, &[b], noop).unwrap().conversation.id();
        assert!(matches!(
            db.add_participant(dm, c, |_, _| {}),
            Err(MessagingError::InvalidInput(_))
        ));

        let group = db.create_conversation(a, &[b, c], noop).unwrap().conversation.id();
        let (view, added) = db.add_participant(group, d, |_, _| {}).unwrap();
        assert!(added);
        assert_eq!(view.participants.len(), 4);

        let (_, again) = db.add_participant(group, d, |_, _| {}).unwrap();
        assert!(!again);
        assert!(db.is_participant(group, d).unwrap());
    }
}
