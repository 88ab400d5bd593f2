use chrono::{Duration, SubsecRound};
use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use parley_types::api::SortOrder;
use parley_types::error::{MessagingError, MessagingResult};
use parley_types::models::{Message, Moderation};

use super::OptionalExt;
use super::conversations::{bump, is_member, member_ids};
use crate::clock::{from_sql, to_sql};
use crate::models::{Appended, MAX_PAGE_SIZE, MESSAGE_COLUMNS, MessagePage, message_from_row};
use crate::{Database, classify};

impl Database {
    // -- Messages --

    /// Append a message and bump the conversation's `updated_at` in one
    /// transaction.
    ///
    /// `created_at` is always later than the conversation's current
    /// `updated_at` (by one microsecond when the clock has not moved), so
    /// timestamps strictly increase within a conversation and list order is
    /// commit order. The bump always lands on the new message's `created_at`.
    ///
    /// `on_commit` runs after commit while the writer is still held, so
    /// anything it publishes is ordered like the commits.
    pub fn append_message<F>(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_ref: Option<Uuid>,
        on_commit: F,
    ) -> MessagingResult<Appended>
    where
        F: FnOnce(&Appended),
    {
        let content = content.trim();
        if content.is_empty() {
            return Err(MessagingError::InvalidInput("message content is empty".into()));
        }
        let now = self.now();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: String = tx
                .query_row(
                    "SELECT updated_at FROM conversations WHERE id = ?1",
                    [conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(MessagingError::ConversationNotFound(conversation_id))?;

            if !is_member(&tx, conversation_id, sender_id)? {
                return Err(MessagingError::NotAParticipant {
                    conversation_id,
                    user_id: sender_id,
                }
                .into());
            }

            let current = from_sql(&current)?;
            let now = now.trunc_subsecs(6);
            let created_at = if now > current {
                now
            } else {
                current + Duration::microseconds(1)
            };
            let id = Uuid::new_v4();

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, client_ref, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    id.to_string(),
                    conversation_id.to_string(),
                    sender_id.to_string(),
                    content,
                    client_ref.map(|r| r.to_string()),
                    to_sql(created_at),
                ],
            )?;

            let conversation_updated_at = bump(&tx, conversation_id, created_at)?;
            let participant_ids = member_ids(&tx, conversation_id)?;
            let message = query_message(&tx, id)?.ok_or(MessagingError::MessageNotFound(id))?;

            tx.commit()?;
            debug!("Message {} appended to conversation {}", id, conversation_id);

            let appended = Appended {
                message,
                conversation_updated_at,
                participant_ids,
            };
            on_commit(&appended);
            Ok(appended)
        })
        .map_err(classify)
    }

    /// Messages of a conversation in `(created_at, id)` order.
    pub fn list_messages(&self, conversation_id: Uuid, page: MessagePage) -> MessagingResult<Vec<Message>> {
        let limit = page.limit.clamp(1, MAX_PAGE_SIZE);
        let direction = match page.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    [conversation_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Err(MessagingError::ConversationNotFound(conversation_id).into());
            }

            for cursor in [page.before, page.after].into_iter().flatten() {
                if query_message(conn, cursor)?.is_none_or(|m| m.conversation_id != conversation_id) {
                    return Err(MessagingError::MessageNotFound(cursor).into());
                }
            }

            let sql = format!(
                "SELECT {cols} FROM messages
                 WHERE conversation_id = ?1
                   AND (?2 IS NULL OR (created_at, id) < (SELECT created_at, id FROM messages WHERE id = ?2))
                   AND (?3 IS NULL OR (created_at, id) > (SELECT created_at, id FROM messages WHERE id = ?3))
                 ORDER BY created_at {dir}, id {dir}
                 LIMIT ?4",
                cols = MESSAGE_COLUMNS,
                dir = direction
            );

            let rows = conn
                .prepare(&sql)?
                .query_map(
                    rusqlite::params![
                        conversation_id.to_string(),
                        page.before.map(|id| id.to_string()),
                        page.after.map(|id| id.to_string()),
                        limit,
                    ],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
        .map_err(classify)
    }

    pub fn get_message(&self, message_id: Uuid) -> MessagingResult<Message> {
        self.with_conn(|conn| query_message(conn, message_id))
            .map_err(classify)?
            .ok_or(MessagingError::MessageNotFound(message_id))
    }

    /// Mark a message read on behalf of `reader_id`. Reading your own message
    /// is a no-op. Returns the message and whether it changed; `on_commit`
    /// only runs when it did.
    pub fn mark_read<F>(&self, message_id: Uuid, reader_id: Uuid, on_commit: F) -> MessagingResult<(Message, bool)>
    where
        F: FnOnce(&Message),
    {
        let now = self.now();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let message = query_message(&tx, message_id)?.ok_or(MessagingError::MessageNotFound(message_id))?;
            if !is_member(&tx, message.conversation_id, reader_id)? {
                return Err(MessagingError::NotAParticipant {
                    conversation_id: message.conversation_id,
                    user_id: reader_id,
                }
                .into());
            }

            if message.sender_id == reader_id || message.is_read {
                return Ok((message, false));
            }

            tx.execute(
                "UPDATE messages SET is_read = 1, updated_at = MAX(updated_at, ?2) WHERE id = ?1",
                rusqlite::params![message_id.to_string(), to_sql(now)],
            )?;
            let message = query_message(&tx, message_id)?.ok_or(MessagingError::MessageNotFound(message_id))?;
            tx.commit()?;

            on_commit(&message);
            Ok((message, true))
        })
        .map_err(classify)
    }

    /// Partial update of the moderation annotations. `None` fields keep their
    /// stored value; `content` is never touched.
    pub fn update_moderation<F>(&self, message_id: Uuid, patch: &Moderation, on_commit: F) -> MessagingResult<Message>
    where
        F: FnOnce(&Message),
    {
        let now = self.now();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE messages SET
                     toxicity_score    = COALESCE(?2, toxicity_score),
                     toxicity_category = COALESCE(?3, toxicity_category),
                     status            = COALESCE(?4, status),
                     rewritten_version = COALESCE(?5, rewritten_version),
                     is_flagged        = COALESCE(?6, is_flagged),
                     updated_at        = MAX(updated_at, ?7)
                 WHERE id = ?1",
                rusqlite::params![
                    message_id.to_string(),
                    patch.toxicity_score,
                    patch.toxicity_category,
                    patch.status.map(|s| s.as_str()),
                    patch.rewritten_version,
                    patch.is_flagged,
                    to_sql(now),
                ],
            )?;
            if changed == 0 {
                return Err(MessagingError::MessageNotFound(message_id).into());
            }

            let message = query_message(&tx, message_id)?.ok_or(MessagingError::MessageNotFound(message_id))?;
            tx.commit()?;

            on_commit(&message);
            Ok(message)
        })
        .map_err(classify)
    }
}

fn query_message(conn: &Connection, id: Uuid) -> anyhow::Result<Option<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    conn.query_row(&sql, [id.to_string()], message_from_row).optional()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use parley_types::models::ModerationStatus;

    use super::*;
    use crate::clock::FixedClock;
    use crate::queries::users::tests::seed_user;

    struct Fixture {
        db: Database,
        a: Uuid,
        b: Uuid,
        conversation: Uuid,
    }

    fn fixture(db: Database) -> Fixture {
        let a = seed_user(&db, "a");
        let b = seed_user(&db, "b");
        let conversation = db.create_conversation(a, &[b], |_| {}).unwrap().conversation.id();
        Fixture { db, a, b, conversation }
    }

    fn send(f: &Fixture, from: Uuid, text: &str) -> Message {
        f.db.append_message(f.conversation, from, text, None, |_| {}).unwrap().message
    }

    #[test]
    fn append_bumps_conversation_to_message_time() {
        let f = fixture(Database::open_in_memory().unwrap());
        let mut seen = None;
        let appended = f
            .db
            .append_message(f.conversation, f.a, "  hello ", None, |a| seen = Some(a.message.id))
            .unwrap();

        assert_eq!(seen, Some(appended.message.id));
        assert_eq!(appended.message.content, "hello");
        assert_eq!(appended.conversation_updated_at, appended.message.created_at);
        assert_eq!(appended.participant_ids.len(), 2);
        assert_eq!(
            f.db.get_conversation(f.conversation).unwrap().conversation.updated_at,
            appended.message.created_at
        );

        let list = f.db.list_conversations_for_user(f.b).unwrap();
        assert_eq!(list[0].last_message.as_ref().map(|m| m.id), Some(appended.message.id));
    }

    #[test]
    fn append_rejections() {
        let f = fixture(Database::open_in_memory().unwrap());
        let outsider = seed_user(&f.db, "outsider");

        assert!(matches!(
            f.db.append_message(f.conversation, outsider, "hi", None, |_| {}),
            Err(MessagingError::NotAParticipant { .. })
        ));
        assert!(matches!(
            f.db.append_message(Uuid::new_v4(), f.a, "hi", None, |_| {}),
            Err(MessagingError::ConversationNotFound(_))
        ));
        assert!(matches!(
            f.db.append_message(f.conversation, f.a, "   ", None, |_| panic!("no commit")),
            Err(MessagingError::InvalidInput(_))
        ));
        assert!(f.db.list_messages(f.conversation, MessagePage::default()).unwrap().is_empty());
    }

    #[test]
    fn same_instant_sends_keep_commit_order() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let f = fixture(Database::open_in_memory().unwrap().with_clock(FixedClock(t)));

        let sent: Vec<Message> = (0..6).map(|i| send(&f, if i % 2 == 0 { f.a } else { f.b }, "x")).collect();
        assert!(sent[0].created_at > t);
        for pair in sent.windows(2) {
            assert_eq!(pair[1].created_at - pair[0].created_at, Duration::microseconds(1));
        }
        assert_eq!(
            f.db.get_conversation(f.conversation).unwrap().conversation.updated_at,
            sent[5].created_at
        );

        let mut expected: Vec<Uuid> = sent.iter().map(|m| m.id).collect();

        let asc: Vec<Uuid> = f
            .db
            .list_messages(f.conversation, MessagePage::default())
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(asc, expected);

        let desc: Vec<Uuid> = f
            .db
            .list_messages(
                f.conversation,
                MessagePage {
                    order: SortOrder::Desc,
                    ..Default::default()
                },
            )
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        expected.reverse();
        assert_eq!(desc, expected);
    }

    #[test]
    fn later_messages_come_later() {
        let f = fixture(Database::open_in_memory().unwrap());
        let first = send(&f, f.a, "one");
        let second = send(&f, f.b, "two");
        let third = send(&f, f.a, "three");
        assert!(first.order_key() < second.order_key());
        assert!(second.order_key() < third.order_key());

        let contents: Vec<String> = f
            .db
            .list_messages(f.conversation, MessagePage::default())
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn cursor_paging() {
        let f = fixture(Database::open_in_memory().unwrap());
        let sent: Vec<Message> = (0..5).map(|i| send(&f, f.a, &format!("m{}", i))).collect();

        let newest_two = f
            .db
            .list_messages(
                f.conversation,
                MessagePage {
                    order: SortOrder::Desc,
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(newest_two.iter().map(|m| m.id).collect::<Vec<_>>(), vec![sent[4].id, sent[3].id]);

        let older = f
            .db
            .list_messages(
                f.conversation,
                MessagePage {
                    order: SortOrder::Desc,
                    limit: 2,
                    before: Some(sent[3].id),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![sent[2].id, sent[1].id]);

        let after = f
            .db
            .list_messages(
                f.conversation,
                MessagePage {
                    after: Some(sent[2].id),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(after.iter().map(|m| m.id).collect::<Vec<_>>(), vec![sent[3].id, sent[4].id]);

        assert!(matches!(
            f.db.list_messages(
                f.conversation,
                MessagePage {
                    before: Some(Uuid::new_v4()),
                    ..Default::default()
                }
            ),
            Err(MessagingError::MessageNotFound(_))
        ));
    }

    #[test]
    fn mark_read_ignores_sender() {
        let f = fixture(Database::open_in_memory().unwrap());
        let msg = send(&f, f.a, "ping");

        let (own, changed) = f.db.mark_read(msg.id, f.a, |_| panic!("no change")).unwrap();
        assert!(!changed);
        assert!(!own.is_read);

        let (read, changed) = f.db.mark_read(msg.id, f.b, |_| {}).unwrap();
        assert!(changed);
        assert!(read.is_read);

        let (_, again) = f.db.mark_read(msg.id, f.b, |_| {}).unwrap();
        assert!(!again);

        assert!(matches!(
            f.db.mark_read(Uuid::new_v4(), f.b, |_| {}),
            Err(MessagingError::MessageNotFound(_))
        ));
    }

    #[test]
    fn moderation_patch_keeps_content_and_other_fields() {
        let f = fixture(Database::open_in_memory().unwrap());
        let msg = send(&f, f.a, "original words");

        f.db.update_moderation(
            msg.id,
            &Moderation {
                toxicity_score: Some(0.91),
                toxicity_category: Some("insult".into()),
                ..Default::default()
            },
            |_| {},
        )
        .unwrap();

        let updated = f
            .db
            .update_moderation(
                msg.id,
                &Moderation {
                    status: Some(ModerationStatus::Blocked),
                    rewritten_version: Some("kinder words".into()),
                    is_flagged: Some(true),
                    ..Default::default()
                },
                |_| {},
            )
            .unwrap();

        assert_eq!(updated.content, "original words");
        assert_eq!(updated.moderation.toxicity_score, Some(0.91));
        assert_eq!(updated.moderation.toxicity_category.as_deref(), Some("insult"));
        assert_eq!(updated.moderation.status, Some(ModerationStatus::Blocked));
        assert_eq!(updated.moderation.is_flagged, Some(true));

        // Blocked messages stay listed; enforcement is not the store's job
        assert_eq!(f.db.list_messages(f.conversation, MessagePage::default()).unwrap().len(), 1);
    }
}
