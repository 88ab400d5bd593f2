//! The messaging operations exposed to sessions: every write goes to the
//! store and is fanned out from inside the store's commit hook, so event
//! order per conversation matches commit order.
//!
//! All methods block on SQLite; async callers go through `spawn_blocking`.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::{CreatedConversation, MessagePage};
use parley_gateway::dispatcher::Dispatcher;
use parley_types::error::{MessagingError, MessagingResult};
use parley_types::models::{ConversationSummary, ConversationView, Message, Moderation, Role, User};

#[derive(Clone)]
pub struct Messenger {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl Messenger {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // -- Conversations --

    /// Create (or, for an existing direct pair, find) a conversation.
    /// New conversations are announced on every participant's list topic.
    pub fn create_conversation(&self, creator_id: Uuid, participant_ids: &[Uuid]) -> MessagingResult<CreatedConversation> {
        let dispatcher = &self.dispatcher;
        self.db.create_conversation(creator_id, participant_ids, |created| {
            let view = &created.conversation;
            dispatcher.conversation_created(view, view.participants.iter().map(|p| p.user.id));
        })
    }

    pub fn get_conversation(&self, conversation_id: Uuid, viewer_id: Uuid) -> MessagingResult<ConversationView> {
        let view = self.db.get_conversation(conversation_id)?;
        if !view.has_participant(viewer_id) {
            return Err(MessagingError::NotAParticipant {
                conversation_id,
                user_id: viewer_id,
            });
        }
        Ok(view)
    }

    pub fn list_conversations(&self, user_id: Uuid) -> MessagingResult<Vec<ConversationSummary>> {
        self.db.list_conversations_for_user(user_id)
    }

    /// Add `user_id` to a group. `actor_id` must already be a member. The
    /// updated conversation is re-announced to every member.
    pub fn add_participant(&self, conversation_id: Uuid, actor_id: Uuid, user_id: Uuid) -> MessagingResult<bool> {
        self.ensure_participant(conversation_id, actor_id)?;
        let dispatcher = &self.dispatcher;
        let (_, added) = self.db.add_participant(conversation_id, user_id, |view, added| {
            if added {
                dispatcher.conversation_created(view, view.participants.iter().map(|p| p.user.id));
            }
        })?;
        Ok(added)
    }

    // -- Messages --

    pub fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_ref: Option<Uuid>,
    ) -> MessagingResult<Message> {
        let dispatcher = &self.dispatcher;
        let appended = self.db.append_message(conversation_id, sender_id, content, client_ref, |appended| {
            dispatcher.message_created(
                &appended.message,
                appended.conversation_updated_at,
                &appended.participant_ids,
            );
        })?;
        Ok(appended.message)
    }

    pub fn list_messages(&self, conversation_id: Uuid, reader_id: Uuid, page: MessagePage) -> MessagingResult<Vec<Message>> {
        self.ensure_participant(conversation_id, reader_id)?;
        self.db.list_messages(conversation_id, page)
    }

    pub fn mark_read(&self, message_id: Uuid, reader_id: Uuid) -> MessagingResult<bool> {
        let dispatcher = &self.dispatcher;
        let (_, changed) = self
            .db
            .mark_read(message_id, reader_id, |message| dispatcher.message_updated(message))?;
        Ok(changed)
    }

    /// Moderation annotations are written by the moderation service; the
    /// status is forwarded to clients but never enforced here.
    pub fn update_moderation(&self, message_id: Uuid, patch: &Moderation) -> MessagingResult<Message> {
        if patch.is_empty() {
            return Err(MessagingError::InvalidInput("empty moderation update".into()));
        }
        let dispatcher = &self.dispatcher;
        let message = self
            .db
            .update_moderation(message_id, patch, |message| dispatcher.message_updated(message))?;
        info!(
            "Moderation updated on message {} (status {:?})",
            message_id,
            message.moderation.status
        );
        Ok(message)
    }

    // -- Users --

    pub fn current_user(&self, user_id: Uuid) -> MessagingResult<User> {
        self.db.get_user(user_id)
    }

    pub fn list_users(&self, excluding: Uuid, role: Option<Role>) -> MessagingResult<Vec<User>> {
        self.db.list_users(Some(excluding), role)
    }

    fn ensure_participant(&self, conversation_id: Uuid, user_id: Uuid) -> MessagingResult<()> {
        if self.db.is_participant(conversation_id, user_id)? {
            return Ok(());
        }
        // Distinguish a missing conversation from a foreign one
        self.db.get_conversation(conversation_id)?;
        Err(MessagingError::NotAParticipant {
            conversation_id,
            user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use parley_db::queries::NewUser;
    use parley_types::events::{GatewayEvent, Topic};

    use super::*;

    fn messenger() -> Messenger {
        Messenger::new(Arc::new(Database::open_in_memory().unwrap()), Dispatcher::default())
    }

    fn user(m: &Messenger, handle: &str) -> Uuid {
        let id = Uuid::new_v4();
        m.db()
            .create_user(
                id,
                NewUser {
                    handle,
                    display_name: None,
                    password_hash: "x",
                    role: Role::User,
                },
            )
            .unwrap();
        id
    }

    #[tokio::test]
    async fn send_fans_out_message_and_touch() {
        let m = messenger();
        let a = user(&m, "a");
        let b = user(&m, "b");
        let x = m.create_conversation(a, &[b]).unwrap().conversation.id();

        let mut b_conversation = m.dispatcher().register(b);
        b_conversation.subscribe(Topic::Conversation(x));
        let mut b_list = m.dispatcher().register(b);
        b_list.subscribe(Topic::UserConversations(b));

        let sent = m.send_message(x, a, "hello", None).unwrap();

        match b_conversation.recv().await {
            Some(GatewayEvent::MessageCreated { message }) => {
                assert_eq!(message.content, "hello");
                assert_eq!(message.id, sent.id);
            }
            other => panic!("expected MessageCreated, got {:?}", other),
        }
        assert!(b_conversation.try_recv().is_none());

        assert_eq!(
            b_list.recv().await,
            Some(GatewayEvent::ConversationTouched {
                conversation_id: x,
                updated_at: sent.created_at,
            })
        );
        assert!(b_list.try_recv().is_none());
    }

    #[tokio::test]
    async fn creation_announced_once_and_dedup_is_silent() {
        let m = messenger();
        let a = user(&m, "a");
        let b = user(&m, "b");
        let mut b_list = m.dispatcher().register(b);
        b_list.subscribe(Topic::UserConversations(b));

        let first = m.create_conversation(a, &[b]).unwrap();
        let second = m.create_conversation(b, &[a]).unwrap();
        assert_eq!(first.conversation.id(), second.conversation.id());
        assert!(!second.created);

        match b_list.recv().await {
            Some(GatewayEvent::ConversationCreated { conversation }) => {
                assert_eq!(conversation.id(), first.conversation.id());
            }
            other => panic!("expected ConversationCreated, got {:?}", other),
        }
        assert!(b_list.try_recv().is_none());
    }

    #[test]
    fn concurrent_first_dm_from_both_sides() {
        let m = messenger();
        let a = user(&m, "a");
        let b = user(&m, "b");

        let from_a = {
            let m = m.clone();
            std::thread::spawn(move || m.create_conversation(a, &[b]).unwrap())
        };
        let from_b = {
            let m = m.clone();
            std::thread::spawn(move || m.create_conversation(b, &[a]).unwrap())
        };
        let (ra, rb) = (from_a.join().unwrap(), from_b.join().unwrap());

        assert_eq!(ra.conversation.id(), rb.conversation.id());
        assert!(ra.created ^ rb.created);
        assert_eq!(m.list_conversations(a).unwrap().len(), 1);
        assert_eq!(m.list_conversations(b).unwrap().len(), 1);
    }

    #[test]
    fn outsiders_cannot_read_or_write() {
        let m = messenger();
        let a = user(&m, "a");
        let b = user(&m, "b");
        let eve = user(&m, "eve");
        let x = m.create_conversation(a, &[b]).unwrap().conversation.id();

        assert!(matches!(
            m.list_messages(x, eve, MessagePage::default()),
            Err(MessagingError::NotAParticipant { .. })
        ));
        assert!(matches!(
            m.get_conversation(x, eve),
            Err(MessagingError::NotAParticipant { .. })
        ));
        assert!(matches!(
            m.send_message(x, eve, "hi", None),
            Err(MessagingError::NotAParticipant { .. })
        ));
        assert!(matches!(
            m.list_messages(Uuid::new_v4(), a, MessagePage::default()),
            Err(MessagingError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn recency_moves_touched_conversation_to_top() {
        let m = messenger();
        let a = user(&m, "a");
        let b = user(&m, "b");
        let c = user(&m, "c");
        let ab = m.create_conversation(a, &[b]).unwrap().conversation.id();
        let ac = m.create_conversation(a, &[c]).unwrap().conversation.id();
        m.send_message(ac, a, "first", None).unwrap();
        m.send_message(ab, b, "second", None).unwrap();

        let order: Vec<Uuid> = m.list_conversations(a).unwrap().iter().map(|s| s.id()).collect();
        assert_eq!(order, vec![ab, ac]);
        let top = &m.list_conversations(b).unwrap()[0];
        assert_eq!(top.last_message.as_ref().map(|msg| msg.content.as_str()), Some("second"));
    }

    #[tokio::test]
    async fn mark_read_publishes_update() {
        let m = messenger();
        let a = user(&m, "a");
        let b = user(&m, "b");
        let x = m.create_conversation(a, &[b]).unwrap().conversation.id();
        let msg = m.send_message(x, a, "read me", None).unwrap();

        let mut sub = m.dispatcher().register(a);
        sub.subscribe(Topic::Conversation(x));

        assert!(!m.mark_read(msg.id, a).unwrap());
        assert!(sub.try_recv().is_none());

        assert!(m.mark_read(msg.id, b).unwrap());
        match sub.recv().await {
            Some(GatewayEvent::MessageUpdated { message }) => assert!(message.is_read),
            other => panic!("expected MessageUpdated, got {:?}", other),
        }
    }

    #[test]
    fn empty_moderation_patch_is_rejected() {
        let m = messenger();
        assert!(matches!(
            m.update_moderation(Uuid::new_v4(), &Moderation::default()),
            Err(MessagingError::InvalidInput(_))
        ));
    }
}
