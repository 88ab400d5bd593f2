//! Per-session view of conversations and the open conversation's timeline.
//!
//! `SessionState` is a plain reducer: fetched pages and gateway events go
//! in, a consistent snapshot comes out. `Session` pairs it with a `Backend`
//! for the operations that need the server (optimistic sends, resync) and,
//! optionally, a gateway whose topics it keeps in step with the selection.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::events::{GatewayEvent, Topic};
use parley_types::models::{ConversationSummary, ConversationView, Message};

use crate::backend::{Backend, MessageQuery};
use crate::error::{ClientError, ClientResult};
use crate::gateway::Subscriptions;
use crate::retry::RetryPolicy;

/// Largest page the server hands out.
const PAGE_SIZE: u32 = 200;

/// A message shown locally before the server confirmed it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub client_ref: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

/// Outcome of feeding an event into the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// Local state can no longer be trusted; refetch everything.
    NeedsResync,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    user_id: Uuid,
    conversations: Vec<ConversationSummary>,
    selected: Option<Uuid>,
    messages: Vec<Message>,
    pending: Vec<PendingMessage>,
}

impl SessionState {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            conversations: Vec::new(),
            selected: None,
            messages: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Conversations, most recently updated first.
    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| c.id() == conversation_id)
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    /// Committed messages of the open conversation in `(created_at, id)` order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Unconfirmed sends for the open conversation, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        let selected = self.selected;
        self.pending.iter().filter(move |p| Some(p.conversation_id) == selected)
    }

    /// Topics this session should follow right now.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::UserConversations(self.user_id)];
        topics.extend(self.selected.map(Topic::Conversation));
        topics
    }

    pub fn replace_conversations(&mut self, mut conversations: Vec<ConversationSummary>) {
        conversations.sort_by(|a, b| a.recency_cmp(b));
        self.conversations = conversations;
    }

    /// Open a conversation with a freshly fetched page.
    pub fn open(&mut self, conversation_id: Uuid, mut messages: Vec<Message>) {
        messages.sort_by_key(Message::order_key);
        messages.dedup_by_key(|m| m.id);
        self.selected = Some(conversation_id);
        self.messages = messages;
        // A page fetched after a send may already contain it
        let committed: Vec<Uuid> = self.messages.iter().filter_map(|m| m.client_ref).collect();
        self.pending.retain(|p| !committed.contains(&p.client_ref));
    }

    /// Insert a conversation or refresh its participants. Returns `true` when
    /// it was not known before.
    pub fn upsert_conversation(&mut self, view: ConversationView) -> bool {
        let inserted = match self.conversations.iter_mut().find(|c| c.id() == view.id()) {
            Some(existing) => {
                let updated_at = existing.updated_at().max(view.conversation.updated_at);
                existing.view = view;
                existing.view.conversation.updated_at = updated_at;
                false
            }
            None => {
                self.conversations.push(ConversationSummary {
                    view,
                    last_message: None,
                });
                true
            }
        };
        self.resort();
        inserted
    }

    /// Queue an optimistic entry and return its pending marker.
    pub fn begin_send(&mut self, conversation_id: Uuid, content: &str) -> Uuid {
        let client_ref = Uuid::new_v4();
        self.pending.push(PendingMessage {
            client_ref,
            conversation_id,
            content: content.trim().to_string(),
            queued_at: Utc::now(),
        });
        client_ref
    }

    /// Roll back an optimistic entry after the send failed.
    pub fn fail_send(&mut self, client_ref: Uuid) -> Option<PendingMessage> {
        let idx = self.pending.iter().position(|p| p.client_ref == client_ref)?;
        Some(self.pending.remove(idx))
    }

    /// Reconcile a committed message, whether it came back from the send
    /// call or from the fan-out. The second arrival is a no-op.
    pub fn confirm_message(&mut self, message: Message) -> Applied {
        let mut applied = Applied::Unchanged;

        if message.sender_id == self.user_id {
            if let Some(client_ref) = message.client_ref {
                if self.fail_send(client_ref).is_some() {
                    applied = Applied::Changed;
                }
            }
        }

        if let Some(summary) = self.conversations.iter_mut().find(|c| c.id() == message.conversation_id) {
            let newer = summary
                .last_message
                .as_ref()
                .is_none_or(|last| last.order_key() < message.order_key());
            if newer {
                summary.last_message = Some(message.clone());
                if message.created_at > summary.updated_at() {
                    summary.view.conversation.updated_at = message.created_at;
                }
                applied = Applied::Changed;
            }
        }

        if self.selected == Some(message.conversation_id) {
            match self.messages.binary_search_by_key(&message.order_key(), Message::order_key) {
                Ok(_) => {}
                Err(idx) => {
                    self.messages.insert(idx, message);
                    applied = Applied::Changed;
                }
            }
        }

        if applied == Applied::Changed {
            self.resort();
        }
        applied
    }

    pub fn apply(&mut self, event: &GatewayEvent) -> Applied {
        match event {
            GatewayEvent::MessageCreated { message } => self.confirm_message(message.clone()),

            GatewayEvent::MessageUpdated { message } => {
                let mut applied = Applied::Unchanged;
                if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message.clone();
                    applied = Applied::Changed;
                }
                let last = self
                    .conversations
                    .iter_mut()
                    .find(|c| c.id() == message.conversation_id)
                    .and_then(|c| c.last_message.as_mut())
                    .filter(|last| last.id == message.id);
                if let Some(last) = last {
                    *last = message.clone();
                    applied = Applied::Changed;
                }
                applied
            }

            GatewayEvent::ConversationTouched {
                conversation_id,
                updated_at,
            } => match self.conversations.iter_mut().find(|c| c.id() == *conversation_id) {
                Some(summary) if summary.updated_at() < *updated_at => {
                    summary.view.conversation.updated_at = *updated_at;
                    self.resort();
                    Applied::Changed
                }
                Some(_) => Applied::Unchanged,
                None => {
                    debug!("Touch for unknown conversation {}, resyncing", conversation_id);
                    Applied::NeedsResync
                }
            },

            GatewayEvent::ConversationCreated { conversation } => {
                self.upsert_conversation(conversation.clone());
                Applied::Changed
            }

            GatewayEvent::Resync => Applied::NeedsResync,

            GatewayEvent::Ready { .. } => Applied::Unchanged,

            GatewayEvent::Error { message } => {
                warn!("Gateway error: {}", message);
                Applied::Unchanged
            }
        }
    }

    /// Flag a message as read wherever it is shown.
    pub fn mark_read(&mut self, message_id: Uuid) -> Applied {
        let mut applied = Applied::Unchanged;
        let timeline = self.messages.iter_mut().find(|m| m.id == message_id);
        let last = self
            .conversations
            .iter_mut()
            .filter_map(|c| c.last_message.as_mut())
            .find(|m| m.id == message_id);
        for message in timeline.into_iter().chain(last) {
            if !message.is_read {
                message.is_read = true;
                applied = Applied::Changed;
            }
        }
        applied
    }

    fn resort(&mut self) {
        self.conversations.sort_by(|a, b| a.recency_cmp(b));
    }
}

/// A `SessionState` driven against a server.
pub struct Session<B> {
    backend: B,
    state: SessionState,
    retry: RetryPolicy,
    subscriptions: Option<Box<dyn Subscriptions>>,
    followed: Vec<Topic>,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B, user_id: Uuid) -> Self {
        Self {
            backend,
            state: SessionState::new(user_id),
            retry: RetryPolicy::default(),
            subscriptions: None,
            followed: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep `subscriptions` following `SessionState::topics`.
    pub fn with_subscriptions(mut self, subscriptions: impl Subscriptions + 'static) -> Self {
        self.subscriptions = Some(Box::new(subscriptions));
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Refetch the conversation list and the open conversation.
    pub async fn refresh(&mut self) -> ClientResult<()> {
        let backend = &self.backend;
        let conversations = self
            .retry
            .run("list conversations", || backend.list_conversations())
            .await?;
        self.state.replace_conversations(conversations);

        match self.state.selected() {
            Some(conversation_id) => self.open_conversation(conversation_id).await?,
            None => self.sync_topics(),
        }
        Ok(())
    }

    /// Select a conversation and load its whole timeline.
    pub async fn open_conversation(&mut self, conversation_id: Uuid) -> ClientResult<()> {
        let messages = self.fetch_timeline(conversation_id).await?;
        self.state.open(conversation_id, messages);
        self.sync_topics();
        Ok(())
    }

    /// Every message of a conversation, oldest first, one page at a time.
    async fn fetch_timeline(&self, conversation_id: Uuid) -> ClientResult<Vec<Message>> {
        let backend = &self.backend;
        let mut messages: Vec<Message> = Vec::new();
        loop {
            let query = MessageQuery {
                limit: Some(PAGE_SIZE),
                after: messages.last().map(|m| m.id),
                ..Default::default()
            };
            let page = self
                .retry
                .run("list messages", || backend.list_messages(conversation_id, query.clone()))
                .await?;
            let last_page = page.len() < PAGE_SIZE as usize;
            messages.extend(page);
            if last_page {
                return Ok(messages);
            }
        }
    }

    /// Subscribe to topics the state now wants and drop the ones it no
    /// longer does.
    pub fn follow(&mut self) -> ClientResult<()> {
        let Some(subscriptions) = &self.subscriptions else {
            return Ok(());
        };
        let wanted = self.state.topics();
        let stale: Vec<Topic> = self.followed.iter().filter(|t| !wanted.contains(t)).copied().collect();
        let fresh: Vec<Topic> = wanted.iter().filter(|t| !self.followed.contains(t)).copied().collect();
        if !fresh.is_empty() {
            subscriptions.subscribe(fresh)?;
        }
        if !stale.is_empty() {
            subscriptions.unsubscribe(stale)?;
        }
        self.followed = wanted;
        Ok(())
    }

    /// Subscribe to every wanted topic again, e.g. on a new gateway connection.
    pub fn resubscribe(&mut self) -> ClientResult<()> {
        self.followed.clear();
        self.follow()
    }

    fn sync_topics(&mut self) {
        if let Err(e) = self.follow() {
            warn!("Could not update gateway subscriptions: {}", e);
        }
    }

    /// Optimistically send into the open conversation. A failure removes the
    /// pending entry and is returned as-is; sends are never retried.
    pub async fn send(&mut self, content: &str) -> ClientResult<Message> {
        let conversation_id = self.state.selected().ok_or(ClientError::NoConversation)?;
        let client_ref = self.state.begin_send(conversation_id, content);

        match self
            .backend
            .send_message(conversation_id, content.to_string(), client_ref)
            .await
        {
            Ok(message) => {
                self.state.confirm_message(message.clone());
                Ok(message)
            }
            Err(e) => {
                warn!("Send to {} failed: {}", conversation_id, e);
                self.state.fail_send(client_ref);
                Err(e)
            }
        }
    }

    /// Create or find a conversation with `participant_ids` and open it. An
    /// existing direct conversation is selected rather than duplicated.
    pub async fn start_conversation(&mut self, participant_ids: Vec<Uuid>) -> ClientResult<Uuid> {
        let created = self.backend.create_conversation(participant_ids).await?;
        let conversation_id = created.conversation_id;

        if self.state.conversation(conversation_id).is_none() {
            let backend = &self.backend;
            let view = self
                .retry
                .run("get conversation", || backend.get_conversation(conversation_id))
                .await?;
            self.state.upsert_conversation(view);
        }
        self.open_conversation(conversation_id).await?;
        Ok(conversation_id)
    }

    /// Mark a message read on the server, then locally. Returns the
    /// server's answer; the sender's own messages stay unread.
    pub async fn mark_read(&mut self, message_id: Uuid) -> ClientResult<bool> {
        let updated = self.backend.mark_read(message_id).await?;
        if updated {
            self.state.mark_read(message_id);
        }
        Ok(updated)
    }

    /// Feed a gateway event; resyncs when the state asks for it. A `Ready`
    /// starts a fresh connection, which has no subscriptions yet.
    pub async fn handle_event(&mut self, event: &GatewayEvent) -> ClientResult<Applied> {
        if matches!(event, GatewayEvent::Ready { .. }) {
            self.resubscribe()?;
        }
        let applied = self.state.apply(event);
        if applied == Applied::NeedsResync {
            self.refresh().await?;
        }
        Ok(applied)
    }
}
