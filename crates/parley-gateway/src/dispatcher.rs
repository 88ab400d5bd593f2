use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use parley_types::events::{GatewayEvent, Topic};
use parley_types::models::{ConversationView, Message};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Routes events to subscribers by topic.
///
/// Every subscriber (one per connected session) owns a bounded queue.
/// Publishing never waits: when a queue is full the subscriber is marked
/// lagged and further events for it are dropped until it has drained its
/// queue, at which point it receives a single `Resync`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue_capacity: usize,

    /// topic -> subscriber ids
    topics: RwLock<HashMap<Topic, HashSet<Uuid>>>,

    /// subscriber id -> queue
    subscribers: RwLock<HashMap<Uuid, Slot>>,

    /// Online users: user_id -> number of live sessions
    online_users: RwLock<HashMap<Uuid, usize>>,
}

struct Slot {
    user_id: Uuid,
    tx: mpsc::Sender<GatewayEvent>,
    lagged: Arc<AtomicBool>,
    topics: HashSet<Topic>,
}

/// Receiving end of one subscriber. Dropping it unregisters the subscriber
/// from every topic.
pub struct Subscription {
    id: Uuid,
    user_id: Uuid,
    rx: mpsc::Receiver<GatewayEvent>,
    lagged: Arc<AtomicBool>,
    dispatcher: Dispatcher,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                queue_capacity: queue_capacity.max(1),
                topics: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                online_users: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscriber for `user_id` with no topics.
    pub fn register(&self, user_id: Uuid) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let lagged = Arc::new(AtomicBool::new(false));

        write(&self.inner.subscribers).insert(
            id,
            Slot {
                user_id,
                tx,
                lagged: lagged.clone(),
                topics: HashSet::new(),
            },
        );
        debug!("Subscriber {} registered for user {}", id, user_id);

        Subscription {
            id,
            user_id,
            rx,
            lagged,
            dispatcher: self.clone(),
        }
    }

    /// Remove a subscriber and all of its topic memberships.
    pub fn unregister(&self, subscriber_id: Uuid) {
        let Some(slot) = write(&self.inner.subscribers).remove(&subscriber_id) else {
            return;
        };
        let mut topics = write(&self.inner.topics);
        for topic in &slot.topics {
            remove_member(&mut topics, topic, subscriber_id);
        }
        debug!("Subscriber {} unregistered", subscriber_id);
    }

    /// Returns `false` if the subscriber is gone.
    pub fn subscribe(&self, subscriber_id: Uuid, topic: Topic) -> bool {
        let mut subscribers = write(&self.inner.subscribers);
        let Some(slot) = subscribers.get_mut(&subscriber_id) else {
            return false;
        };
        if slot.topics.insert(topic) {
            write(&self.inner.topics)
                .entry(topic)
                .or_default()
                .insert(subscriber_id);
            trace!("Subscriber {} joined {}", subscriber_id, topic);
        }
        true
    }

    pub fn unsubscribe(&self, subscriber_id: Uuid, topic: Topic) {
        let mut subscribers = write(&self.inner.subscribers);
        if let Some(slot) = subscribers.get_mut(&subscriber_id) {
            if slot.topics.remove(&topic) {
                remove_member(&mut write(&self.inner.topics), &topic, subscriber_id);
                trace!("Subscriber {} left {}", subscriber_id, topic);
            }
        }
    }

    /// Deliver `event` to every subscriber of `topic`. Never blocks.
    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, topic: Topic, event: GatewayEvent) -> usize {
        let members: Vec<Uuid> = match read(&self.inner.topics).get(&topic) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = read(&self.inner.subscribers);
            for id in members {
                let Some(slot) = subscribers.get(&id) else { continue };
                match offer(slot, event.clone()) {
                    Offer::Queued => delivered += 1,
                    Offer::Dropped => {}
                    Offer::Closed => closed.push(id),
                }
            }
        }

        for id in closed {
            self.unregister(id);
        }

        trace!("{} on {} ({} delivered)", event.kind(), topic, delivered);
        delivered
    }

    /// Send an event to one subscriber regardless of topics.
    pub fn send_to(&self, subscriber_id: Uuid, event: GatewayEvent) -> bool {
        let subscribers = read(&self.inner.subscribers);
        match subscribers.get(&subscriber_id) {
            Some(slot) => matches!(offer(slot, event), Offer::Queued),
            None => false,
        }
    }

    // -- Domain fan-out --

    /// `MessageCreated` to the conversation's subscribers and
    /// `ConversationTouched` to every participant's conversation list.
    pub fn message_created(&self, message: &Message, updated_at: DateTime<Utc>, participant_ids: &[Uuid]) {
        self.publish(
            Topic::Conversation(message.conversation_id),
            GatewayEvent::MessageCreated {
                message: message.clone(),
            },
        );
        for &user_id in participant_ids {
            self.publish(
                Topic::UserConversations(user_id),
                GatewayEvent::ConversationTouched {
                    conversation_id: message.conversation_id,
                    updated_at,
                },
            );
        }
    }

    pub fn message_updated(&self, message: &Message) {
        self.publish(
            Topic::Conversation(message.conversation_id),
            GatewayEvent::MessageUpdated {
                message: message.clone(),
            },
        );
    }

    /// Announce a conversation to each of `user_ids`' conversation lists.
    pub fn conversation_created(&self, conversation: &ConversationView, user_ids: impl IntoIterator<Item = Uuid>) {
        for user_id in user_ids {
            self.publish(
                Topic::UserConversations(user_id),
                GatewayEvent::ConversationCreated {
                    conversation: conversation.clone(),
                },
            );
        }
    }

    // -- Presence --

    /// Count a new session for `user_id`. Returns `true` if this is the
    /// user's first live session.
    pub fn user_online(&self, user_id: Uuid) -> bool {
        let mut online = write(&self.inner.online_users);
        let sessions = online.entry(user_id).or_insert(0);
        *sessions += 1;
        *sessions == 1
    }

    /// Returns `true` if the user has no live sessions left.
    pub fn user_offline(&self, user_id: Uuid) -> bool {
        let mut online = write(&self.inner.online_users);
        match online.get_mut(&user_id) {
            Some(sessions) if *sessions > 1 => {
                *sessions -= 1;
                false
            }
            Some(_) => {
                online.remove(&user_id);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        read(&self.inner.subscribers).len()
    }
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn subscribe(&self, topic: Topic) -> bool {
        self.dispatcher.subscribe(self.id, topic)
    }

    pub fn unsubscribe(&self, topic: Topic) {
        self.dispatcher.unsubscribe(self.id, topic)
    }

    /// Next event. After an overflow the queued backlog is drained first,
    /// then `Resync` is returned once. `None` when the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        match self.rx.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        if self.lagged.swap(false, Ordering::AcqRel) {
            return Some(GatewayEvent::Resync);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(_) if self.lagged.swap(false, Ordering::AcqRel) => Some(GatewayEvent::Resync),
            Err(_) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.id);
    }
}

enum Offer {
    Queued,
    Dropped,
    Closed,
}

fn offer(slot: &Slot, event: GatewayEvent) -> Offer {
    if slot.lagged.load(Ordering::Acquire) {
        return Offer::Dropped;
    }
    match slot.tx.try_send(event) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(event)) => {
            slot.lagged.store(true, Ordering::Release);
            warn!(
                "Subscriber queue full for user {}, dropping {} and scheduling resync",
                slot.user_id,
                event.kind()
            );
            Offer::Dropped
        }
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

fn remove_member(topics: &mut HashMap<Topic, HashSet<Uuid>>, topic: &Topic, subscriber_id: Uuid) {
    if let Some(members) = topics.get_mut(topic) {
        members.remove(&subscriber_id);
        if members.is_empty() {
            topics.remove(topic);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_types::models::Moderation;

    fn message(conversation_id: Uuid, content: &str) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: content.to_string(),
            is_read: false,
            client_ref: None,
            moderation: Moderation::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn content_of(event: Option<GatewayEvent>) -> String {
        match event {
            Some(GatewayEvent::MessageCreated { message }) => message.content,
            other => panic!("expected MessageCreated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delivers_only_to_topic_members_in_order() {
        let dispatcher = Dispatcher::default();
        let c = Uuid::new_v4();
        let mut member = dispatcher.register(Uuid::new_v4());
        let mut other = dispatcher.register(Uuid::new_v4());
        assert!(member.subscribe(Topic::Conversation(c)));
        other.subscribe(Topic::Conversation(Uuid::new_v4()));

        for text in ["one", "two", "three"] {
            dispatcher.message_created(&message(c, text), Utc::now(), &[]);
        }

        assert_eq!(content_of(member.recv().await), "one");
        assert_eq!(content_of(member.recv().await), "two");
        assert_eq!(content_of(member.recv().await), "three");
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn touched_goes_to_each_participant_list() {
        let dispatcher = Dispatcher::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut list_b = dispatcher.register(b);
        list_b.subscribe(Topic::UserConversations(b));

        let msg = message(Uuid::new_v4(), "hello");
        let t = msg.created_at;
        dispatcher.message_created(&msg, t, &[a, b]);

        assert_eq!(
            list_b.recv().await,
            Some(GatewayEvent::ConversationTouched {
                conversation_id: msg.conversation_id,
                updated_at: t,
            })
        );
        assert!(list_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_gets_resync_without_blocking_others() {
        let dispatcher = Dispatcher::new(2);
        let c = Uuid::new_v4();
        let mut slow = dispatcher.register(Uuid::new_v4());
        let mut fast = dispatcher.register(Uuid::new_v4());
        slow.subscribe(Topic::Conversation(c));
        fast.subscribe(Topic::Conversation(c));

        for i in 0..5 {
            dispatcher.message_created(&message(c, &i.to_string()), Utc::now(), &[]);
            assert_eq!(content_of(fast.recv().await), i.to_string());
        }

        // Backlog first, then a single resync
        assert_eq!(content_of(slow.recv().await), "0");
        assert_eq!(content_of(slow.recv().await), "1");
        assert_eq!(slow.recv().await, Some(GatewayEvent::Resync));
        assert!(slow.try_recv().is_none());

        // Delivery resumes after the resync
        dispatcher.message_created(&message(c, "after"), Utc::now(), &[]);
        assert_eq!(content_of(slow.recv().await), "after");
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let dispatcher = Dispatcher::default();
        let c = Uuid::new_v4();
        let sub = dispatcher.register(Uuid::new_v4());
        sub.subscribe(Topic::Conversation(c));
        assert_eq!(dispatcher.subscriber_count(), 1);
        drop(sub);
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert_eq!(dispatcher.publish(Topic::Conversation(c), GatewayEvent::Resync), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dispatcher = Dispatcher::default();
        let c = Uuid::new_v4();
        let mut sub = dispatcher.register(Uuid::new_v4());
        sub.subscribe(Topic::Conversation(c));
        sub.unsubscribe(Topic::Conversation(c));
        dispatcher.message_created(&message(c, "x"), Utc::now(), &[]);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn presence_counts_sessions() {
        let dispatcher = Dispatcher::default();
        let u = Uuid::new_v4();
        assert!(dispatcher.user_online(u));
        assert!(!dispatcher.user_online(u));
        assert!(!dispatcher.user_offline(u));
        assert!(dispatcher.user_offline(u));
        // Already gone; a stray disconnect does not flip presence again
        assert!(!dispatcher.user_offline(u));
    }
}
