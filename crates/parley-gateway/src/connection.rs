use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a WebSocket connection whose bearer token was validated at the
/// HTTP upgrade.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    handle: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", handle, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        handle: handle.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    if dispatcher.user_online(user_id) {
        set_presence(&db, user_id, true).await;
    }

    let mut subscription = dispatcher.register(user_id);
    let subscriber_id = subscription.id();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event, GatewayEvent::Resync) {
                        warn!("Subscriber {} fell behind, asking client to resync", subscriber_id);
                    }
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping the subscription here unregisters it
        drop(subscription);
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let handle_recv = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db_recv, subscriber_id, user_id, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            handle_recv,
                            user_id,
                            e,
                            preview(&text, 200)
                        );
                        dispatcher_recv.send_to(
                            subscriber_id,
                            GatewayEvent::Error {
                                message: format!("bad command: {}", e),
                            },
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // An aborted send task drops its subscription too; unregister is idempotent
    dispatcher.unregister(subscriber_id);
    if dispatcher.user_offline(user_id) {
        set_presence(&db, user_id, false).await;
    }
    info!("{} ({}) disconnected from gateway", handle, user_id);
}

async fn handle_command(dispatcher: &Dispatcher, db: &Arc<Database>, subscriber_id: Uuid, user_id: Uuid, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Subscribe { topics } => {
            debug!("{} subscribing to {} topics", user_id, topics.len());
            for topic in topics {
                match authorize(db, user_id, topic).await {
                    Ok(true) => {
                        dispatcher.subscribe(subscriber_id, topic);
                    }
                    Ok(false) => {
                        warn!("{} denied subscription to {}", user_id, topic);
                        dispatcher.send_to(
                            subscriber_id,
                            GatewayEvent::Error {
                                message: format!("not allowed to subscribe to {}", topic),
                            },
                        );
                    }
                    Err(e) => {
                        error!("Subscription check for {} failed: {}", topic, e);
                        dispatcher.send_to(
                            subscriber_id,
                            GatewayEvent::Error {
                                message: format!("could not subscribe to {}", topic),
                            },
                        );
                    }
                }
            }
        }

        GatewayCommand::Unsubscribe { topics } => {
            for topic in topics {
                dispatcher.unsubscribe(subscriber_id, topic);
            }
        }
    }
}

/// Users may follow their own conversation list and conversations they
/// participate in.
async fn authorize(db: &Arc<Database>, user_id: Uuid, topic: Topic) -> anyhow::Result<bool> {
    match topic {
        Topic::UserConversations(owner) => Ok(owner == user_id),
        Topic::Conversation(conversation_id) => {
            let db = db.clone();
            let allowed = tokio::task::spawn_blocking(move || db.is_participant(conversation_id, user_id)).await??;
            Ok(allowed)
        }
    }
}

/// At most `max_chars` characters of `text`, cut on a char boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(i, _)| &text[..i])
}

async fn set_presence(db: &Arc<Database>, user_id: Uuid, online: bool) {
    let db = db.clone();
    match tokio::task::spawn_blocking(move || db.set_presence(user_id, online)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to record presence for {}: {}", user_id, e),
        Err(e) => error!("spawn_blocking join error: {}", e),
    }
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize {}: {}", event.kind(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_db::queries::NewUser;
    use parley_types::models::Role;

    fn user(db: &Database, handle: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(
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

    #[test]
    fn preview_cuts_on_char_boundary() {
        let text = format!("a{}", "\u{e9}".repeat(150));
        let cut = preview(&text, 200);
        assert_eq!(cut, text);

        let text = format!("a{}", "\u{e9}".repeat(250));
        let cut = preview(&text, 200);
        assert_eq!(cut.chars().count(), 200);
        assert!(cut.starts_with("a\u{e9}"));

        assert_eq!(preview(&"x".repeat(300), 200).len(), 200);
        assert_eq!(preview("short", 200), "short");
    }

    #[tokio::test]
    async fn users_follow_only_their_own_list() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ada = user(&db, "ada");
        let bob = user(&db, "bob");

        assert!(authorize(&db, ada, Topic::UserConversations(ada)).await.unwrap());
        assert!(!authorize(&db, ada, Topic::UserConversations(bob)).await.unwrap());
    }

    #[tokio::test]
    async fn conversations_need_membership() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ada = user(&db, "ada");
        let bob = user(&db, "bob");
        let eve = user(&db, "eve");
        let conversation = db.create_conversation(ada, &[bob], |_| {}).unwrap().conversation.id();

        assert!(authorize(&db, ada, Topic::Conversation(conversation)).await.unwrap());
        assert!(authorize(&db, bob, Topic::Conversation(conversation)).await.unwrap());
        assert!(!authorize(&db, eve, Topic::Conversation(conversation)).await.unwrap());
        assert!(!authorize(&db, ada, Topic::Conversation(Uuid::new_v4())).await.unwrap());
    }

    #[tokio::test]
    async fn denied_subscribe_reports_an_error_and_routes_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ada = user(&db, "ada");
        let bob = user(&db, "bob");
        let eve = user(&db, "eve");
        let conversation = db.create_conversation(ada, &[bob], |_| {}).unwrap().conversation.id();

        let dispatcher = Dispatcher::default();
        let mut subscription = dispatcher.register(eve);
        let topics = vec![Topic::Conversation(conversation), Topic::UserConversations(ada)];
        handle_command(&dispatcher, &db, subscription.id(), eve, GatewayCommand::Subscribe { topics }).await;

        for _ in 0..2 {
            assert!(matches!(subscription.try_recv(), Some(GatewayEvent::Error { .. })));
        }
        dispatcher.publish(Topic::Conversation(conversation), GatewayEvent::Resync);
        dispatcher.publish(Topic::UserConversations(ada), GatewayEvent::Resync);
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn presence_writes_reach_the_user_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ada = user(&db, "ada");
        assert!(!db.get_user(ada).unwrap().is_online);

        set_presence(&db, ada, true).await;
        assert!(db.get_user(ada).unwrap().is_online);

        set_presence(&db, ada, false).await;
        let ada = db.get_user(ada).unwrap();
        assert!(!ada.is_online);
        assert!(ada.last_seen.is_some());
    }
}
