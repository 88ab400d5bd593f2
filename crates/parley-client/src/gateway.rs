//! Client end of the `/gateway` WebSocket.
//!
//! `connect` splits the socket into a writer task fed by `GatewayHandle`
//! (subscribe/unsubscribe commands) and a reader task that decodes events
//! into `GatewayEvents`.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use parley_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::error::{ClientError, ClientResult};

/// Events buffered between the socket and the consumer.
const EVENT_BUFFER: usize = 256;

/// Where subscribe/unsubscribe commands go.
pub trait Subscriptions: Send + Sync {
    fn subscribe(&self, topics: Vec<Topic>) -> ClientResult<()>;

    fn unsubscribe(&self, topics: Vec<Topic>) -> ClientResult<()>;
}

/// Sends commands over an open gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewayHandle {
    pub fn send(&self, command: GatewayCommand) -> ClientResult<()> {
        self.commands.send(command).map_err(|_| ClientError::GatewayClosed)
    }
}

impl Subscriptions for GatewayHandle {
    fn subscribe(&self, topics: Vec<Topic>) -> ClientResult<()> {
        self.send(GatewayCommand::Subscribe { topics })
    }

    fn unsubscribe(&self, topics: Vec<Topic>) -> ClientResult<()> {
        self.send(GatewayCommand::Unsubscribe { topics })
    }
}

/// Events pushed by the server. Dropping this closes the connection.
pub struct GatewayEvents {
    events: mpsc::Receiver<GatewayEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GatewayEvents {
    /// The next event, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }
}

impl Drop for GatewayEvents {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// `http(s)://host` -> `ws(s)://host/gateway?token=...`
pub fn gateway_url(base_url: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/gateway?token={}", ws_base, token)
}

/// Open a gateway connection. The first event is always `Ready`.
pub async fn connect(base_url: &str, token: &str) -> ClientResult<(GatewayHandle, GatewayEvents)> {
    let url = gateway_url(base_url, token);
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    info!("Gateway connected to {}", base_url);

    let (mut sink, mut stream) = ws_stream.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<GatewayCommand>();
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            let text = match serde_json::to_string(&command) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize gateway command: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                warn!("Gateway send failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<GatewayEvent>(&text) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Unreadable gateway event: {}", e),
                },
                Ok(Message::Close(frame)) => {
                    debug!("Gateway closed: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Gateway read failed: {}", e);
                    break;
                }
            }
        }
    });

    Ok((
        GatewayHandle { commands: command_tx },
        GatewayEvents {
            events: event_rx,
            reader,
            writer,
        },
    ))
}
