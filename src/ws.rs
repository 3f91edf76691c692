// src/ws.rs
//! `/cable`: live poll updates over a websocket.
//!
//! Every connection listens on the global topic. A `poll_id` query parameter
//! or a `subscribe_to_poll` message adds that poll's topic. Each topic gets its
//! own forwarding task; all of them feed one writer task that owns the sink.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{bearer_token, Identity};
use crate::broadcast::{poll_topic, Broadcaster, GLOBAL_TOPIC};
use crate::error::{ApiError, PollError};
use crate::models::PollId;
use crate::routes::AppState;
use crate::services::PollService;

const OUTBOUND_BUFFER: usize = 64;
const RETRY_LATER: &str = "Subscription failed, try again";

#[derive(Debug, Deserialize)]
pub struct CableParams {
    token: Option<String>,
    poll_id: Option<PollId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeToPoll { poll_id: PollId },
    UnsubscribeFromPoll { poll_id: PollId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SubscriptionConfirmed { poll_id: PollId, message: String },
    UnsubscriptionConfirmed { poll_id: PollId, message: String },
    Error { message: String },
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(err) => {
                warn!(error = %err, "failed to encode server message");
                None
            }
        }
    }
}

pub async fn cable(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<CableParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = params
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers))
        .ok_or(PollError::Unauthorized)?;
    let identity = state.authenticator.authenticate(token).await?;

    Ok(ws.on_upgrade(move |socket| connection(socket, state, identity, params.poll_id)))
}

async fn connection(socket: WebSocket, state: AppState, identity: Identity, poll_id: Option<PollId>) {
    let (mut sink, mut stream) = socket.split();
    let (out, mut outbound) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut subscriptions = Subscriptions::new(Arc::clone(&state.broadcaster), out.clone());
    subscriptions.subscribe(GLOBAL_TOPIC);
    info!(user_id = %identity.user_id, ?poll_id, "cable connected");

    if let Some(poll_id) = poll_id {
        match initial_poll(&state.service, poll_id).await {
            InitialPoll::Found => subscriptions.subscribe(&poll_topic(poll_id)),
            // The connection stays up on the global topic; the client may retry.
            InitialPoll::Unavailable => {
                if let Some(frame) = ServerMessage::error(RETRY_LATER).to_frame() {
                    let _ = out.send(frame).await;
                }
            }
            InitialPoll::Missing => {
                debug!(%poll_id, "rejecting subscription to unknown poll");
                drop(subscriptions);
                if let Some(frame) = ServerMessage::error("Poll not found").to_frame() {
                    let _ = out.send(frame).await;
                }
                let _ = out
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: Utf8Bytes::from_static("poll not found"),
                    })))
                    .await;
                drop(out);
                let _ = writer.await;
                return;
            }
        }
    }

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let reply = subscriptions.handle(&state.service, text.as_str()).await;
                if let Some(frame) = reply.to_frame() {
                    if out.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // The writer stops once every sender, including the forwarders' clones, is gone.
    drop(subscriptions);
    drop(out);
    let _ = writer.await;
    info!(user_id = %identity.user_id, "cable disconnected");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitialPoll {
    Found,
    Missing,
    Unavailable,
}

/// Looks up the poll named in the connection's query string.
async fn initial_poll(service: &PollService, poll_id: PollId) -> InitialPoll {
    match service.poll_exists(poll_id).await {
        Ok(true) => InitialPoll::Found,
        Ok(false) => InitialPoll::Missing,
        Err(err) => {
            warn!(%poll_id, error = %err, "initial subscription lookup failed");
            InitialPoll::Unavailable
        }
    }
}

/// Topics one connection listens on, each drained by its own forwarding task.
pub struct Subscriptions {
    broadcaster: Arc<Broadcaster>,
    out: mpsc::Sender<Message>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Subscriptions {
    pub fn new(broadcaster: Arc<Broadcaster>, out: mpsc::Sender<Message>) -> Self {
        Self {
            broadcaster,
            out,
            forwarders: HashMap::new(),
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.forwarders.keys().map(String::as_str)
    }

    /// Starts forwarding `topic`. Subscribing twice is a no-op.
    pub fn subscribe(&mut self, topic: &str) {
        if self.forwarders.contains_key(topic) {
            return;
        }
        let mut events = self.broadcaster.subscribe(topic);
        let out = self.out.clone();
        let name = topic.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(envelope) => {
                        let json = match serde_json::to_string(envelope.as_ref()) {
                            Ok(json) => json,
                            Err(err) => {
                                warn!(topic = %name, error = %err, "failed to encode event");
                                continue;
                            }
                        };
                        if out.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %name, skipped, "subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.insert(topic.to_string(), forwarder);
    }

    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        match self.forwarders.remove(topic) {
            Some(forwarder) => {
                forwarder.abort();
                true
            }
            None => false,
        }
    }

    /// Applies one client frame and returns the reply to send back.
    pub async fn handle(&mut self, service: &PollService, text: &str) -> ServerMessage {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "unreadable cable message");
                return ServerMessage::error("Unknown or malformed action");
            }
        };

        match message {
            ClientMessage::SubscribeToPoll { poll_id } => match service.poll(poll_id).await {
                Ok(poll) => {
                    self.subscribe(&poll_topic(poll_id));
                    ServerMessage::SubscriptionConfirmed {
                        poll_id,
                        message: format!("Subscribed to poll: {}", poll.title),
                    }
                }
                Err(PollError::NotFound { .. }) => ServerMessage::error("Poll not found"),
                Err(err) => {
                    warn!(%poll_id, error = %err, "subscription lookup failed");
                    ServerMessage::error(RETRY_LATER)
                }
            },
            ClientMessage::UnsubscribeFromPoll { poll_id } => {
                self.unsubscribe(&poll_topic(poll_id));
                ServerMessage::UnsubscriptionConfirmed {
                    poll_id,
                    message: "Unsubscribed from poll".to_string(),
                }
            }
        }
    }

    pub fn close(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged_by_action() {
        let poll_id = PollId::new();
        let text = format!(r#"{{"action":"subscribe_to_poll","poll_id":"{poll_id}"}}"#);
        assert_eq!(
            serde_json::from_str::<ClientMessage>(&text).unwrap(),
            ClientMessage::SubscribeToPoll { poll_id }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"speak"}"#).is_err());
    }

    #[test]
    fn server_messages_are_tagged_by_type() {
        let json = serde_json::to_value(ServerMessage::error("Poll not found")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "Poll not found");
    }

    #[tokio::test]
    async fn subscribing_twice_keeps_one_forwarder() {
        let broadcaster = Arc::new(Broadcaster::default());
        let (out, _rx) = mpsc::channel(8);
        let mut subscriptions = Subscriptions::new(Arc::clone(&broadcaster), out);

        subscriptions.subscribe(GLOBAL_TOPIC);
        subscriptions.subscribe(GLOBAL_TOPIC);
        assert_eq!(subscriptions.topics().count(), 1);
        assert_eq!(broadcaster.subscriber_count(GLOBAL_TOPIC), 1);

        assert!(subscriptions.unsubscribe(GLOBAL_TOPIC));
        assert!(!subscriptions.unsubscribe(GLOBAL_TOPIC));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_is_not_reported_as_a_missing_poll() {
        use crate::clock::ManualClock;
        use crate::services::ServiceSettings;
        use crate::store::{MemoryStore, Store};
        use std::time::Duration;

        let store = MemoryStore::new();
        let service = PollService::new(
            Arc::new(store.clone()),
            Arc::new(Broadcaster::default()),
            Arc::new(ManualClock::new(chrono::Utc::now())),
            ServiceSettings {
                storage_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );

        assert_eq!(initial_poll(&service, PollId::new()).await, InitialPoll::Missing);

        // An open transaction holds the tables, so the lookup runs into the timeout.
        let tx = store.begin().await.unwrap();
        assert_eq!(initial_poll(&service, PollId::new()).await, InitialPoll::Unavailable);
        drop(tx);
    }
}
