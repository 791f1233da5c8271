//! WebSocket event broadcast for the dashboard.
//!
//! Clients subscribe with their last-seen cursor and receive missed domain
//! events in order, then the live tail, interleaved with conversation
//! entries. Each connection owns a bounded outbound queue; a subscriber that
//! cannot keep up is disconnected rather than allowed to block fan-out, and
//! resumes by cursor on reconnect.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use shared_types::{Event, EventType, InboxItem, TaskStatus};

use crate::actors::{EventStoreMsg, StoredEvent};
use crate::app_state::AppState;
use crate::conversation::ConversationEntry;

use super::ApiState;

/// Outbound queue depth per subscriber; overflow disconnects the subscriber.
const OUTBOUND_DEPTH: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientMessage {
    Subscribe {
        #[serde(default)]
        from_seq: i64,
        #[serde(default)]
        conversation_after: u64,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerMessage {
    Subscribed { from_seq: i64 },
    TaskUpdate(TaskUpdateData),
    InboxItem(InboxItem),
    BuilderStatus(BuilderStatusData),
    ConversationEntry(ConversationEntry),
    Pong,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskUpdateData {
    pub task_id: String,
    pub seq: i64,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    pub payload: serde_json::Value,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuilderStatusData {
    pub session_id: String,
    pub task_id: String,
    pub seq: i64,
    pub status: serde_json::Value,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    let app = state.app.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    tracing::info!("WebSocket connection established");

    let (mut sink, mut incoming) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(Ok(msg)) = incoming.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<WsClientMessage>(&text) {
                Ok(WsClientMessage::Ping) => {
                    let _ = send_json(&tx, &WsServerMessage::Pong);
                }
                Ok(WsClientMessage::Subscribe { from_seq, conversation_after }) => {
                    if let Some(previous) = forwarder.take() {
                        previous.abort();
                    }
                    let _ = send_json(&tx, &WsServerMessage::Subscribed { from_seq });
                    forwarder = Some(spawn_forwarder(
                        app.clone(),
                        tx.clone(),
                        from_seq,
                        conversation_after,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid WebSocket message");
                    let _ = send_json(
                        &tx,
                        &WsServerMessage::Error { message: format!("invalid message: {e}") },
                    );
                }
            },
            Message::Ping(data) => {
                let _ = tx.try_send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    writer.abort();
    tracing::info!("WebSocket connection closed");
}

/// Stream domain events (replay then live tail) and conversation entries to
/// one subscriber. Ends when the subscriber's queue overflows or closes.
fn spawn_forwarder(
    app: AppState,
    tx: mpsc::Sender<Message>,
    from_seq: i64,
    conversation_after: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut store_rx = match ractor::call!(app.event_store(), |reply| {
            EventStoreMsg::Subscribe { from_seq, reply }
        }) {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => {
                let _ = send_json(&tx, &WsServerMessage::Error { message: e.to_string() });
                return;
            }
            Err(e) => {
                let _ = send_json(&tx, &WsServerMessage::Error { message: e.to_string() });
                return;
            }
        };

        let conversation = app.conversation();
        let mut conv_rx = conversation.subscribe();
        // Entries can race between the backlog read and the live tail;
        // tracking the cursor keeps delivery exactly-once and in order.
        let mut conv_cursor = conversation_after;
        for entry in conversation.entries_after(conversation_after).await {
            conv_cursor = conv_cursor.max(entry.cursor);
            if !send_json(&tx, &WsServerMessage::ConversationEntry(entry)) {
                return;
            }
        }

        loop {
            tokio::select! {
                stored = store_rx.recv() => {
                    let Some(stored) = stored else { return };
                    for message in map_stored_event(&app, stored).await {
                        if !send_json(&tx, &message) {
                            tracing::warn!("Disconnecting slow WebSocket subscriber");
                            return;
                        }
                    }
                }
                entry = conv_rx.recv() => {
                    match entry {
                        Ok(entry) => {
                            if entry.cursor <= conv_cursor {
                                continue;
                            }
                            conv_cursor = entry.cursor;
                            if !send_json(&tx, &WsServerMessage::ConversationEntry(entry)) {
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Subscriber lagged on conversation feed");
                            return;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    })
}

/// Map one committed event onto broadcast messages. A task-scoped event
/// yields a task_update (with the task's current status), builder events add
/// a builder_status, and any transactional inbox item rides along.
async fn map_stored_event(app: &AppState, stored: StoredEvent) -> Vec<WsServerMessage> {
    let mut out = Vec::new();
    let event = &stored.event;

    if let Some(task_id) = &event.task_id {
        let status = ractor::call!(app.event_store(), |reply| EventStoreMsg::GetTask {
            task_id: task_id.clone(),
            reply
        })
        .ok()
        .flatten()
        .map(|t| t.status);

        out.push(WsServerMessage::TaskUpdate(TaskUpdateData {
            task_id: task_id.clone(),
            seq: event.seq,
            event_type: event.event_type,
            status,
            payload: event.payload.clone(),
            time: event.time,
        }));

        if let Some(data) = builder_status_data(event) {
            out.push(WsServerMessage::BuilderStatus(data));
        }
    }

    if let Some(item) = stored.inbox {
        out.push(WsServerMessage::InboxItem(item));
    }

    out
}

fn builder_status_data(event: &Event) -> Option<BuilderStatusData> {
    if !matches!(
        event.event_type,
        EventType::BuilderDispatched | EventType::BuilderStatusChanged
    ) {
        return None;
    }
    let session_id = event.payload.get("session_id")?.as_str()?.to_string();
    let status = match event.event_type {
        EventType::BuilderDispatched => serde_json::json!("created"),
        _ => event.payload.get("status").cloned().unwrap_or(serde_json::Value::Null),
    };
    Some(BuilderStatusData {
        session_id,
        task_id: event.task_id.clone().unwrap_or_default(),
        seq: event.seq,
        status,
    })
}

fn send_json(tx: &mpsc::Sender<Message>, msg: &WsServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => tx.try_send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize WebSocket message");
            false
        }
    }
}
