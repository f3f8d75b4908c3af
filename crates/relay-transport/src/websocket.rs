//! WebSocket bridge for operator views.
//!
//! Each connected view receives a snapshot of the active sessions, then the
//! event history followed by live [`RelayEvent`]s, and may send
//! [`OperatorCommand`]s back.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, future, stream::BoxStream};
use relay_core::{EventStore, OperatorCommand, RelayEvent, SessionInfo};
use serde::Serialize;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Lists the currently active sessions.
pub type SessionsFn = Arc<dyn Fn() -> Vec<SessionInfo> + Send + Sync>;

/// Operator bridge state.
#[derive(Clone)]
pub struct OperatorState {
    /// Event source for views.
    pub events: Arc<EventStore>,
    /// Queue consumed by the relay server.
    pub commands: mpsc::Sender<OperatorCommand>,
    /// Active sessions, sent to each view on attach. History alone may have
    /// lost the `connected` event of a long-lived session.
    pub sessions: SessionsFn,
}

impl OperatorState {
    /// Create new bridge state.
    #[must_use]
    pub fn new(
        events: Arc<EventStore>,
        commands: mpsc::Sender<OperatorCommand>,
        sessions: SessionsFn,
    ) -> Self {
        Self {
            events,
            commands,
            sessions,
        }
    }

    /// Frames for a newly attached view: the session snapshot, then history
    /// and live events.
    ///
    /// Subscribes before taking the snapshot, so a session that disconnects
    /// in between still gets its `disconnected` event.
    fn view_stream(&self) -> BoxStream<'static, ViewFrame> {
        let events = self.events.history_plus_stream();
        let snapshot = ViewFrame::Notice(BridgeNotice::Sessions {
            sessions: (self.sessions)(),
        });
        futures::stream::once(future::ready(snapshot))
            .chain(events.map(ViewFrame::Event))
            .boxed()
    }
}

/// Frames sent to a view besides relay events.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum ViewFrame {
    Event(RelayEvent),
    Notice(BridgeNotice),
}

/// Replies addressed to one view only.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum BridgeNotice {
    /// Sessions active when the view attached.
    Sessions { sessions: Vec<SessionInfo> },
    CommandRejected { message: String },
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<OperatorState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: OperatorState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for replies to this view only
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<BridgeNotice>();

    let mut frames = state.view_stream();
    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = frames.next() => frame,
                Some(notice) = notice_rx.recv() => ViewFrame::Notice(notice),
                else => break,
            };
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize view frame: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("Operator WebSocket error: {e}");
                break;
            }
        };

        let command: OperatorCommand = match serde_json::from_str(&msg) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Invalid operator command: {e}");
                let _ = notice_tx.send(BridgeNotice::CommandRejected {
                    message: format!("Invalid command: {e}"),
                });
                continue;
            }
        };

        if state.commands.send(command).await.is_err() {
            tracing::warn!("Relay server is no longer accepting commands");
            break;
        }
    }

    send_task.abort();
}

/// Create the operator router, serving the bridge at `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_operator_router(events, command_tx, sessions));
/// ```
#[must_use]
pub fn create_operator_router(
    events: Arc<EventStore>,
    commands: mpsc::Sender<OperatorCommand>,
    sessions: SessionsFn,
) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(OperatorState::new(events, commands, sessions))
}
