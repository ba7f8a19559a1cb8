use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::jwt::AuthUser;
use crate::state::AppState;

/// Frame pushed to every connected client when a meal's reconciliation
/// lands. Clients re-fetch the record and any aggregates on receipt.
#[derive(Debug, Clone, Serialize)]
pub struct MealEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub meal_id: Uuid,
}

/// Fan-out registry for meal change events. Owned by `AppState` and
/// passed to whatever layer completes a reconciliation; there is no
/// global sender.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<MealEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MealEvent> {
        self.tx.subscribe()
    }

    /// Best-effort broadcast; an error only means nobody is listening.
    pub fn meal_updated(&self, meal_id: Uuid) {
        let event = MealEvent {
            kind: "meal_updated",
            meal_id,
        };
        if self.tx.send(event).is_err() {
            debug!(%meal_id, "meal_updated event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let mut events = state.notifier.subscribe();
    debug!(
        %user_id,
        subscribers = state.notifier.subscriber_count(),
        "push subscriber connected"
    );
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "failed to encode meal event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // A slow client misses events; it reconciles by re-fetching,
                // not by replay.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%user_id, skipped, "push subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(%user_id, "push subscriber disconnected");
}
