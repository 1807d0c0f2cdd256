use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::{ClientMessage, ServerMessage};
use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Create a channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let client_id = state.room_manager.register(tx);
    info!("WebSocket client connected: {}", client_id);

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("Received message from {}: {}", client_id, text);
                handle_message(&state, client_id, &text).await;
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnecting: {}", client_id);
                break;
            }
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by axum
                debug!("Received ping from {}", client_id);
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    // Clean up
    state.room_manager.unregister(client_id);
    send_task.abort();
    info!("WebSocket client disconnected: {}", client_id);
}

async fn handle_message(state: &AppState, client_id: Uuid, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_error(state, client_id, &format!("Invalid message: {}", e));
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { league_id } => subscribe(state, client_id, league_id).await,
        ClientMessage::Unsubscribe { league_id } => {
            state.room_manager.unsubscribe(client_id, &league_id);
            debug!("Client {} unsubscribed from {}", client_id, league_id);
            send_message(state, client_id, &ServerMessage::Unsubscribed { league_id });
        }
    }
}

/// Join a league room and send the full standings before any delta.
async fn subscribe(state: &AppState, client_id: Uuid, league_id: String) {
    let computed = match state.leaderboard.snapshot_or_compute(&league_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("No leaderboard for {} on subscribe: {}", league_id, e);
            send_error(state, client_id, &format!("Leaderboard unavailable: {}", e));
            return;
        }
    };

    send_message(
        state,
        client_id,
        &ServerMessage::Subscribed {
            league_id: league_id.clone(),
        },
    );

    let leaderboard = &state.leaderboard;
    let joined = state.room_manager.subscribe(client_id, &league_id, || {
        // A recompute may have landed since `computed` was read.
        let latest = leaderboard.current_snapshot(&league_id).unwrap_or(computed);
        ServerMessage::LeaderboardSnapshot {
            data: (*latest).clone(),
        }
        .to_json()
    });

    if joined {
        debug!("Client {} subscribed to {}", client_id, league_id);
    }
}

fn send_message(state: &AppState, client_id: Uuid, msg: &ServerMessage) {
    if let Some(json) = msg.to_json() {
        state.room_manager.send_to(client_id, json);
    }
}

fn send_error(state: &AppState, client_id: Uuid, error: &str) {
    let msg = ServerMessage::Error {
        error: error.to_string(),
    };
    send_message(state, client_id, &msg);
}
