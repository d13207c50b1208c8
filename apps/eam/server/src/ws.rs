use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::routes::AppState;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut outbound = state.hub.register(connection_id);
    info!(connection_id = %connection_id, "client connected");

    // Ends once the hub drops the sender; queued frames go out before Close.
    let mut writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            let text = String::from_utf8_lossy(&payload).into_owned();
            if ws_tx.send(Message::Text(text)).await.is_err() {
                debug!(connection_id = %connection_id, "writer task finished early");
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        debug!(connection_id = %connection_id, "writer task finished");
    });

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(connection_id = %connection_id, "server shutting down; closing read loop");
                break;
            }
            frame = ws_rx.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        match frame {
            Ok(Message::Text(text)) => {
                state.controller.handle(connection_id, text.as_bytes()).await;
            }
            Ok(Message::Binary(bytes)) => {
                state.controller.handle(connection_id, &bytes).await;
            }
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    state.hub.unregister(connection_id);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(connection_id = %connection_id, "writer did not drain in time");
        writer.abort();
    }
    info!(connection_id = %connection_id, "client disconnected");
}
