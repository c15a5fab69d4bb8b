use crate::app_state::AppState;
use crate::registry::Outbound;
use crate::session::{run_session, Inbound};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

// Délai laissé à l'écrivain pour vider la trame de fermeture.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, mut outbound) = state.hub.connect().await;
    let conn = handle.id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (message, last) = match frame {
                Outbound::Text(text) => (Message::Text(text.to_string().into()), false),
                Outbound::Ping => (Message::Ping(Bytes::new()), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if ws_sender.send(message).await.is_err() || last {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => Inbound::Text(text.to_string()),
                Ok(Message::Pong(_)) => Inbound::Pong,
                Ok(Message::Close(_)) | Err(_) => Inbound::Close,
                // axum répond lui-même aux pings du client.
                Ok(_) => continue,
            };
            let closing = frame == Inbound::Close;
            if inbound_tx.send(frame).is_err() || closing {
                break;
            }
        }
    });

    let reason = run_session(state.hub.clone(), handle, inbound_rx).await;
    recv_task.abort();

    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
    debug!(conn = %conn, reason = ?reason, "Socket released");
}
