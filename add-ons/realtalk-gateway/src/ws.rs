//! `/ws` upgrade handler: adapts an axum WebSocket to the engine's transport-neutral frames.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{future, SinkExt, StreamExt};
use realtalk_voice::{run_connection, InboundFrame};
use tracing::{debug, info};
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    let _guard = state.track_connection();
    info!(
        target: "realtalk::ws",
        session_id = %session_id,
        active = state.active_connections(),
        "🔌 Client connected"
    );

    let (sink, stream) = socket.split();
    let inbound = Box::pin(stream.filter_map(|message| future::ready(to_inbound(message))));
    let outbound = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));

    run_connection(session_id.clone(), &state.deps, inbound, outbound).await;
    info!(target: "realtalk::ws", session_id = %session_id, "🔌 Client disconnected");
}

fn to_inbound(message: Result<Message, axum::Error>) -> Option<InboundFrame> {
    match message {
        Ok(Message::Binary(bytes)) => Some(InboundFrame::Binary(bytes)),
        Ok(Message::Text(text)) => Some(InboundFrame::Text(text)),
        Ok(Message::Close(_)) => Some(InboundFrame::Close),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => {
            debug!(target: "realtalk::ws", "Socket read error: {}", e);
            Some(InboundFrame::Close)
        }
    }
}
