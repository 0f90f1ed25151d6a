//! `/buffers` WebSocket endpoint.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{aggregator::BufferAggregator, protocol::Outbound, routes::AppState};

pub async fn buffers_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let aggregator = state.aggregator.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, aggregator))
}

async fn handle_socket(socket: WebSocket, aggregator: Arc<BufferAggregator>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Single queue per client: text and binary frames stay in send order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Binary(data) => Message::Binary(data),
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let client_id = aggregator.handle_client_connection(tx);

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                aggregator
                    .handle_client_message(client_id, text.as_str())
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%client_id, "WebSocket error: {e}");
                break;
            }
        }
    }

    aggregator.handle_client_disconnect(client_id);
    send_task.abort();
}
