use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt, future};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::AppState;
use crate::stream::{ServerFrame, StreamOptions, parse_client_frame, serve_connection};

const OUTBOUND_CAPACITY: usize = 256;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, source) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!("WebSocket send failed, client gone");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = source
        .take_while(|msg| {
            future::ready(matches!(msg, Ok(message) if !matches!(message, Message::Close(_))))
        })
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(parse_client_frame(text.as_str())),
                _ => None,
            })
        });

    let options = StreamOptions {
        queue_timeout: state.stream_queue_timeout,
    };
    serve_connection(state.gateway, Box::pin(inbound), tx, options).await;

    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }
}
