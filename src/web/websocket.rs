//! WebSocket handler streaming the live log tail.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt, future};

use crate::context::AppContext;
use crate::tail::{self, TailCursor};

/// Handle WebSocket upgrade requests
pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Follow the log file for one viewer until it leaves or the server stops.
async fn handle_socket(socket: WebSocket, ctx: AppContext) {
    let subscription = ctx.registry.register();
    let token = subscription.token().clone();
    tracing::debug!(id = subscription.id(), "Accepted WebSocket connection");

    let (sender, mut receiver) = socket.split();

    // Viewers never send anything meaningful; only watch for them leaving.
    let reader_token = token.clone();
    let reader = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
        reader_token.cancel();
    });

    let mut sender = sender.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });

    match TailCursor::open(ctx.config.log_file()).await {
        Ok(cursor) => {
            tail::live_tail(cursor, ctx.config.tail_interval(), token.clone(), &mut sender).await;
        }
        Err(e) => {
            tracing::debug!(error = %e, "Failed to open log file for live tail");
            let _ = sender.send(tail::placeholder(&e)).await;
        }
    }

    let mut sender = sender.into_inner();
    let close = CloseFrame {
        code: if ctx.shutdown.token().is_cancelled() {
            close_code::AWAY
        } else {
            close_code::NORMAL
        },
        reason: "".into(),
    };
    let _ = sender.send(Message::Close(Some(close))).await;

    reader.abort();
    tracing::debug!(id = subscription.id(), "WebSocket connection closed");
}
