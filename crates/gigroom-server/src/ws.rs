//! WebSocket transport for the realtime gateway.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gigroom_shared::protocol::{InboundFrame, ServerEvent};
use gigroom_shared::{ConnectionId, UserId};

use crate::auth::{bearer_token, JwtConfig, JwtError};
use crate::error::ServerError;
use crate::gateway::Gateway;

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    token: Option<String>,
}

/// `GET /ws`. The token comes from the `Authorization` header or, for
/// browsers, the `token` query parameter. No valid token, no upgrade.
pub async fn chat_ws(
    State(gateway): State<Arc<Gateway>>,
    State(jwt): State<Arc<JwtConfig>>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let actor = match authenticate(&jwt, &headers, query.token.as_deref()) {
        Ok(actor) => actor,
        Err(e) => return ServerError::from(e).into_response(),
    };

    ws.on_upgrade(move |socket| run_connection(gateway, actor, socket))
}

fn authenticate(
    jwt: &JwtConfig,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<UserId, JwtError> {
    let token = match bearer_token(headers)? {
        Some(token) => token,
        None => query_token
            .filter(|t| !t.is_empty())
            .ok_or(JwtError::MissingToken)?,
    };
    jwt.validate_token(token)
}

async fn run_connection(gateway: Arc<Gateway>, actor: UserId, socket: WebSocket) {
    let (conn, outbound) = gateway.connect(actor);
    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(write_loop(conn, outbound, sink));

    // One frame at a time: each event is fully handled before the next one
    // from this connection is read.
    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<InboundFrame>(text.as_str()) {
                Ok(frame) => gateway.dispatch(conn, frame).await,
                Err(e) => gateway.reject_frame(conn, &e.to_string()),
            },
            Ok(WsMessage::Binary(_)) => gateway.reject_frame(conn, "binary frames are not supported"),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    // Dropping the peer closes its queue, which ends the writer.
    gateway.disconnect(conn);
    if let Err(e) = writer.await {
        warn!(conn = %conn, error = %e, "WebSocket writer task failed");
    }
}

async fn write_loop(
    conn: ConnectionId,
    mut outbound: mpsc::Receiver<ServerEvent>,
    mut sink: futures::stream::SplitSink<WebSocket, WsMessage>,
) {
    while let Some(event) = outbound.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = %conn, event = event.name(), error = %e, "Failed to encode event");
                continue;
            }
        };
        if sink.send(WsMessage::Text(text.into())).await.is_err() {
            debug!(conn = %conn, "WebSocket closed while sending");
            break;
        }
    }
    let _ = sink.close().await;
}
