//! The Executor Channel Listener (§4.12): accepts one WebSocket per
//! executor, feeds inbound frames to the Correlation Layer, and drains a
//! per-executor outbound queue so `Dispatcher` writes never block on socket
//! I/O.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::{Body, Request, Response, StatusCode};
use log::{info, warn};
use openssl::sha::Sha1;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::api::AppState;
use crate::broker::OutboundFrame;
use crate::error::{BrokerError, Result};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::encode(hasher.finish())
}

fn query_param<'a>(req: &'a Request<Body>, key: &str) -> Option<String> {
    req.uri()
        .query()
        .and_then(|q| url::form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k == key).map(|(_, v)| v.into_owned()))
}

/// `GET /executor/connect?id=<executor-id>` — upgrades to a WebSocket and
/// hands the connection off to a pair of read/write pump tasks.
pub async fn accept(state: Arc<AppState>, mut req: Request<Body>) -> Result<Response<Body>> {
    let executor_id = query_param(&req, "id")
        .ok_or_else(|| BrokerError::InvalidCommand("executor connect requires ?id=".to_string()))?;

    let is_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_upgrade || !is_websocket {
        return Err(BrokerError::InvalidCommand("expected a WebSocket upgrade request".to_string()));
    }
    let client_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BrokerError::InvalidCommand("missing Sec-WebSocket-Key".to_string()))?
        .to_string();

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, tokio_tungstenite::tungstenite::protocol::Role::Server, None).await;
                run_executor_socket(state, executor_id, ws).await;
            }
            Err(err) => warn!("executor {} upgrade failed: {}", executor_id, err),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept_key(&client_key))
        .body(Body::empty())
        .expect("building a 101 response never fails"))
}

async fn run_executor_socket<S>(state: Arc<AppState>, executor_id: String, ws: WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE_CAPACITY);
    state.executors.connect(executor_id.clone(), tx);
    info!("executor {} connected", executor_id);

    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(err) => {
                warn!("executor {} read error: {}", executor_id, err);
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                warn!("executor {} sent malformed frame: {}", executor_id, err);
                continue;
            }
        };
        let rid = match frame.get("id").and_then(Value::as_str) {
            Some(rid) => rid.to_string(),
            None => {
                warn!("executor {} frame missing id", executor_id);
                continue;
            }
        };
        let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
        let status = frame.get("status").cloned();
        state.correlation.handle_inbound(&rid, payload, status);
    }

    write_task.abort();
    if let Some(handle) = state.executors.disconnect(&executor_id) {
        drop(handle);
    }
    for rid in state.correlation.requests_for_executor(&executor_id) {
        state.correlation.cleanup(&rid);
    }
    info!("executor {} disconnected", executor_id);
}
