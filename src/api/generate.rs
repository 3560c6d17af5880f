//! Content-generation handlers: non-streaming `generateContent` and the
//! server-sent-event framing for `streamGenerateContent` (§4.11, §6.1).

use hyper::{Body, Request, Response, StatusCode};
use log::info;
use serde_json::Value;
use std::time::Duration;

use crate::api::AppState;
use crate::broker::PollOutcome;
use crate::error::{BrokerError, Result};

const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(200);

async fn read_json_body(req: Request<Body>) -> Result<Value> {
    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| BrokerError::Internal(e.into()))?;
    serde_json::from_slice(&bytes).map_err(|e| BrokerError::Internal(anyhow::Error::new(e)))
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("building a JSON response from a known-valid status/body never fails")
}

/// `POST /v1beta/models/{model}:generateContent`
pub async fn generate(state: &AppState, req: Request<Body>, model: &str) -> Result<Response<Body>> {
    let mut payload = read_json_body(req).await?;
    if let Value::Object(map) = &mut payload {
        map.entry("model").or_insert_with(|| Value::String(model.to_string()));
    }
    let result = state.orchestrator.handle("generateContent", payload).await?;
    info!("generateContent for model {} resolved", model);
    Ok(json_response(StatusCode::OK, result))
}

/// `POST /v1beta/models/{model}:streamGenerateContent` — each chunk is
/// flushed as one `data: <json>\n\n` SSE frame, per §4.11.
pub async fn stream_generate(state: &AppState, req: Request<Body>, model: &str) -> Result<Response<Body>> {
    let mut payload = read_json_body(req).await?;
    if let Value::Object(map) = &mut payload {
        map.entry("model").or_insert_with(|| Value::String(model.to_string()));
    }
    let mut handle = state.orchestrator.handle_streaming("streamGenerateContent", payload).await?;

    let (mut sender, body) = Body::channel();
    let model = model.to_string();
    tokio::spawn(async move {
        loop {
            match handle.poll_next(STREAM_POLL_INTERVAL).await {
                PollOutcome::Chunk(chunk) => {
                    let frame = format!("data: {}\n\n", chunk);
                    if sender.send_data(frame.into()).await.is_err() {
                        handle.cancel().await;
                        break;
                    }
                }
                PollOutcome::Pending => {
                    if sender.send_data(Vec::new().into()).await.is_err() {
                        handle.cancel().await;
                        break;
                    }
                }
                PollOutcome::Ended => {
                    info!("streamGenerateContent for model {} ended", model);
                    break;
                }
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("building the SSE response never fails"))
}
