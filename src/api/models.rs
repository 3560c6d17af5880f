//! `GET /v1beta/models` and `GET /v1beta/models/{name}` — proxied verbatim
//! to whichever executor round-robin picks next; no file references to
//! extract or schedule, so these bypass the Orchestrator entirely.

use hyper::{Body, Request, Response, StatusCode};
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::Result;

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("building a JSON response from a known-valid status/body never fails")
}

pub async fn list(state: &AppState, _req: Request<Body>) -> Result<Response<Body>> {
    let executor = state.executors.next()?;
    let result = state.dispatcher.dispatch_non_streaming(&executor, "listModels", json!({})).await?;
    Ok(json_response(StatusCode::OK, result))
}

pub async fn get(state: &AppState, _req: Request<Body>, name: &str) -> Result<Response<Body>> {
    let executor = state.executors.next()?;
    let result = state
        .dispatcher
        .dispatch_non_streaming(&executor, "getModel", json!({ "name": name }))
        .await?;
    Ok(json_response(StatusCode::OK, result))
}
