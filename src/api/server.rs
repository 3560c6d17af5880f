//! The HTTP Surface's socket owner: routes requests per §6.1, applies CORS
//! and structured logging, and maps every `BrokerError` to its documented
//! status code and body shape.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{debug, info};
use serde_json::json;

use crate::api::{executor_channel, files, generate, models, AppState};
use crate::config::CorsOrigins;
use crate::error::BrokerError;

/// Binds the configured listen address and serves until `shutdown` resolves.
pub async fn serve(state: Arc<AppState>, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let addr: SocketAddr = state.config.listen;
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req))) }
    });

    info!("listening on {}", addr);
    Server::bind(&addr).serve(make_svc).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn handle(state: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req.headers().get(hyper::header::ORIGIN).and_then(|v| v.to_str().ok()).map(String::from);

    let mut response = if method == Method::OPTIONS {
        preflight_response()
    } else {
        route(&state, req).await.unwrap_or_else(|err| error_response(&err))
    };

    apply_cors(&mut response, &state, origin.as_deref());

    let elapsed = start.elapsed();
    debug!("{} {} -> {} in {:?}", method, path, response.status(), elapsed);
    info!("{} {} {}", method, path, response.status());

    Ok(response)
}

fn preflight_response() -> Response<Body> {
    Response::builder().status(StatusCode::NO_CONTENT).body(Body::empty()).expect("building the preflight response never fails")
}

fn apply_cors(response: &mut Response<Body>, state: &AppState, origin: Option<&str>) {
    let headers = response.headers_mut();
    let allow_value = match (&state.config.cors_origins, origin) {
        (CorsOrigins::Any, _) if !state.config.cors_credentials => Some("*".to_string()),
        (CorsOrigins::Any, Some(origin)) => Some(origin.to_string()),
        (CorsOrigins::List(_), Some(origin)) if state.config.cors_origins.allows(origin) => Some(origin.to_string()),
        _ => None,
    };
    if let Some(allow_value) = allow_value {
        if let Ok(value) = HeaderValue::from_str(&allow_value) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    if state.config.cors_credentials {
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    }
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type, X-Goog-Upload-Offset, X-Goog-Upload-Command"));
}

fn error_response(err: &BrokerError) -> Response<Body> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = err.to_error_body();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("building an error response from a known-valid status/body never fails")
}

/// Splits a route segment's trailing `:action` suffix, as used by
/// `{model}:generateContent` and `{token}:download`.
fn split_action(segment: &str) -> (&str, Option<&str>) {
    match segment.rsplit_once(':') {
        Some((name, action)) => (name, Some(action)),
        None => (segment, None),
    }
}

async fn route(state: &Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, BrokerError> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["healthz"]) => Ok(healthz(state)),

        ("GET", ["executor", "connect"]) => executor_channel::accept(state.clone(), req).await,

        ("GET", ["v1beta", "models"]) => models::list(state, req).await,
        ("GET", ["v1beta", "models", name]) => models::get(state, req, name).await,
        ("POST", ["v1beta", "models", action_segment]) => {
            let (model, action) = split_action(action_segment);
            match action {
                Some("generateContent") => generate::generate(state, req, model).await,
                Some("streamGenerateContent") => generate::stream_generate(state, req, model).await,
                _ => Err(BrokerError::NotFound(path)),
            }
        }

        ("POST", ["upload", "v1beta", "files"]) => files::init_upload(state, req).await,
        ("PUT", ["v1beta", "files", "upload", session]) | ("POST", ["v1beta", "files", "upload", session]) => {
            files::upload_chunk(state, req, session).await
        }
        ("POST", ["v1beta", action_segment]) => {
            let (resource, action) = split_action(action_segment);
            match (resource, action) {
                ("files", Some("uploadFromUrl")) => files::upload_from_url(state, req).await,
                _ => Err(BrokerError::NotFound(path)),
            }
        }
        ("GET", ["v1beta", "files"]) => files::list(state, req).await,
        ("GET", ["v1beta", "files", "internal", digest, action_segment]) => {
            let (token, action) = split_action(action_segment);
            match action {
                Some("download") => files::internal_download(state, digest, token).await,
                _ => Err(BrokerError::NotFound(path)),
            }
        }
        ("GET", ["v1beta", "files", name]) => files::get(state, req, name).await,
        ("DELETE", ["v1beta", "files", name]) => files::delete(state, name).await,

        _ => Err(BrokerError::NotFound(path)),
    }
}

fn healthz(state: &AppState) -> Response<Body> {
    let body = json!({
        "status": "ok",
        "executors": state.executors.count(),
        "cacheEntries": state.registry.entry_count(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("building the healthz response never fails")
}
