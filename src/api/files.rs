//! File Store/Metadata Registry-backed handlers for the upload, list, get,
//! delete, and internal-download routes of §6.1.

use hyper::{Body, Request, Response, StatusCode};
use log::{info, warn};
use rand::RngCore;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::AppState;
use crate::cache::registry::{unix_time, CacheEntry};
use crate::cache::{ChunkOutcome, SessionMeta, UploadCommands};
use crate::digest::Digest;
use crate::error::{BrokerError, Result};
use crate::net::OutboundHttp;

const MAX_PAGE_SIZE: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 20;

fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

fn query_pairs(req: &Request<Body>) -> Vec<(String, String)> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    query_pairs(req).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn file_resource(entry: &CacheEntry, executor: Option<&str>) -> Value {
    let name = format!("files/{}", entry.digest.to_hex());
    let state = if entry.replication.values().any(|d| d.is_synced()) { "ACTIVE" } else { "PROCESSING" };
    let mut file = json!({
        "name": name,
        "displayName": entry.filename,
        "mimeType": entry.mime,
        "sizeBytes": entry.size.to_string(),
        "createTime": unix_time(entry.created_at),
        "state": state,
    });
    if let Some(expiration) = entry.expiration {
        file["expirationTime"] = json!(unix_time(expiration));
    }
    if let Some(executor) = executor {
        if let Some(descriptor) = entry.replication.get(executor) {
            if let Some(uri) = &descriptor.remote_uri {
                file["uri"] = json!(uri);
            }
        }
    }
    file
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("building a JSON response from a known-valid status/body never fails")
}

/// `POST /upload/v1beta/files` — session init (§6.1, §4.10 Upload Session).
pub async fn init_upload(state: &AppState, req: Request<Body>) -> Result<Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| BrokerError::Internal(e.into()))?;
    let body: Value = if bytes.is_empty() { json!({}) } else { serde_json::from_slice(&bytes).unwrap_or(json!({})) };
    let file = body.get("file").cloned().unwrap_or(json!({}));

    let meta = SessionMeta {
        declared_name: file.get("displayName").and_then(Value::as_str).map(String::from),
        declared_mime: file.get("mimeType").and_then(Value::as_str).map(String::from),
        declared_size: file
            .get("sizeBytes")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64())),
    };

    let session_id = Uuid::new_v4().to_string();
    state.ingest.create_session(session_id.clone(), meta);

    let upload_url = format!("{}/v1beta/files/upload/{}", state.config.proxy_base_url, session_id);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("X-Goog-Upload-URL", upload_url)
        .header("X-Goog-Upload-Status", "active")
        .body(Body::empty())
        .expect("building the upload-init response never fails"))
}

/// `PUT|POST /v1beta/files/upload/{session}` — one resumable-upload chunk.
pub async fn upload_chunk(state: &AppState, req: Request<Body>, session_id: &str) -> Result<Response<Body>> {
    let offset: u64 = header_str(&req, "X-Goog-Upload-Offset")
        .ok_or_else(|| BrokerError::InvalidCommand("missing X-Goog-Upload-Offset".to_string()))?
        .parse()
        .map_err(|_| BrokerError::InvalidCommand("X-Goog-Upload-Offset is not a number".to_string()))?;
    let commands = UploadCommands::parse(
        header_str(&req, "X-Goog-Upload-Command")
            .ok_or_else(|| BrokerError::InvalidCommand("missing X-Goog-Upload-Command".to_string()))?,
    )?;
    let content_type = header_str(&req, hyper::header::CONTENT_TYPE.as_str()).map(String::from);

    let data = hyper::body::to_bytes(req.into_body()).await.map_err(|e| BrokerError::Internal(e.into()))?;
    let outcome = state
        .ingest
        .append_chunk(session_id, offset, &data, &commands, content_type.as_deref())
        .await?;

    match outcome {
        ChunkOutcome::Continue { bytes_written } => Ok(Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header("X-Goog-Upload-Status", "active")
            .header("X-Goog-Upload-Offset", bytes_written.to_string())
            .body(Body::empty())
            .expect("building a 308 continue response never fails")),
        ChunkOutcome::Finalized { entry, already_existed } => {
            if !already_existed {
                state.registry.register_aliases(entry.digest, &[format!("files/{}", entry.digest.to_hex())]);
            }
            info!("upload session {} finalized as {}", session_id, entry.digest);
            let mut response = json_response(StatusCode::OK, json!({ "file": file_resource(&entry, None) }));
            response.headers_mut().insert("X-Goog-Upload-Status", "final".parse().unwrap());
            Ok(response)
        }
    }
}

/// `POST /v1beta/files:uploadFromUrl` — server-side fetch into the cache.
pub async fn upload_from_url(state: &AppState, req: Request<Body>) -> Result<Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| BrokerError::Internal(e.into()))?;
    let body: Value = serde_json::from_slice(&bytes)
        .map_err(|e| BrokerError::Internal(anyhow::Error::new(e)))?;
    let url = body
        .get("url")
        .or_else(|| body.get("fileUri"))
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidCommand("uploadFromUrl requires a url".to_string()))?
        .to_string();

    let client = OutboundHttp::new().map_err(BrokerError::Internal)?;
    let response = client.get(&url).await.map_err(|e| BrokerError::BadGateway(format!("fetching {}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(BrokerError::BadGateway(format!("{} returned {}", url, response.status())));
    }
    let content_type = response
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let id = Uuid::new_v4().to_string();
    let meta = SessionMeta {
        declared_name: body.get("displayName").and_then(Value::as_str).map(String::from),
        declared_mime: body.get("mimeType").and_then(Value::as_str).map(String::from),
        declared_size: None,
    };
    let body_stream = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| BrokerError::Internal(e.into()))?;
    let stream = tokio_stream::once(Ok::<_, std::io::Error>(body_stream));
    let (entry, already_existed) = state
        .ingest
        .ingest_whole_body(&id, stream, meta, content_type.as_deref(), Some(&url))
        .await?;
    if !already_existed {
        state.registry.register_aliases(entry.digest, &[format!("files/{}", entry.digest.to_hex())]);
    }
    Ok(json_response(StatusCode::OK, json!({ "file": file_resource(&entry, None) })))
}

/// `GET /v1beta/files` — paginated list.
pub async fn list(state: &AppState, req: Request<Body>) -> Result<Response<Body>> {
    let page_size: usize = query_param(&req, "pageSize")
        .and_then(|v| v.parse().ok())
        .map(|n: usize| n.clamp(1, MAX_PAGE_SIZE))
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let start_index: usize = query_param(&req, "pageToken").and_then(|v| v.parse().ok()).unwrap_or(0);

    let (page, next) = state.registry.list(page_size, start_index);
    let files: Vec<Value> = page.iter().map(|e| file_resource(e, None)).collect();
    let mut body = json!({ "files": files });
    if let Some(next) = next {
        body["nextPageToken"] = json!(next.to_string());
    }
    Ok(json_response(StatusCode::OK, body))
}

/// `GET /v1beta/files/{name}` — metadata, optionally re-verified remotely.
pub async fn get(state: &AppState, req: Request<Body>, name: &str) -> Result<Response<Body>> {
    let alias = format!("files/{}", name);
    let entry = state
        .registry
        .resolve(&alias)
        .or_else(|| state.registry.resolve(name))
        .ok_or_else(|| BrokerError::NotFound(alias.clone()))?;
    state.registry.touch(&entry.digest);

    let verify_remote = query_param(&req, "verifyRemote").as_deref() == Some("true");
    if verify_remote {
        if let Some((executor_id, _)) = entry.replication.iter().find(|(_, d)| d.is_synced()) {
            if let Some(executor) = state.executors.get(executor_id) {
                match state
                    .dispatcher
                    .dispatch_non_streaming(&executor, "get_file", json!({ "name": alias }))
                    .await
                {
                    Ok(_) => {}
                    Err(err) => warn!("verifyRemote check for {} on {} failed: {}", alias, executor_id, err),
                }
            }
        }
    }

    let mut resource = file_resource(&entry, None);
    if !entry.is_stub && state.store.exists(&entry.digest).await {
        let token = generate_download_token();
        state.download_tokens.issue(entry.digest, token.clone());
        resource["downloadUri"] = json!(format!(
            "{}/v1beta/files/internal/{}/{}:download",
            state.config.proxy_base_url,
            entry.digest.to_hex(),
            token
        ));
    }
    Ok(json_response(StatusCode::OK, resource))
}

/// `DELETE /v1beta/files/{name}` — idempotent tombstone plus best-effort
/// remote cleanup.
pub async fn delete(state: &AppState, name: &str) -> Result<Response<Body>> {
    let alias = format!("files/{}", name);
    if let Some(entry) = state.registry.resolve(&alias).or_else(|| state.registry.resolve(name)) {
        let remote_names: Vec<(String, String)> = entry
            .replication
            .iter()
            .filter_map(|(executor_id, d)| d.remote_name.clone().map(|n| (executor_id.clone(), n)))
            .collect();
        state.registry.tombstone(entry.digest, &[alias.clone(), name.to_string()]);
        if !entry.is_stub {
            let _ = state.store.delete(&entry.digest).await;
        }
        for (executor_id, remote_name) in remote_names {
            if let Some(executor) = state.executors.get(&executor_id) {
                let dispatcher = state.dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.dispatch_non_streaming(&executor, "delete_file", json!({ "name": remote_name })).await {
                        warn!("remote delete on {} failed: {}", executor_id, err);
                    }
                });
            }
        }
    }
    Ok(json_response(StatusCode::OK, json!({})))
}

/// One-time download tokens for the internal blob endpoint: `sha256(secret)`
/// would be overkill here since the token itself is the secret; store it
/// directly and compare in constant time.
pub fn generate_download_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode(bytes)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `GET /v1beta/files/internal/{digest}/{token}:download` — not part of the
/// public schema; the `downloadUri` handed out by `get` above is the only
/// legitimate way to obtain a matching token.
pub async fn internal_download(state: &AppState, digest_hex: &str, token: &str) -> Result<Response<Body>> {
    let digest = Digest::from_hex(digest_hex).ok_or_else(|| BrokerError::NotFound(digest_hex.to_string()))?;
    let expected = state
        .download_tokens
        .take(&digest)
        .ok_or_else(|| BrokerError::NotFound("no active download token for this digest".to_string()))?;
    if !constant_time_eq(token, &expected) {
        state.download_tokens.put(digest, expected);
        return Err(BrokerError::NotFound("invalid download token".to_string()));
    }

    let entry = state.registry.get(&digest).ok_or_else(|| BrokerError::NotFound(digest_hex.to_string()))?;
    let file = state.store.open_for_read(&digest).await.map_err(BrokerError::Internal)?;
    let stream = tokio_util::io::ReaderStream::new(file);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, entry.mime)
        .header(hyper::header::CONTENT_LENGTH, entry.size)
        .body(Body::wrap_stream(stream))
        .expect("building the download response never fails"))
}
