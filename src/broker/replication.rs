//! The Replication Engine (§4.8): pushes a cached blob to an executor via
//! the two-step resumable-upload protocol and records the result.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::{json, Value};

use crate::broker::dispatcher::Dispatcher;
use crate::broker::executor::ExecutorHandle;
use crate::cache::registry::{MetadataRegistry, RemoteFileDescriptor, ReplicationStatus};
use crate::cache::store::FileStore;
use crate::digest::Digest;
use crate::error::{BrokerError, Result};

pub struct ReplicationEngine {
    store: Arc<FileStore>,
    registry: Arc<MetadataRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl ReplicationEngine {
    pub fn new(store: Arc<FileStore>, registry: Arc<MetadataRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        ReplicationEngine { store, registry, dispatcher }
    }

    /// Synchronously uploads digest `d` to executor `e`, blocking the caller.
    pub async fn replicate(&self, digest: Digest, executor: &ExecutorHandle) -> Result<RemoteFileDescriptor> {
        self.registry.update_replication(&digest, &executor.id, ReplicationStatus::Pending, None);

        let entry = self
            .registry
            .get(&digest)
            .ok_or_else(|| BrokerError::NotFound(digest.to_hex()))?;

        let bytes = tokio::fs::read(&entry.path).await.map_err(|e| {
            BrokerError::Internal(anyhow::anyhow!("reading cached blob {}: {}", digest, e))
        });
        let bytes = match bytes {
            Ok(b) => b,
            Err(err) => {
                self.registry.update_replication(&digest, &executor.id, ReplicationStatus::Failed, None);
                return Err(err);
            }
        };

        let result = self.upload(&entry.filename, &entry.mime, &bytes, executor).await;
        match result {
            Ok(descriptor) => {
                self.registry.update_replication(&digest, &executor.id, ReplicationStatus::Synced, Some(descriptor.clone()));
                Ok(descriptor)
            }
            Err(err) => {
                self.registry.update_replication(&digest, &executor.id, ReplicationStatus::Failed, None);
                Err(err)
            }
        }
    }

    async fn upload(
        &self,
        display_name: &str,
        mime_type: &str,
        bytes: &[u8],
        executor: &ExecutorHandle,
    ) -> Result<RemoteFileDescriptor> {
        let init_payload = json!({
            "displayName": display_name,
            "mimeType": mime_type,
            "sizeBytes": bytes.len() as u64,
        });
        let init_response = self
            .dispatcher
            .dispatch_non_streaming(executor, "initiate-resumable-upload", init_payload)
            .await?;
        let upload_url = init_response
            .get("uploadUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::BadGateway("initiate-resumable-upload response missing uploadUrl".to_string()))?;

        let chunk_payload = json!({
            "uploadUrl": upload_url,
            "offset": 0,
            "contentLength": bytes.len() as u64,
            "command": "upload, finalize",
            "data": base64::encode(bytes),
        });
        let chunk_response = self
            .dispatcher
            .dispatch_non_streaming(executor, "upload-chunk", chunk_payload)
            .await?;

        parse_remote_descriptor(&chunk_response)
            .ok_or_else(|| BrokerError::BadGateway("upload-chunk response missing file descriptor".to_string()))
    }

    /// Fire-and-forget bulk replication for self-healing: spawns a task per
    /// digest and does not block the caller. Failures are logged only.
    pub fn replicate_in_background(self: &Arc<Self>, digests: Vec<Digest>, executor: ExecutorHandle) {
        for digest in digests {
            let engine = Arc::clone(self);
            let executor = executor.clone();
            tokio::spawn(async move {
                match engine.replicate(digest, &executor).await {
                    Ok(_) => debug!("background replication of {} to {} complete", digest, executor.id),
                    Err(err) => warn!("background replication of {} to {} failed: {}", digest, executor.id, err),
                }
            });
        }
    }
}

fn parse_remote_descriptor(response: &Value) -> Option<RemoteFileDescriptor> {
    let file = response.get("file").unwrap_or(response);
    let name = file.get("name").and_then(Value::as_str)?.to_string();
    Some(RemoteFileDescriptor {
        name,
        uri: file.get("uri").and_then(Value::as_str).map(String::from),
        mime_type: file.get("mimeType").and_then(Value::as_str).map(String::from),
        size_bytes: file
            .get("sizeBytes")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64())),
        sha256_hash: file.get("sha256Hash").and_then(Value::as_str).map(String::from),
        expiration: file
            .get("expirationTime")
            .and_then(Value::as_str)
            .and_then(parse_rfc3339_roughly),
        display_name: file.get("displayName").and_then(Value::as_str).map(String::from),
    })
}

/// A minimal RFC 3339 timestamp parser: good enough for the cloud API's
/// fixed `YYYY-MM-DDTHH:MM:SSZ` expiration format without pulling in a full
/// date/time crate.
fn parse_rfc3339_roughly(s: &str) -> Option<std::time::SystemTime> {
    let s = s.trim_end_matches('Z');
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;
    let time = time.split('.').next().unwrap_or(time);
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;

    let days_from_epoch = days_from_civil(year, month, day);
    let secs = days_from_epoch * 86_400 + hour * 3600 + minute * 60 + second;
    if secs < 0 {
        return None;
    }
    Some(std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64))
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian, days
/// since 1970-01-01).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::correlation::CorrelationLayer;
    use crate::broker::executor::ExecutorRegistry;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<FileStore>, Arc<MetadataRegistry>, Arc<ExecutorRegistry>, Arc<CorrelationLayer>, Arc<Dispatcher>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()));
        let registry = Arc::new(MetadataRegistry::new());
        let executors = Arc::new(ExecutorRegistry::new());
        let correlation = Arc::new(CorrelationLayer::new());
        let dispatcher = Arc::new(Dispatcher::new(executors.clone(), correlation.clone(), Duration::from_secs(1)));
        (store, registry, executors, correlation, dispatcher, dir)
    }

    #[tokio::test]
    async fn replicate_happy_path_records_synced_descriptor() {
        let (store, registry, executors, correlation, dispatcher, _dir) = setup();
        store.ensure_layout().await.unwrap();
        let mut w = store.open_temp_write("t").await.unwrap();
        w.write_all(b"blob bytes").await.unwrap();
        let (digest, path, size) = w.commit().await.unwrap();
        registry.create(digest, path, "blob.bin".into(), "application/octet-stream".into(), size);

        let (tx, mut rx) = mpsc::channel(8);
        let handle = executors.connect("e1".into(), tx);

        let engine = ReplicationEngine::new(store, registry.clone(), dispatcher.clone());
        let replicate_task = {
            let engine_handle = handle.clone();
            tokio::spawn(async move { engine.replicate(digest, &engine_handle).await })
        };

        let init_frame = rx.recv().await.unwrap();
        let init_env: Value = serde_json::from_str(&init_frame).unwrap();
        assert_eq!(init_env["type"], "initiate-resumable-upload");
        correlation.handle_inbound(init_env["id"].as_str().unwrap(), json!({"uploadUrl": "https://cloud/upload/xyz"}), None);

        let chunk_frame = rx.recv().await.unwrap();
        let chunk_env: Value = serde_json::from_str(&chunk_frame).unwrap();
        assert_eq!(chunk_env["type"], "upload-chunk");
        correlation.handle_inbound(
            chunk_env["id"].as_str().unwrap(),
            json!({"file": {"name": "files/abc", "uri": "https://cloud/files/abc", "sizeBytes": "10"}}),
            None,
        );

        let descriptor = replicate_task.await.unwrap().unwrap();
        assert_eq!(descriptor.name, "files/abc");

        let entry = registry.get(&digest).unwrap();
        assert!(entry.replication["e1"].is_synced());
    }

    #[test]
    fn rfc3339_parses_known_instant() {
        let t = parse_rfc3339_roughly("2024-01-02T03:04:05Z").unwrap();
        let secs = t.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1_704_171_845);
    }
}
