//! The Request Orchestrator (§4.9): the single entry point for any
//! caller-originated command. Extracts file references from the payload,
//! schedules replication, rewrites the payload to executor-local handles,
//! dispatches, and recovers from "file expired" errors with one rebuild retry.

use std::sync::Arc;

use log::{info, warn};
use rand::seq::SliceRandom;
use serde_json::{Map, Value};

use crate::broker::dispatcher::{Dispatcher, StreamingHandle};
use crate::broker::executor::{ExecutorHandle, ExecutorRegistry};
use crate::broker::replication::ReplicationEngine;
use crate::cache::registry::{CacheEntry, MetadataRegistry};
use crate::digest::Digest;
use crate::error::{BrokerError, Result};
use crate::mime;

/// A path into a JSON payload tree, used to defer rewriting a file reference
/// until after scheduling has picked a destination executor.
#[derive(Debug, Clone)]
enum PathKey {
    Key(String),
    Index(usize),
}

fn get_at_path<'a>(value: &'a Value, path: &[PathKey]) -> Option<&'a Value> {
    let mut cur = value;
    for key in path {
        cur = match key {
            PathKey::Key(k) => cur.get(k)?,
            PathKey::Index(i) => cur.get(*i)?,
        };
    }
    Some(cur)
}

fn get_mut_at_path<'a>(value: &'a mut Value, path: &[PathKey]) -> Option<&'a mut Value> {
    let mut cur = value;
    for key in path {
        cur = match key {
            PathKey::Key(k) => cur.get_mut(k)?,
            PathKey::Index(i) => cur.get_mut(*i)?,
        };
    }
    Some(cur)
}

fn collect_file_data_paths(value: &Value, path: Vec<PathKey>, out: &mut Vec<Vec<PathKey>>) {
    match value {
        Value::Object(map) => {
            if map.contains_key("fileData") || map.contains_key("file_data") {
                out.push(path.clone());
            }
            for (k, v) in map {
                let mut child = path.clone();
                child.push(PathKey::Key(k.clone()));
                collect_file_data_paths(v, child, out);
            }
        }
        Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                let mut child = path.clone();
                child.push(PathKey::Index(i));
                collect_file_data_paths(v, child, out);
            }
        }
        _ => {}
    }
}

fn file_data_mut(node: &mut Value) -> Option<&mut Map<String, Value>> {
    let map = node.as_object_mut()?;
    if map.contains_key("fileData") {
        map.get_mut("fileData").and_then(Value::as_object_mut)
    } else if map.contains_key("file_data") {
        map.get_mut("file_data").and_then(Value::as_object_mut)
    } else {
        None
    }
}

fn file_data_ref(node: &Value) -> Option<&Map<String, Value>> {
    let map = node.as_object()?;
    map.get("fileData")
        .or_else(|| map.get("file_data"))
        .and_then(Value::as_object)
}

fn file_alias(file_data: &Map<String, Value>) -> Option<&str> {
    file_data
        .get("fileUri")
        .or_else(|| file_data.get("file_uri"))
        .or_else(|| file_data.get("fileName"))
        .or_else(|| file_data.get("file_name"))
        .and_then(Value::as_str)
}

fn repair_one(file_data: &mut Map<String, Value>, registry: &MetadataRegistry) {
    let mime_key = if file_data.contains_key("mimeType") { "mimeType" } else { "mime_type" };
    let current = file_data.get(mime_key).and_then(Value::as_str).unwrap_or("").to_string();
    let alias = file_alias(file_data).map(str::to_string);
    let hint = alias.clone().unwrap_or_default();
    if mime::should_correct(&current, &hint) {
        let inferred = alias
            .as_deref()
            .and_then(|a| registry.resolve(a))
            .map(|entry| entry.mime)
            .unwrap_or_else(|| mime::infer_from_filename(&hint, mime::OCTET_STREAM));
        file_data.insert(mime_key.to_string(), Value::String(inferred));
    }
}

fn mime_repair_walk(value: &mut Value, registry: &MetadataRegistry) {
    if let Some(fd) = file_data_mut(value) {
        repair_one(fd, registry);
    }
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                mime_repair_walk(v, registry);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                mime_repair_walk(v, registry);
            }
        }
        _ => {}
    }
}

struct FileReference {
    path: Vec<PathKey>,
    digest: Digest,
}

fn is_generation_command(command_type: &str) -> bool {
    matches!(command_type, "generateContent" | "streamGenerateContent")
}

fn looks_like_missing_file(err: &BrokerError) -> bool {
    err.looks_like_missing_file()
}

pub struct Orchestrator {
    registry: Arc<MetadataRegistry>,
    executors: Arc<ExecutorRegistry>,
    dispatcher: Arc<Dispatcher>,
    replication: Arc<ReplicationEngine>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        executors: Arc<ExecutorRegistry>,
        dispatcher: Arc<Dispatcher>,
        replication: Arc<ReplicationEngine>,
    ) -> Self {
        Orchestrator { registry, executors, dispatcher, replication }
    }

    fn extract_file_references(&self, payload: &Value) -> Result<Vec<FileReference>> {
        let mut paths = Vec::new();
        collect_file_data_paths(payload, Vec::new(), &mut paths);
        let mut refs = Vec::with_capacity(paths.len());
        for path in paths {
            let node = get_at_path(payload, &path)
                .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("file reference path vanished during extraction")))?;
            let file_data = file_data_ref(node)
                .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("fileData node vanished during extraction")))?;
            let alias = file_alias(file_data)
                .ok_or_else(|| BrokerError::NotFound("file reference missing uri/name".to_string()))?;
            let entry = self
                .registry
                .resolve(alias)
                .ok_or_else(|| BrokerError::NotFound(alias.to_string()))?;
            refs.push(FileReference { path, digest: entry.digest });
        }
        Ok(refs)
    }

    /// Picks the executor minimizing missing replicas for `references`.
    /// Returns the selected executor, its missing-digest set to replicate
    /// synchronously, and (when a different executor was round-robin's
    /// first pick) that preferred executor plus its missing set for
    /// background self-healing.
    fn schedule(
        &self,
        references: &[FileReference],
        entries: &[CacheEntry],
    ) -> Result<(ExecutorHandle, Vec<Digest>, Option<(ExecutorHandle, Vec<Digest>)>)> {
        let preferred = self.executors.next()?;
        let live = self.executors.all();

        let missing_for = |executor_id: &str| -> Vec<Digest> {
            references
                .iter()
                .zip(entries)
                .filter(|(_, entry)| entry.missing_on(executor_id))
                .map(|(r, _)| r.digest)
                .collect()
        };

        let mut best_missing = missing_for(&preferred.id);
        let mut tied: Vec<String> = vec![preferred.id.clone()];

        for id in &live {
            if *id == preferred.id {
                continue;
            }
            let missing = missing_for(id);
            match missing.len().cmp(&best_missing.len()) {
                std::cmp::Ordering::Less => {
                    best_missing = missing;
                    tied = vec![id.clone()];
                }
                std::cmp::Ordering::Equal => tied.push(id.clone()),
                std::cmp::Ordering::Greater => {}
            }
        }

        // Ties prefer the round-robin choice, else break uniformly at random.
        let best_id = if tied.contains(&preferred.id) {
            preferred.id.clone()
        } else {
            tied.choose(&mut rand::thread_rng()).cloned().unwrap_or_else(|| preferred.id.clone())
        };
        let best_missing = missing_for(&best_id);

        let selected = self
            .executors
            .get(&best_id)
            .ok_or(BrokerError::NoExecutors)?;

        let background = if best_id != preferred.id {
            let preferred_missing = missing_for(&preferred.id);
            Some((preferred, preferred_missing))
        } else {
            None
        };

        Ok((selected, best_missing, background))
    }

    fn rewrite_payload(&self, payload: &mut Value, references: &[FileReference], executor: &ExecutorHandle) -> Result<()> {
        for reference in references {
            let entry = self
                .registry
                .get(&reference.digest)
                .ok_or_else(|| BrokerError::NotFound(reference.digest.to_hex()))?;
            let descriptor = entry
                .replication
                .get(&executor.id)
                .filter(|d| d.is_synced())
                .ok_or_else(|| {
                    BrokerError::Internal(anyhow::anyhow!(
                        "{} not synced on {} after scheduled replication",
                        reference.digest,
                        executor.id
                    ))
                })?;
            let canonical = descriptor
                .remote_uri
                .clone()
                .or_else(|| descriptor.remote_name.clone())
                .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("synced descriptor has neither uri nor name")))?;

            let node = get_mut_at_path(payload, &reference.path)
                .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("payload shape changed during rewrite")))?;
            let file_data = file_data_mut(node)
                .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("fileData node disappeared during rewrite")))?;
            for key in ["fileUri", "file_uri", "fileName", "file_name"] {
                file_data.remove(key);
            }
            file_data.insert("fileUri".to_string(), Value::String(canonical));
        }
        Ok(())
    }

    async fn replicate_missing(&self, digests: &[Digest], executor: &ExecutorHandle) -> Result<()> {
        for digest in digests {
            self.replication.replicate(*digest, executor).await?;
        }
        Ok(())
    }

    /// The dispatch entry point for any non-streaming caller command.
    pub async fn handle(&self, command_type: &str, mut payload: Value) -> Result<Value> {
        if is_generation_command(command_type) {
            mime_repair_walk(&mut payload, &self.registry);
        }

        let references = self.extract_file_references(&payload)?;
        if references.is_empty() {
            let executor = self.executors.next()?;
            return self.dispatcher.dispatch_non_streaming(&executor, command_type, payload).await;
        }

        let entries: Vec<CacheEntry> = references
            .iter()
            .map(|r| self.registry.get(&r.digest).ok_or_else(|| BrokerError::NotFound(r.digest.to_hex())))
            .collect::<Result<_>>()?;

        let (selected, missing, background) = self.schedule(&references, &entries)?;
        self.replicate_missing(&missing, &selected).await?;
        if let Some((preferred, preferred_missing)) = background {
            if !preferred_missing.is_empty() {
                self.replication.replicate_in_background(preferred_missing, preferred);
            }
        }

        self.rewrite_payload(&mut payload, &references, &selected)?;

        match self.dispatcher.dispatch_non_streaming(&selected, command_type, payload.clone()).await {
            Ok(value) => Ok(value),
            Err(err) if looks_like_missing_file(&err) => {
                info!("rebuilding expired file reference(s) for {} and retrying once", command_type);
                self.rebuild_and_retry(command_type, &mut payload, &references).await
            }
            Err(other) => Err(other),
        }
    }

    async fn rebuild_and_retry(&self, command_type: &str, payload: &mut Value, references: &[FileReference]) -> Result<Value> {
        let rebuild_executor = self.executors.next()?;
        for reference in references {
            self.registry.reset_replication(&reference.digest);
            self.replication
                .replicate(reference.digest, &rebuild_executor)
                .await
                .map_err(|err| BrokerError::RebuildFailed(format!("{}: {}", reference.digest, err)))?;
        }
        self.rewrite_payload(payload, references, &rebuild_executor)?;
        self.dispatcher
            .dispatch_non_streaming(&rebuild_executor, command_type, payload.clone())
            .await
            .map_err(|err| BrokerError::RebuildFailed(format!("retry dispatch failed: {}", err)))
    }

    /// The dispatch entry point for `streamGenerateContent`. No
    /// rebuild-on-expire: a mid-stream error simply ends the stream, as
    /// streaming has no single response to retry.
    pub async fn handle_streaming(&self, command_type: &str, mut payload: Value) -> Result<StreamingHandle> {
        mime_repair_walk(&mut payload, &self.registry);
        let references = self.extract_file_references(&payload)?;

        if references.is_empty() {
            let executor = self.executors.next()?;
            return self.dispatcher.dispatch_streaming(&executor, command_type, payload).await;
        }

        let entries: Vec<CacheEntry> = references
            .iter()
            .map(|r| self.registry.get(&r.digest).ok_or_else(|| BrokerError::NotFound(r.digest.to_hex())))
            .collect::<Result<_>>()?;
        let (selected, missing, background) = self.schedule(&references, &entries)?;
        self.replicate_missing(&missing, &selected).await?;
        if let Some((preferred, preferred_missing)) = background {
            if !preferred_missing.is_empty() {
                self.replication.replicate_in_background(preferred_missing, preferred);
            }
        }
        self.rewrite_payload(&mut payload, &references, &selected)?;
        self.dispatcher.dispatch_streaming(&selected, command_type, payload).await
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        warn!("orchestrator shutting down with {} executor(s) live", self.executors.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::correlation::CorrelationLayer;
    use crate::cache::registry::{RemoteFileDescriptor, ReplicationStatus};
    use crate::cache::store::FileStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        registry: Arc<MetadataRegistry>,
        executors: Arc<ExecutorRegistry>,
        correlation: Arc<CorrelationLayer>,
        store: Arc<FileStore>,
        _dir: tempfile::TempDir,
    }

    /// Writes `bytes` through the `FileStore` and creates a matching registry
    /// entry so `ReplicationEngine::replicate`'s `tokio::fs::read` of the
    /// entry's path finds a real blob instead of failing before it ever sends
    /// an upload frame.
    async fn seed_entry(h: &Harness, bytes: &[u8], filename: &str, mime: &str) -> Digest {
        let mut w = h.store.open_temp_write(filename).await.unwrap();
        w.write_all(bytes).await.unwrap();
        let (digest, path, size) = w.commit().await.unwrap();
        h.registry.create(digest, path, filename.to_string(), mime.to_string(), size);
        digest
    }

    async fn harness() -> (Harness, mpsc::Receiver<String>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()));
        store.ensure_layout().await.unwrap();
        let registry = Arc::new(MetadataRegistry::new());
        let executors = Arc::new(ExecutorRegistry::new());
        let correlation = Arc::new(CorrelationLayer::new());
        let dispatcher = Arc::new(Dispatcher::new(executors.clone(), correlation.clone(), Duration::from_secs(1)));
        let replication = Arc::new(ReplicationEngine::new(store.clone(), registry.clone(), dispatcher.clone()));
        let orchestrator = Arc::new(Orchestrator::new(registry.clone(), executors.clone(), dispatcher, replication));

        let (tx, rx) = mpsc::channel(32);
        executors.connect("e1".into(), tx);

        (
            Harness { orchestrator, registry, executors, correlation, store, _dir: dir },
            rx,
        )
    }

    #[tokio::test]
    async fn no_file_reference_dispatches_directly() {
        let (h, mut rx) = harness().await;
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.handle("generateContent", json!({"contents": []})).await });
        let frame = rx.recv().await.unwrap();
        let envelope: Value = serde_json::from_str(&frame).unwrap();
        h.correlation.handle_inbound(envelope["id"].as_str().unwrap(), json!({"text": "hi"}), None);
        assert_eq!(task.await.unwrap().unwrap(), json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn unresolvable_file_reference_is_not_found() {
        let (h, _rx) = harness().await;
        let payload = json!({
            "contents": [{"parts": [{"fileData": {"fileUri": "files/unknown", "mimeType": "text/plain"}}]}]
        });
        let err = h.orchestrator.handle("generateContent", payload).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn replicates_then_rewrites_and_dispatches() {
        let (h, mut rx) = harness().await;
        let digest = seed_entry(&h, b"file contents", "x.bin", "text/plain").await;
        h.registry.register_aliases(digest, &["files/known".to_string()]);

        let payload = json!({
            "contents": [{"parts": [{"fileData": {"fileUri": "files/known", "mimeType": "text/plain"}}]}]
        });

        let orchestrator = h.orchestrator.clone();
        let orchestrator_task = tokio::spawn(async move { orchestrator.handle("generateContent", payload).await });

        // drive: initiate-resumable-upload, then upload-chunk, then final generateContent
        let init_frame = rx.recv().await.unwrap();
        let init_env: Value = serde_json::from_str(&init_frame).unwrap();
        assert_eq!(init_env["type"], "initiate-resumable-upload");
        h.correlation.handle_inbound(init_env["id"].as_str().unwrap(), json!({"uploadUrl": "https://cloud/up"}), None);

        let chunk_frame = rx.recv().await.unwrap();
        let chunk_env: Value = serde_json::from_str(&chunk_frame).unwrap();
        assert_eq!(chunk_env["type"], "upload-chunk");
        h.correlation.handle_inbound(
            chunk_env["id"].as_str().unwrap(),
            json!({"file": {"name": "files/remote-known", "uri": "https://cloud/files/remote-known"}}),
            None,
        );

        let gen_frame = rx.recv().await.unwrap();
        let gen_env: Value = serde_json::from_str(&gen_frame).unwrap();
        assert_eq!(gen_env["type"], "generateContent");
        let rewritten_uri = gen_env["payload"]["contents"][0]["parts"][0]["fileData"]["fileUri"].as_str().unwrap();
        assert_eq!(rewritten_uri, "https://cloud/files/remote-known");
        assert!(gen_env["payload"]["contents"][0]["parts"][0]["fileData"].get("fileName").is_none());

        h.correlation.handle_inbound(gen_env["id"].as_str().unwrap(), json!({"text": "done"}), None);
        let result = orchestrator_task.await.unwrap().unwrap();
        assert_eq!(result, json!({"text": "done"}));
    }

    #[tokio::test]
    async fn rebuild_on_expire_retries_once() {
        let (h, mut rx) = harness().await;
        let digest = seed_entry(&h, b"expiring contents", "y.bin", "text/plain").await;
        h.registry.update_replication(
            &digest,
            "e1",
            ReplicationStatus::Synced,
            Some(RemoteFileDescriptor {
                name: "files/stale".to_string(),
                uri: Some("https://cloud/files/stale".to_string()),
                ..Default::default()
            }),
        );

        let payload = json!({
            "contents": [{"parts": [{"fileData": {"fileUri": "files/stale", "mimeType": "text/plain"}}]}]
        });

        let correlation = h.correlation.clone();
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.handle("generateContent", payload).await });

        // first attempt: already synced, no replication round-trip needed; goes straight to generateContent,
        // which the executor answers with a file-not-found error.
        let first_frame = rx.recv().await.unwrap();
        let first_env: Value = serde_json::from_str(&first_frame).unwrap();
        assert_eq!(first_env["type"], "generateContent");
        correlation.handle_inbound(
            first_env["id"].as_str().unwrap(),
            json!({}),
            Some(json!({"error": {"code": 404, "message": "file not found"}})),
        );

        // rebuild: initiate + upload-chunk + retried generateContent
        let init_frame = rx.recv().await.unwrap();
        let init_env: Value = serde_json::from_str(&init_frame).unwrap();
        assert_eq!(init_env["type"], "initiate-resumable-upload");
        correlation.handle_inbound(init_env["id"].as_str().unwrap(), json!({"uploadUrl": "https://cloud/up2"}), None);

        let chunk_frame = rx.recv().await.unwrap();
        let chunk_env: Value = serde_json::from_str(&chunk_frame).unwrap();
        assert_eq!(chunk_env["type"], "upload-chunk");
        correlation.handle_inbound(
            chunk_env["id"].as_str().unwrap(),
            json!({"file": {"name": "files/rebuilt", "uri": "https://cloud/files/rebuilt"}}),
            None,
        );

        let retry_frame = rx.recv().await.unwrap();
        let retry_env: Value = serde_json::from_str(&retry_frame).unwrap();
        assert_eq!(retry_env["type"], "generateContent");
        let rewritten = retry_env["payload"]["contents"][0]["parts"][0]["fileData"]["fileUri"].as_str().unwrap();
        assert_eq!(rewritten, "https://cloud/files/rebuilt");
        correlation.handle_inbound(retry_env["id"].as_str().unwrap(), json!({"text": "recovered"}), None);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"text": "recovered"}));
    }
}
