//! The Ingest Pipeline (§4.3): single-shot streamed ingest and the
//! resumable-upload-compatible chunked ingest, plus filename/mime selection
//! on finalize.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cache::registry::{CacheEntry, MetadataRegistry};
use crate::cache::store::{FileStore, StreamingWrite};
use crate::digest::Digest;
use crate::error::{BrokerError, Result};
use crate::mime;

#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub declared_name: Option<String>,
    pub declared_mime: Option<String>,
    pub declared_size: Option<u64>,
}

/// The set of upload commands carried on a resumable-upload PUT, e.g.
/// `X-Goog-Upload-Command: upload, finalize`.
#[derive(Debug, Clone, Default)]
pub struct UploadCommands {
    pub upload: bool,
    pub finalize: bool,
}

impl UploadCommands {
    pub fn parse(header: &str) -> Result<Self> {
        let mut commands = UploadCommands::default();
        for part in header.split(',') {
            match part.trim() {
                "upload" => commands.upload = true,
                "finalize" => commands.finalize = true,
                "" => {}
                other => return Err(BrokerError::InvalidCommand(other.to_string())),
            }
        }
        if !commands.upload && !commands.finalize {
            return Err(BrokerError::InvalidCommand(header.to_string()));
        }
        Ok(commands)
    }
}

#[derive(Debug)]
pub enum ChunkOutcome {
    /// More bytes expected; echoes the new write cursor for a `308` response.
    Continue { bytes_written: u64 },
    Finalized { entry: CacheEntry, already_existed: bool },
}

struct Session {
    meta: SessionMeta,
    writer: Option<StreamingWrite>,
    created_at: Instant,
    finalized: bool,
}

pub struct IngestPipeline {
    store: Arc<FileStore>,
    registry: Arc<MetadataRegistry>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl IngestPipeline {
    pub fn new(store: Arc<FileStore>, registry: Arc<MetadataRegistry>) -> Self {
        IngestPipeline {
            store,
            registry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_session(&self, id: String, meta: SessionMeta) {
        let mut sessions = self.sessions.lock().expect("ingest sessions mutex poisoned");
        sessions.insert(
            id,
            Session {
                meta,
                writer: None,
                created_at: Instant::now(),
                finalized: false,
            },
        );
    }

    pub fn session_meta(&self, id: &str) -> Option<SessionMeta> {
        let sessions = self.sessions.lock().expect("ingest sessions mutex poisoned");
        sessions.get(id).map(|s| s.meta.clone())
    }

    fn take_session(&self, id: &str) -> Option<Session> {
        self.sessions.lock().expect("ingest sessions mutex poisoned").remove(id)
    }

    fn put_session_back(&self, id: String, session: Session) {
        self.sessions.lock().expect("ingest sessions mutex poisoned").insert(id, session);
    }

    pub fn abandon_session(&self, id: &str) {
        self.sessions.lock().expect("ingest sessions mutex poisoned").remove(id);
    }

    /// Appends one PUT's worth of bytes to a chunked-upload session (§4.3).
    ///
    /// A `finalize` command is only honored once `offset + data.len()` lines
    /// up with what has already landed — i.e. finalize always rides on the
    /// last appended chunk, never a bare call after the fact.
    pub async fn append_chunk(
        &self,
        id: &str,
        offset: u64,
        data: &[u8],
        commands: &UploadCommands,
        content_type: Option<&str>,
    ) -> Result<ChunkOutcome> {
        let mut session = match self.take_session(id) {
            Some(session) => session,
            None => return Err(BrokerError::NotFound(format!("upload session {}", id))),
        };

        if session.finalized {
            return Err(BrokerError::InvalidCommand("session already finalized".to_string()));
        }

        let current = session.writer.as_ref().map(StreamingWrite::bytes_written).unwrap_or(0);
        if offset != current {
            if let Some(writer) = session.writer.take() {
                writer.abort().await;
            }
            self.store.discard_staging(&self.store.staging_dir().join(format!("chunk_{}.bin", id))).await;
            return Err(BrokerError::OffsetMismatch { expected: current, got: offset });
        }

        let mut writer = match session.writer.take() {
            Some(writer) => writer,
            None => self
                .store
                .open_chunk_write(id)
                .await
                .map_err(BrokerError::Internal)?,
        };
        writer.write_all(data).await.map_err(BrokerError::Internal)?;

        if !commands.finalize {
            let bytes_written = writer.bytes_written();
            session.writer = Some(writer);
            self.put_session_back(id.to_string(), session);
            return Ok(ChunkOutcome::Continue { bytes_written });
        }

        let declared_mime = session.meta.declared_mime.clone();
        let declared_name = session.meta.declared_name.clone();
        let declared_size = session.meta.declared_size;
        let (digest, path, size) = writer.commit().await.map_err(BrokerError::Internal)?;

        if let Some(expected) = declared_size {
            if expected != size {
                self.registry_cleanup_orphan(&digest, &path, size).await;
                return Err(BrokerError::InvalidSize(format!(
                    "declared {} bytes, received {}",
                    expected, size
                )));
            }
        }

        let (entry, already_existed) = self
            .finalize_entry(digest, path, size, declared_name, declared_mime, content_type, None)
            .await;

        session.finalized = true;
        Ok(ChunkOutcome::Finalized { entry, already_existed })
    }

    /// Single-shot streamed ingest: the whole body is known up front (used by
    /// server-side fetch-from-URL). `declared_size`, when given, must match
    /// the actual byte count exactly.
    pub async fn ingest_whole_body(
        &self,
        id: &str,
        mut body: impl tokio_stream::Stream<Item = std::io::Result<bytes::Bytes>> + Unpin,
        meta: SessionMeta,
        content_type: Option<&str>,
        source_url: Option<&str>,
    ) -> Result<(CacheEntry, bool)> {
        use tokio_stream::StreamExt;

        let mut writer = self.store.open_temp_write(id).await.map_err(BrokerError::Internal)?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| BrokerError::Internal(anyhow::Error::new(e)))?;
            writer.write_all(&chunk).await.map_err(BrokerError::Internal)?;
        }
        let (digest, path, size) = writer.commit().await.map_err(BrokerError::Internal)?;

        if let Some(expected) = meta.declared_size {
            if expected != size {
                self.registry_cleanup_orphan(&digest, &path, size).await;
                return Err(BrokerError::InvalidSize(format!(
                    "declared {} bytes, received {}",
                    expected, size
                )));
            }
        }

        let (entry, already_existed) = self
            .finalize_entry(digest, path, size, meta.declared_name, meta.declared_mime, content_type, source_url)
            .await;
        Ok((entry, already_existed))
    }

    /// Removes a blob that was committed but then rejected for a declared-size
    /// mismatch, unless another live entry still references the same digest.
    async fn registry_cleanup_orphan(&self, digest: &Digest, _path: &std::path::Path, _size: u64) {
        if self.registry.get(digest).is_none() {
            let _ = self.store.delete(digest).await;
        }
    }

    async fn finalize_entry(
        &self,
        digest: Digest,
        path: std::path::PathBuf,
        size: u64,
        declared_name: Option<String>,
        declared_mime: Option<String>,
        content_type: Option<&str>,
        source_url: Option<&str>,
    ) -> (CacheEntry, bool) {
        if let Some(existing) = self.registry.get(&digest) {
            return (existing, true);
        }

        let candidate_name = declared_name
            .and_then(|n| mime::sanitize_filename(&n))
            .or_else(|| source_url.and_then(mime::sanitize_filename));

        let sample = tokio::fs::read(&path).await.unwrap_or_default();
        let sample = &sample[..sample.len().min(8192)];
        let sniffed = mime::sniff(sample, |_| None);

        // A magic-byte signature is a stronger signal than a caller-declared
        // text/* Content-Type: a JPEG mislabeled as text/plain should still
        // come out as image/jpeg. `sniff` only ever returns "text/plain"
        // itself from the text/binary heuristic, never from a signature
        // match, so any other sniffed value here is a positive identification.
        let declared_as_text = content_type.map(|ct| ct.starts_with("text/")).unwrap_or(false);
        let sniffed_binary = sniffed.as_deref().filter(|m| *m != "text/plain");

        let mime = if declared_as_text && sniffed_binary.is_some() {
            sniffed_binary.map(|m| m.to_string())
        } else {
            content_type
                .filter(|ct| *ct != mime::OCTET_STREAM && !ct.is_empty())
                .map(|ct| ct.to_string())
                .or_else(|| declared_mime.filter(|m| !m.is_empty()))
                .or_else(|| sniffed.clone())
        }
        .or_else(|| {
            candidate_name.as_deref().and_then(|name| {
                let inferred = mime::infer_from_filename(name, mime::OCTET_STREAM);
                (inferred != mime::OCTET_STREAM).then_some(inferred)
            })
        })
        .unwrap_or_else(|| mime::OCTET_STREAM.to_string());

        let filename = candidate_name.unwrap_or_else(|| mime::build_fallback_filename(&digest.to_hex(), &mime));

        let entry = self.registry.create(digest, path, filename, mime, size);
        (entry, false)
    }

    pub fn sweep_expired_sessions(&self, timeout: std::time::Duration) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("ingest sessions mutex poisoned");
        let now = Instant::now();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.created_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_and_registry() -> (Arc<FileStore>, Arc<MetadataRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()));
        let registry = Arc::new(MetadataRegistry::new());
        (store, registry, dir)
    }

    #[tokio::test]
    async fn upload_commands_parses_combined_header() {
        let commands = UploadCommands::parse("upload, finalize").unwrap();
        assert!(commands.upload);
        assert!(commands.finalize);
    }

    #[tokio::test]
    async fn chunked_ingest_dedups_on_second_identical_upload() {
        let (store, registry, _dir) = store_and_registry();
        store.ensure_layout().await.unwrap();
        let pipeline = IngestPipeline::new(store, registry);

        pipeline.create_session("s1".into(), SessionMeta { declared_mime: Some("text/plain".into()), ..Default::default() });
        let commands = UploadCommands::parse("upload, finalize").unwrap();
        let outcome = pipeline
            .append_chunk("s1", 0, b"hello\nworld\n", &commands, None)
            .await
            .unwrap();
        let entry1 = match outcome {
            ChunkOutcome::Finalized { entry, already_existed } => {
                assert!(!already_existed);
                entry
            }
            _ => panic!("expected finalize"),
        };

        pipeline.create_session("s2".into(), SessionMeta { declared_mime: Some("text/plain".into()), ..Default::default() });
        let outcome2 = pipeline
            .append_chunk("s2", 0, b"hello\nworld\n", &commands, None)
            .await
            .unwrap();
        match outcome2 {
            ChunkOutcome::Finalized { entry, already_existed } => {
                assert!(already_existed);
                assert_eq!(entry.digest, entry1.digest);
            }
            _ => panic!("expected finalize"),
        }
    }

    #[tokio::test]
    async fn offset_mismatch_discards_session() {
        let (store, registry, _dir) = store_and_registry();
        store.ensure_layout().await.unwrap();
        let pipeline = IngestPipeline::new(store, registry);

        pipeline.create_session("s1".into(), SessionMeta::default());
        let commands = UploadCommands::parse("upload").unwrap();
        pipeline.append_chunk("s1", 0, b"abc", &commands, None).await.unwrap();

        let err = pipeline.append_chunk("s1", 99, b"def", &commands, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::OffsetMismatch { .. }));

        let err2 = pipeline.append_chunk("s1", 0, b"abc", &commands, None).await.unwrap_err();
        assert!(matches!(err2, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn zero_byte_finalize_produces_empty_digest() {
        let (store, registry, _dir) = store_and_registry();
        store.ensure_layout().await.unwrap();
        let pipeline = IngestPipeline::new(store, registry);

        pipeline.create_session("s1".into(), SessionMeta::default());
        let commands = UploadCommands::parse("upload, finalize").unwrap();
        let outcome = pipeline.append_chunk("s1", 0, b"", &commands, None).await.unwrap();
        match outcome {
            ChunkOutcome::Finalized { entry, .. } => assert_eq!(entry.digest, Digest::of_empty()),
            _ => panic!("expected finalize"),
        }
    }

    #[tokio::test]
    async fn declared_size_mismatch_rejected() {
        let (store, registry, _dir) = store_and_registry();
        store.ensure_layout().await.unwrap();
        let pipeline = IngestPipeline::new(store, registry);

        pipeline.create_session(
            "s1".into(),
            SessionMeta { declared_size: Some(100), ..Default::default() },
        );
        let commands = UploadCommands::parse("upload, finalize").unwrap();
        let err = pipeline.append_chunk("s1", 0, b"too short", &commands, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidSize(_)));
    }

    #[tokio::test]
    async fn jpeg_bytes_get_image_mime_despite_text_content_type() {
        let (store, registry, _dir) = store_and_registry();
        store.ensure_layout().await.unwrap();
        let pipeline = IngestPipeline::new(store, registry);

        pipeline.create_session("s1".into(), SessionMeta::default());
        let commands = UploadCommands::parse("upload, finalize").unwrap();
        let mut bytes = vec![0xff, 0xd8, 0xff, 0xe0];
        bytes.extend(std::iter::repeat(0xAA).take(32));
        let outcome = pipeline
            .append_chunk("s1", 0, &bytes, &commands, Some("text/plain"))
            .await
            .unwrap();
        match outcome {
            ChunkOutcome::Finalized { entry, .. } => assert_eq!(entry.mime, "image/jpeg"),
            _ => panic!("expected finalize"),
        }
    }
}
