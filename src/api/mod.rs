//! The HTTP Surface (§4.11 ambient): binds §6.1's route table to the
//! Orchestrator, Ingest Pipeline, and Metadata Registry. Owns the socket;
//! holds no business state of its own.

pub mod executor_channel;
pub mod files;
pub mod generate;
pub mod models;
pub mod server;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::broker::{CorrelationLayer, Dispatcher, ExecutorRegistry, ReplicationEngine};
use crate::cache::{FileStore, IngestPipeline, MetadataRegistry};
use crate::config::Config;
use crate::digest::Digest;
use crate::orchestrator::Orchestrator;

/// Every handle a request handler might need, composed once at startup and
/// cheaply cloned (all fields are `Arc`s) per connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<FileStore>,
    pub registry: Arc<MetadataRegistry>,
    pub ingest: Arc<IngestPipeline>,
    pub executors: Arc<ExecutorRegistry>,
    pub correlation: Arc<CorrelationLayer>,
    pub dispatcher: Arc<Dispatcher>,
    pub replication: Arc<ReplicationEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub download_tokens: Arc<DownloadTokens>,
    pub started_at: Instant,
}

/// One-time bearer tokens gating the internal blob-download endpoint
/// (§6.1, Open Question decision in DESIGN.md): opaque, single-use, and
/// swept on a timeout like upload sessions.
pub struct DownloadTokens {
    issued: Mutex<HashMap<Digest, (String, Instant)>>,
}

impl Default for DownloadTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadTokens {
    pub fn new() -> Self {
        DownloadTokens { issued: Mutex::new(HashMap::new()) }
    }

    pub fn issue(&self, digest: Digest, token: String) {
        self.issued
            .lock()
            .expect("download token map mutex poisoned")
            .insert(digest, (token, Instant::now()));
    }

    /// Removes and returns the token for `digest`, if any — one-time use.
    pub fn take(&self, digest: &Digest) -> Option<String> {
        self.issued.lock().expect("download token map mutex poisoned").remove(digest).map(|(token, _)| token)
    }

    pub fn put(&self, digest: Digest, token: String) {
        self.issue(digest, token);
    }

    pub fn sweep_expired(&self, timeout: Duration) {
        let now = Instant::now();
        self.issued
            .lock()
            .expect("download token map mutex poisoned")
            .retain(|_, (_, issued_at)| now.duration_since(*issued_at) <= timeout);
    }
}

pub use server::serve;
