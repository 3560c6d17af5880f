//! The Eviction Loop (§4.4): a single cooperative worker that wakes on a
//! configured interval and runs TTL, LRU, and session sweeps in order.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, info};
use tokio::time::MissedTickBehavior;

use crate::cache::ingest::IngestPipeline;
use crate::cache::registry::{unix_time, MetadataRegistry};
use crate::cache::store::FileStore;
use crate::digest::Digest;

pub struct EvictionLoop {
    store: Arc<FileStore>,
    registry: Arc<MetadataRegistry>,
    ingest: Arc<IngestPipeline>,
    quota_bytes: u64,
    session_timeout: Duration,
}

impl EvictionLoop {
    pub fn new(
        store: Arc<FileStore>,
        registry: Arc<MetadataRegistry>,
        ingest: Arc<IngestPipeline>,
        quota_bytes: u64,
        session_timeout: Duration,
    ) -> Self {
        EvictionLoop {
            store,
            registry,
            ingest,
            quota_bytes,
            session_timeout,
        }
    }

    /// Runs one sweep: TTL, then LRU down to quota, then session timeout,
    /// then applies the marks. Returns the digests it destroyed.
    pub async fn sweep_once(&self) -> Vec<Digest> {
        let now = SystemTime::now();
        let entries = self.registry.snapshot_for_eviction();

        let mut marked: Vec<Digest> = entries
            .iter()
            .filter(|e| matches!(e.expiration, Some(exp) if exp <= now))
            .map(|e| e.digest)
            .collect();

        let mut live: Vec<_> = entries
            .iter()
            .filter(|e| !marked.contains(&e.digest))
            .collect();
        live.sort_by_key(|e| e.last_accessed);
        let mut total: u64 = live.iter().map(|e| e.size).sum();
        let mut i = 0;
        while total > self.quota_bytes && i < live.len() {
            let entry = live[i];
            marked.push(entry.digest);
            total = total.saturating_sub(entry.size);
            i += 1;
        }

        for digest in &marked {
            if let Some(entry) = self.registry.destroy(digest) {
                if !entry.is_stub {
                    if let Err(err) = self.store.delete(digest).await {
                        debug!("eviction: failed to delete blob {}: {:#}", digest, err);
                    }
                }
                info!(
                    "evicted {} ({} bytes, expiration={:?})",
                    digest,
                    entry.size,
                    entry.expiration.map(unix_time)
                );
            }
        }

        let expired_sessions = self.ingest.sweep_expired_sessions(self.session_timeout);
        if !expired_sessions.is_empty() {
            info!("expired {} stale upload session(s)", expired_sessions.len());
        }

        marked
    }

    /// Runs [`sweep_once`](Self::sweep_once) on a fixed interval until the
    /// supplied cancellation future resolves.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: impl std::future::Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = &mut shutdown => {
                    debug!("eviction loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ingest::SessionMeta;
    use std::time::Duration;

    fn setup() -> (Arc<FileStore>, Arc<MetadataRegistry>, Arc<IngestPipeline>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()));
        let registry = Arc::new(MetadataRegistry::new());
        let ingest = Arc::new(IngestPipeline::new(store.clone(), registry.clone()));
        (store, registry, ingest, dir)
    }

    #[tokio::test]
    async fn ttl_sweep_removes_expired_entries() {
        let (store, registry, ingest, _dir) = setup();
        store.ensure_layout().await.unwrap();
        let digest = Digest::of_bytes(b"expired");
        registry.create(digest, store.path_for(&digest), "a.bin".into(), "application/octet-stream".into(), 1);
        registry.update_replication(
            &digest,
            "executor-1",
            crate::cache::registry::ReplicationStatus::Synced,
            Some(crate::cache::registry::RemoteFileDescriptor {
                name: "files/expired".to_string(),
                expiration: Some(SystemTime::now() - Duration::from_secs(10)),
                ..Default::default()
            }),
        );

        let evictor = EvictionLoop::new(store, registry.clone(), ingest, u64::MAX, Duration::from_secs(3600));
        let destroyed = evictor.sweep_once().await;
        assert_eq!(destroyed, vec![digest]);
        assert!(registry.get(&digest).is_none());
    }

    #[tokio::test]
    async fn lru_sweep_evicts_oldest_first_to_meet_quota() {
        let (store, registry, ingest, _dir) = setup();
        store.ensure_layout().await.unwrap();

        let d1 = Digest::of_bytes(b"one-payload");
        registry.create(d1, store.path_for(&d1), "1.bin".into(), "application/octet-stream".into(), 100);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let d2 = Digest::of_bytes(b"two-payload");
        registry.create(d2, store.path_for(&d2), "2.bin".into(), "application/octet-stream".into(), 100);

        let evictor = EvictionLoop::new(store, registry.clone(), ingest, 150, Duration::from_secs(3600));
        let destroyed = evictor.sweep_once().await;
        assert_eq!(destroyed, vec![d1]);
        assert!(registry.get(&d1).is_none());
        assert!(registry.get(&d2).is_some());
    }

    #[tokio::test]
    async fn session_sweep_drops_stale_sessions() {
        let (store, registry, ingest, _dir) = setup();
        store.ensure_layout().await.unwrap();
        ingest.create_session("stale".into(), SessionMeta::default());

        let evictor = EvictionLoop::new(store, registry, ingest.clone(), u64::MAX, Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        evictor.sweep_once().await;
        assert!(ingest.session_meta("stale").is_none());
    }
}
