//! The Metadata Registry (§4.2): an in-memory map of digest → entry, an
//! alias index, and a tombstone set. All composite mutations are serialized
//! behind a single mutex so that "register-aliases AND update replication
//! map" style operations stay atomic against lookups (§5).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::digest::{trailing_hex64, Digest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteDescriptor {
    pub status: Option<ReplicationStatus>,
    pub remote_name: Option<String>,
    pub remote_uri: Option<String>,
    pub remote_expiration: Option<SystemTime>,
}

impl RemoteDescriptor {
    pub fn is_synced(&self) -> bool {
        matches!(self.status, Some(ReplicationStatus::Synced))
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub digest: Digest,
    pub path: PathBuf,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    pub expiration: Option<SystemTime>,
    pub replication: HashMap<String, RemoteDescriptor>,
    /// A remote-only stub created via `ensure_remote_stub`: the path is a
    /// placeholder never read from disk.
    pub is_stub: bool,
}

impl CacheEntry {
    pub fn missing_on(&self, executor: &str) -> bool {
        !self
            .replication
            .get(executor)
            .map(RemoteDescriptor::is_synced)
            .unwrap_or(false)
    }
}

/// The cloud file descriptor as returned by an executor after a successful
/// upload or a remote-originated `get_file`/`list_files` response.
#[derive(Debug, Clone, Default)]
pub struct RemoteFileDescriptor {
    pub name: String,
    pub uri: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub sha256_hash: Option<String>,
    pub expiration: Option<SystemTime>,
    pub display_name: Option<String>,
}

struct State {
    entries: HashMap<Digest, CacheEntry>,
    aliases: HashMap<String, Digest>,
    tombstones: HashSet<Digest>,
    tombstone_aliases: HashMap<String, Digest>,
}

pub struct MetadataRegistry {
    state: Mutex<State>,
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataRegistry {
    pub fn new() -> Self {
        MetadataRegistry {
            state: Mutex::new(State {
                entries: HashMap::new(),
                aliases: HashMap::new(),
                tombstones: HashSet::new(),
                tombstone_aliases: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("metadata registry mutex poisoned")
    }

    pub fn get(&self, digest: &Digest) -> Option<CacheEntry> {
        self.lock().entries.get(digest).cloned()
    }

    pub fn is_tombstoned(&self, digest: &Digest) -> bool {
        self.lock().tombstones.contains(digest)
    }

    /// Resolves any external name for a file to its live entry, trying in
    /// order: direct alias, the trailing id of a `files/<id>` form, a
    /// full-URI scan, a replication-map back-scan, and finally a trailing
    /// 64-hex-char match against a live digest. Aliases recovered via
    /// back-scan are eagerly registered so future lookups take the fast path.
    pub fn resolve(&self, alias: &str) -> Option<CacheEntry> {
        let mut state = self.lock();

        if let Some(digest) = state.aliases.get(alias).copied() {
            return state.entries.get(&digest).cloned();
        }

        if let Some(id) = alias.strip_prefix("files/") {
            if let Some(digest) = state.aliases.get(id).copied() {
                state.aliases.insert(alias.to_string(), digest);
                return state.entries.get(&digest).cloned();
            }
        }

        for (known_alias, digest) in state.aliases.clone().iter() {
            if known_alias == alias {
                continue;
            }
            if alias.ends_with(known_alias.as_str()) || known_alias.ends_with(alias) {
                return state.entries.get(digest).cloned();
            }
        }

        let back_scan_hit = state.entries.iter().find_map(|(digest, entry)| {
            entry.replication.values().any(|r| {
                r.remote_uri.as_deref() == Some(alias) || r.remote_name.as_deref() == Some(alias)
            }).then_some(*digest)
        });
        if let Some(digest) = back_scan_hit {
            state.aliases.insert(alias.to_string(), digest);
            return state.entries.get(&digest).cloned();
        }

        if let Some(hex) = trailing_hex64(alias) {
            if let Some(digest) = Digest::from_hex(hex) {
                if state.entries.contains_key(&digest) {
                    state.aliases.insert(alias.to_string(), digest);
                    return state.entries.get(&digest).cloned();
                }
            }
        }

        None
    }

    pub fn register_aliases(&self, digest: Digest, aliases: &[String]) {
        let mut state = self.lock();
        for alias in aliases {
            state.tombstone_aliases.remove(alias);
            state.aliases.insert(alias.clone(), digest);
        }
    }

    pub fn remove_aliases(&self, aliases: &[String]) {
        let mut state = self.lock();
        for alias in aliases {
            state.aliases.remove(alias);
        }
    }

    pub fn create(
        &self,
        digest: Digest,
        path: PathBuf,
        filename: String,
        mime: String,
        size: u64,
    ) -> CacheEntry {
        let now = SystemTime::now();
        let mut state = self.lock();
        let entry = state.entries.entry(digest).or_insert_with(|| CacheEntry {
            digest,
            path,
            filename,
            mime,
            size,
            created_at: now,
            last_accessed: now,
            expiration: None,
            replication: HashMap::new(),
            is_stub: false,
        });
        entry.clone()
    }

    /// Creates (or returns the existing) entry for a file descriptor the
    /// broker did not originate locally — the path points at a zero-byte
    /// stub that scheduling decisions reference but nothing ever reads.
    pub fn ensure_remote_stub(&self, executor: &str, remote: RemoteFileDescriptor) -> Option<CacheEntry> {
        let digest = remote
            .sha256_hash
            .as_deref()
            .and_then(Digest::from_base64_or_hex)?;
        let now = SystemTime::now();
        let mut state = self.lock();
        let entry = state.entries.entry(digest).or_insert_with(|| CacheEntry {
            digest,
            path: PathBuf::from(format!("remote-stub:{}", digest.to_hex())),
            filename: remote
                .display_name
                .clone()
                .unwrap_or_else(|| remote.name.clone()),
            mime: remote.mime_type.clone().unwrap_or_else(|| "application/octet-stream".to_string()),
            size: remote.size_bytes.unwrap_or(0),
            created_at: now,
            last_accessed: now,
            expiration: remote.expiration,
            replication: HashMap::new(),
            is_stub: true,
        });
        entry.replication.insert(
            executor.to_string(),
            RemoteDescriptor {
                status: Some(ReplicationStatus::Synced),
                remote_name: Some(remote.name.clone()),
                remote_uri: remote.uri.clone(),
                remote_expiration: remote.expiration,
            },
        );
        if entry.expiration.is_none() {
            entry.expiration = remote.expiration;
        }
        let snapshot = entry.clone();
        drop(state);

        let mut aliases = vec![remote.name.clone()];
        if let Some(uri) = &remote.uri {
            aliases.push(uri.clone());
        }
        self.register_aliases(digest, &aliases);
        Some(snapshot)
    }

    pub fn update_replication(
        &self,
        digest: &Digest,
        executor: &str,
        status: ReplicationStatus,
        remote: Option<RemoteFileDescriptor>,
    ) {
        let mut state = self.lock();
        {
            let entry = match state.entries.get_mut(digest) {
                Some(entry) => entry,
                None => return,
            };
            let first = entry.expiration.is_none()
                && !entry.replication.values().any(RemoteDescriptor::is_synced);
            let descriptor = entry.replication.entry(executor.to_string()).or_default();
            descriptor.status = Some(status);
            if let Some(remote) = &remote {
                descriptor.remote_name = Some(remote.name.clone());
                descriptor.remote_uri = remote.uri.clone();
                descriptor.remote_expiration = remote.expiration;
                if first {
                    entry.expiration = remote.expiration;
                }
            }
        }

        if status == ReplicationStatus::Synced {
            if let Some(remote) = remote {
                drop(state);
                let mut aliases = vec![remote.name.clone()];
                if let Some(uri) = &remote.uri {
                    aliases.push(uri.clone());
                }
                self.register_aliases(*digest, &aliases);
            }
        }
    }

    /// Clears every executor's replication state for this digest, used by
    /// the rebuild-on-expire path before re-uploading.
    pub fn reset_replication(&self, digest: &Digest) {
        let mut state = self.lock();
        let remote_names: Vec<String> = match state.entries.get(digest) {
            Some(entry) => entry
                .replication
                .values()
                .filter_map(|r| r.remote_name.clone())
                .collect(),
            None => return,
        };
        if let Some(entry) = state.entries.get_mut(digest) {
            entry.replication.clear();
        }
        for name in remote_names {
            state.aliases.remove(&name);
        }
    }

    pub fn touch(&self, digest: &Digest) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(digest) {
            entry.last_accessed = SystemTime::now();
        }
    }

    pub fn list(&self, page_size: usize, start_index: usize) -> (Vec<CacheEntry>, Option<usize>) {
        let state = self.lock();
        let mut all: Vec<&CacheEntry> = state.entries.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.digest.cmp(&b.digest)));
        let end = (start_index + page_size).min(all.len());
        let page: Vec<CacheEntry> = if start_index >= all.len() {
            Vec::new()
        } else {
            all[start_index..end].iter().map(|e| (*e).clone()).collect()
        };
        let next = if end < all.len() { Some(end) } else { None };
        (page, next)
    }

    /// Permanently removes an entry's metadata (used by eviction and, after
    /// tombstoning, by explicit delete). Does not touch the physical blob.
    pub fn destroy(&self, digest: &Digest) -> Option<CacheEntry> {
        let mut state = self.lock();
        let entry = state.entries.remove(digest)?;
        let mut dead_aliases: Vec<String> = state
            .aliases
            .iter()
            .filter(|(_, d)| *d == &entry.digest)
            .map(|(a, _)| a.clone())
            .collect();
        dead_aliases.dedup();
        for alias in &dead_aliases {
            state.aliases.remove(alias);
        }
        Some(entry)
    }

    /// Records an explicit user deletion: destroys the entry's metadata and
    /// moves its aliases into the tombstone set so a delayed executor
    /// response cannot resurrect it.
    pub fn tombstone(&self, digest: Digest, extra_aliases: &[String]) {
        let removed = self.destroy(&digest);
        let mut state = self.lock();
        state.tombstones.insert(digest);
        if let Some(entry) = removed {
            for descriptor in entry.replication.values() {
                if let Some(name) = &descriptor.remote_name {
                    state.tombstone_aliases.insert(name.clone(), digest);
                }
            }
        }
        for alias in extra_aliases {
            state.tombstone_aliases.insert(alias.clone(), digest);
        }
    }

    pub fn clear_tombstone(&self, digest: &Digest) {
        let mut state = self.lock();
        state.tombstones.remove(digest);
        state.tombstone_aliases.retain(|_, d| d != digest);
    }

    pub fn snapshot_for_eviction(&self) -> Vec<CacheEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }
}

pub fn unix_time(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_digest(bytes: &[u8]) -> Digest {
        Digest::of_bytes(bytes)
    }

    #[test]
    fn resolve_via_direct_alias() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"one");
        registry.create(digest, PathBuf::from("/tmp/one"), "one.txt".into(), "text/plain".into(), 3);
        registry.register_aliases(digest, &["files/abc".to_string()]);

        let resolved = registry.resolve("files/abc").unwrap();
        assert_eq!(resolved.digest, digest);
    }

    #[test]
    fn resolve_via_trailing_id_of_files_form() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"two");
        registry.create(digest, PathBuf::from("/tmp/two"), "two.txt".into(), "text/plain".into(), 3);
        registry.register_aliases(digest, &["abc123".to_string()]);

        let resolved = registry.resolve("files/abc123").unwrap();
        assert_eq!(resolved.digest, digest);
    }

    #[test]
    fn resolve_via_trailing_hex64_fallback() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"three");
        registry.create(digest, PathBuf::from("/tmp/three"), "three.txt".into(), "text/plain".into(), 5);

        let alias = format!("some/prefix/{}", digest.to_hex());
        let resolved = registry.resolve(&alias).unwrap();
        assert_eq!(resolved.digest, digest);
    }

    #[test]
    fn tombstoned_digest_is_not_live_and_aliases_move() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"four");
        registry.create(digest, PathBuf::from("/tmp/four"), "four.txt".into(), "text/plain".into(), 4);
        registry.register_aliases(digest, &["files/four-id".to_string()]);

        registry.tombstone(digest, &[]);

        assert!(registry.get(&digest).is_none());
        assert!(registry.is_tombstoned(&digest));
        assert!(registry.resolve("files/four-id").is_none());
    }

    #[test]
    fn update_replication_registers_remote_aliases() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"five");
        registry.create(digest, PathBuf::from("/tmp/five"), "five.txt".into(), "text/plain".into(), 4);

        registry.update_replication(
            &digest,
            "executor-1",
            ReplicationStatus::Synced,
            Some(RemoteFileDescriptor {
                name: "files/remote-five".to_string(),
                uri: Some("https://cloud/files/remote-five".to_string()),
                ..Default::default()
            }),
        );

        let resolved = registry.resolve("files/remote-five").unwrap();
        assert_eq!(resolved.digest, digest);
        assert!(resolved.replication["executor-1"].is_synced());
    }

    #[test]
    fn reset_replication_clears_map_and_aliases() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"six");
        registry.create(digest, PathBuf::from("/tmp/six"), "six.txt".into(), "text/plain".into(), 3);
        registry.update_replication(
            &digest,
            "executor-1",
            ReplicationStatus::Synced,
            Some(RemoteFileDescriptor {
                name: "files/remote-six".to_string(),
                ..Default::default()
            }),
        );

        registry.reset_replication(&digest);

        let entry = registry.get(&digest).unwrap();
        assert!(entry.replication.is_empty());
        assert!(registry.resolve("files/remote-six").is_none());
    }

    #[test]
    fn list_paginates_and_provides_next_token() {
        let registry = MetadataRegistry::new();
        for i in 0..5u8 {
            let digest = make_digest(&[i]);
            registry.create(digest, PathBuf::from(format!("/tmp/{}", i)), format!("{}.bin", i), "application/octet-stream".into(), 1);
        }
        let (page, next) = registry.list(2, 0);
        assert_eq!(page.len(), 2);
        assert_eq!(next, Some(2));
        let (page2, next2) = registry.list(2, 4);
        assert_eq!(page2.len(), 1);
        assert_eq!(next2, None);
    }

    #[test]
    fn register_then_remove_aliases_round_trips() {
        let registry = MetadataRegistry::new();
        let digest = make_digest(b"seven");
        registry.create(digest, PathBuf::from("/tmp/seven"), "seven.txt".into(), "text/plain".into(), 5);
        registry.register_aliases(digest, &["a".to_string(), "b".to_string()]);
        assert!(registry.resolve("a").is_some());
        registry.remove_aliases(&["a".to_string(), "b".to_string()]);
        assert!(registry.resolve("a").is_none());
        assert!(registry.resolve("b").is_none());
    }
}
