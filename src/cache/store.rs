//! Content-addressed blob storage on local disk (§4.1).
//!
//! Blobs live at `<root>/<d[0:2]>/<d[2:4]>/<d>.bin`. Writers stage into
//! `<root>/staging/` (same filesystem as the shard tree) and atomically
//! rename into their final, digest-derived position on commit, mirroring
//! the teacher's mkstemp-then-rename idiom for crash-safe file replacement.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::digest::{Digest, DigestHasher};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        FileStore { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the store root and its staging area. Must succeed before the
    /// daemon will serve any request (unwritable cache dir is a fatal init error).
    pub async fn ensure_layout(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache root {:?}", self.root))?;
        fs::create_dir_all(self.staging_dir())
            .await
            .with_context(|| format!("creating staging dir under {:?}", self.root))?;
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let (a, b) = digest.shard();
        self.root.join(a).join(b).join(format!("{}.bin", digest.to_hex()))
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.staging_dir().join(name)
    }

    /// Opens a fresh staging file for a single-shot streamed ingest.
    pub async fn open_temp_write(&self, id: &str) -> Result<StreamingWrite, Error> {
        let path = self.staging_path(&format!("temp_{}.bin", id));
        let file = File::create(&path)
            .await
            .with_context(|| format!("creating staging file {:?}", path))?;
        Ok(StreamingWrite {
            store_root: self.root.clone(),
            path,
            file,
            hasher: DigestHasher::new(),
            bytes_written: 0,
        })
    }

    /// Opens (or reopens) the staging file for a chunked-upload session,
    /// appending to whatever bytes have already landed there.
    pub async fn open_chunk_write(&self, session_id: &str) -> Result<StreamingWrite, Error> {
        let path = self.staging_path(&format!("chunk_{}.bin", session_id));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening chunk staging file {:?}", path))?;
        let existing = fs::read(&path).await.unwrap_or_default();
        let mut hasher = DigestHasher::new();
        hasher.update(&existing);
        Ok(StreamingWrite {
            store_root: self.root.clone(),
            path,
            file,
            hasher,
            bytes_written: existing.len() as u64,
        })
    }

    pub async fn discard_staging(&self, path: &Path) {
        let _ = fs::remove_file(path).await;
    }

    pub async fn open_for_read(&self, digest: &Digest) -> Result<File, Error> {
        let path = self.path_for(digest);
        File::open(&path)
            .await
            .with_context(|| format!("opening blob {:?}", path))
    }

    pub async fn exists(&self, digest: &Digest) -> bool {
        fs::metadata(self.path_for(digest)).await.is_ok()
    }

    pub async fn size_on_disk(&self, digest: &Digest) -> Option<u64> {
        fs::metadata(self.path_for(digest)).await.ok().map(|m| m.len())
    }

    /// Unlinks the blob, then tries to prune the two levels of now-possibly-empty
    /// shard directories above it. Pruning failures are not an error: another
    /// blob may have landed in the same shard concurrently.
    pub async fn delete(&self, digest: &Digest) -> Result<(), Error> {
        let path = self.path_for(digest);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context(format!("deleting blob {:?}", path)),
        }
        if let Some(shard_dir) = path.parent() {
            let _ = fs::remove_dir(shard_dir).await;
            if let Some(top_dir) = shard_dir.parent() {
                let _ = fs::remove_dir(top_dir).await;
            }
        }
        Ok(())
    }

    /// Deletes every blob and shard directory under the store root; used on
    /// process shutdown to clear leftover staging state.
    pub async fn delete_all(&self) -> Result<(), Error> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("staging") {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await.ok();
            }
        }
        Ok(())
    }
}

/// A write in progress into the staging area. The digest is only known once
/// the final [`commit`](Self::commit) call returns.
pub struct StreamingWrite {
    store_root: PathBuf,
    path: PathBuf,
    file: File,
    hasher: DigestHasher,
    bytes_written: u64,
}

impl StreamingWrite {
    pub fn staging_path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file.write_all(buf).await.context("writing to staging file")?;
        self.hasher.update(buf);
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Flushes and atomically renames the staging file into its final,
    /// digest-derived location. Returns the digest and the final path; if an
    /// entry for this digest already exists, the staging file is discarded
    /// instead and the existing path is returned (dedup, §4.3).
    pub async fn commit(self) -> Result<(Digest, PathBuf, u64), Error> {
        let StreamingWrite {
            store_root,
            path,
            mut file,
            hasher,
            bytes_written,
        } = self;
        file.flush().await.context("flushing staging file")?;
        drop(file);

        let digest = hasher.finish();
        let (a, b) = digest.shard();
        let shard_dir = store_root.join(a).join(b);
        fs::create_dir_all(&shard_dir)
            .await
            .with_context(|| format!("creating shard dir {:?}", shard_dir))?;
        let final_path = shard_dir.join(format!("{}.bin", digest.to_hex()));

        if fs::metadata(&final_path).await.is_ok() {
            fs::remove_file(&path).await.ok();
            return Ok((digest, final_path, bytes_written));
        }

        fs::rename(&path, &final_path)
            .await
            .with_context(|| format!("renaming {:?} to {:?}", path, final_path))?;
        Ok((digest, final_path, bytes_written))
    }

    pub async fn abort(self) {
        let _ = fs::remove_file(&self.path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_places_blob_at_shard_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.ensure_layout().await.unwrap();

        let mut w = store.open_temp_write("abc").await.unwrap();
        w.write_all(b"hello\nworld\n").await.unwrap();
        let (digest, path, size) = w.commit().await.unwrap();

        assert_eq!(size, 12);
        assert!(path.exists());
        assert_eq!(path, store.path_for(&digest));
        assert!(store.exists(&digest).await);
    }

    #[tokio::test]
    async fn second_commit_of_same_bytes_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.ensure_layout().await.unwrap();

        let mut w1 = store.open_temp_write("one").await.unwrap();
        w1.write_all(b"same content").await.unwrap();
        let (d1, path1, _) = w1.commit().await.unwrap();

        let mut w2 = store.open_temp_write("two").await.unwrap();
        w2.write_all(b"same content").await.unwrap();
        let (d2, path2, _) = w2.commit().await.unwrap();

        assert_eq!(d1, d2);
        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn delete_removes_blob_and_empty_shard_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.ensure_layout().await.unwrap();

        let mut w = store.open_temp_write("x").await.unwrap();
        w.write_all(b"payload").await.unwrap();
        let (digest, path, _) = w.commit().await.unwrap();
        let shard_dir = path.parent().unwrap().to_path_buf();

        store.delete(&digest).await.unwrap();
        assert!(!path.exists());
        assert!(!shard_dir.exists());

        // idempotent on a second delete
        store.delete(&digest).await.unwrap();
    }

    #[tokio::test]
    async fn chunked_write_resumes_from_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.ensure_layout().await.unwrap();

        let mut w = store.open_chunk_write("session-1").await.unwrap();
        w.write_all(b"hello ").await.unwrap();
        assert_eq!(w.bytes_written(), 6);
        let staging = w.staging_path().to_path_buf();
        drop(w);

        let w2 = store.open_chunk_write("session-1").await.unwrap();
        assert_eq!(w2.bytes_written(), 6);
        assert_eq!(w2.staging_path(), staging);
    }
}
