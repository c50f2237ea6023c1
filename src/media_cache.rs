//! Media Cache: local cache of snapshot/clip bytes, addressed by
//! `(external_event_id, kind)` rather than by content hash — the bytes
//! aren't known until after the upstream fetch completes, so identity
//! addressing is what lets the cache be written-through during a
//! streaming fetch and swept for orphans afterwards (decision recorded
//! in DESIGN.md). Writes are atomic (temp file + rename) so a client
//! disconnect mid-fetch cannot corrupt a previously cached entry.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::model::MediaKind;
use crate::storage::EventStore;

pub struct MediaCache {
    root: PathBuf,
    retention_days: u32,
    max_bytes: u64,
}

fn sanitize_event_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn kind_filename(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Snapshot => "snapshot.jpg",
        MediaKind::Clip => "clip.mp4",
        MediaKind::VttSprite => "sprite.jpg",
        MediaKind::Vtt => "thumbnails.vtt",
    }
}

impl MediaCache {
    pub fn new(root: PathBuf, retention_days: u32, max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(&root).context("failed to create media cache directory")?;
        Ok(Self {
            root,
            retention_days,
            max_bytes,
        })
    }

    fn event_dir(&self, external_event_id: &str) -> PathBuf {
        self.root.join(sanitize_event_id(external_event_id))
    }

    pub fn path_for(&self, external_event_id: &str, kind: MediaKind) -> PathBuf {
        self.event_dir(external_event_id).join(kind_filename(kind))
    }

    /// Returns the cached path if present and non-empty, bumping its
    /// modified time so LRU eviction treats it as recently used.
    pub async fn cached(&self, external_event_id: &str, kind: MediaKind) -> Option<PathBuf> {
        let path = self.path_for(external_event_id, kind);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if meta.len() == 0 {
            return None;
        }
        touch(&path).await.ok();
        Some(path)
    }

    /// Writes a streamed upstream body to the cache atomically. Returns
    /// an error (mapped to `502` by the caller) if the stream yields zero
    /// bytes total.
    pub async fn write_atomic<S>(
        &self,
        external_event_id: &str,
        kind: MediaKind,
        mut chunks: S,
    ) -> Result<PathBuf>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let dir = self.event_dir(external_event_id);
        tokio::fs::create_dir_all(&dir).await?;
        let final_path = self.path_for(external_event_id, kind);

        let tmp = tempfile::NamedTempFile::new_in(&dir).context("failed to create temp cache file")?;
        let mut file = tokio::fs::File::from_std(tmp.reopen().context("failed to reopen temp cache file")?);

        let mut total: u64 = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.context("upstream media stream failed")?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if total == 0 {
            anyhow::bail!("upstream returned zero bytes");
        }

        let final_path_clone = final_path.clone();
        tokio::task::spawn_blocking(move || tmp.persist(&final_path_clone))
            .await?
            .context("failed to persist cache file")?;

        Ok(final_path)
    }

    /// Enforces `retention_days` and `max_bytes` size-based LRU eviction,
    /// and sweeps empty files plus whole event directories with no
    /// matching detection row.
    pub async fn enforce_retention(&self, store: &dyn EventStore) -> Result<()> {
        let root = self.root.clone();
        let retention_days = self.retention_days;
        let max_bytes = self.max_bytes;

        let mut event_dirs = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                event_dirs.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        let mut live_files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let cutoff = SystemTime::now() - std::time::Duration::from_secs(retention_days as u64 * 86_400);

        for dir_name in event_dirs {
            let exists = match store.get_by_external_id(&dir_name) {
                Ok(found) => found.is_some(),
                Err(_) => true,
            };
            let dir_path = root.join(&dir_name);
            if !exists {
                tokio::fs::remove_dir_all(&dir_path).await.ok();
                continue;
            }

            let mut files = tokio::fs::read_dir(&dir_path).await?;
            while let Some(file_entry) = files.next_entry().await? {
                let meta = match file_entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if meta.len() == 0 {
                    tokio::fs::remove_file(file_entry.path()).await.ok();
                    continue;
                }
                let modified = meta.modified().unwrap_or(SystemTime::now());
                if modified < cutoff {
                    tokio::fs::remove_file(file_entry.path()).await.ok();
                    continue;
                }
                live_files.push((file_entry.path(), meta.len(), modified));
            }
        }

        let mut total_bytes: u64 = live_files.iter().map(|(_, size, _)| size).sum();
        if total_bytes > max_bytes {
            live_files.sort_by_key(|(_, _, modified)| *modified);
            for (path, size, _) in live_files {
                if total_bytes <= max_bytes {
                    break;
                }
                if tokio::fs::remove_file(&path).await.is_ok() {
                    total_bytes = total_bytes.saturating_sub(size);
                }
            }
        }

        Ok(())
    }
}

async fn touch(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(SystemTime::now())
    })
    .await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteEventStore;

    fn chunk_stream(chunks: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes>> + Unpin {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path().to_path_buf(), 30, 1_000_000).unwrap();

        cache
            .write_atomic("E1", MediaKind::Snapshot, chunk_stream(vec![b"hello", b"world"]))
            .await
            .unwrap();

        let path = cache.cached("E1", MediaKind::Snapshot).await.unwrap();
        let contents = tokio::fs::read(path).await.unwrap();
        assert_eq!(contents, b"helloworld");
    }

    #[tokio::test]
    async fn zero_byte_upstream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path().to_path_buf(), 30, 1_000_000).unwrap();
        let result = cache.write_atomic("E1", MediaKind::Snapshot, chunk_stream(vec![])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn orphaned_directories_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path().to_path_buf(), 30, 1_000_000).unwrap();
        cache
            .write_atomic("GONE", MediaKind::Snapshot, chunk_stream(vec![b"x"]))
            .await
            .unwrap();

        let store = SqliteEventStore::open_in_memory().unwrap();
        cache.enforce_retention(&store).await.unwrap();

        assert!(cache.cached("GONE", MediaKind::Snapshot).await.is_none());
    }
}
