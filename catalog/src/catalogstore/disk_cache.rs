use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::{fs::read_optional, CatalogStore};
use crate::CatalogHash;

/// Wraps another [CatalogStore], keeping a copy of every blob it hands out
/// in a local directory, using the same sharded layout as the server.
/// Catalog blobs are immutable, so cached entries never need invalidation.
/// The manifest is mutable, and always passed through.
pub struct DiskCacheCatalogStore<S> {
    inner: S,
    cache_dir: PathBuf,
    hits: AtomicU64,
    tmp_counter: AtomicU64,
}

impl<S> DiskCacheCatalogStore<S> {
    pub fn new(inner: S, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
            hits: AtomicU64::new(0),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Number of blobs served from the cache directory.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Writes to a temporary file first and renames it into place, so
    /// concurrent readers never see a partially written blob.
    async fn store(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&tmp_path, contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl<S> CatalogStore for DiskCacheCatalogStore<S>
where
    S: CatalogStore,
{
    #[instrument(level = "trace", skip_all, fields(catalog.hash = %hash), err)]
    async fn get(&self, hash: &CatalogHash) -> io::Result<Option<Bytes>> {
        let path = self.cache_dir.join(hash.storage_key());

        if let Some(contents) = read_optional(&path).await? {
            debug!("cache hit");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(contents));
        }

        let contents = match self.inner.get(hash).await? {
            Some(contents) => contents,
            None => return Ok(None),
        };

        // A failure to populate the cache is not a failure to fetch.
        if let Err(e) = self.store(&path, &contents).await {
            warn!(err = %e, path = %path.display(), "unable to write cache entry");
        }

        Ok(Some(contents))
    }

    async fn size(&self, hash: &CatalogHash) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(self.cache_dir.join(hash.storage_key())).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(_) => self.inner.size(hash).await,
        }
    }

    async fn manifest(&self) -> io::Result<Option<Bytes>> {
        self.inner.manifest().await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::DiskCacheCatalogStore;
    use crate::catalogstore::{CatalogStore, MemoryCatalogStore};
    use crate::fixtures::{DUMMY_HASH_1, DUMMY_HASH_2};

    #[tokio::test]
    async fn populates_and_hits() {
        let tmpdir = TempDir::new().unwrap();
        let inner = MemoryCatalogStore::default();
        inner.put(DUMMY_HASH_1.clone(), &b"blob"[..]);

        let store = DiskCacheCatalogStore::new(inner.clone(), tmpdir.path());

        // first read goes to the inner store, and populates the cache.
        assert_eq!(
            Some(&b"blob"[..]),
            store.get(&DUMMY_HASH_1).await.unwrap().as_deref()
        );
        assert_eq!(0, store.hits());
        assert!(tmpdir.path().join(DUMMY_HASH_1.storage_key()).exists());

        // remove it from the inner store, it must still be served.
        inner.remove(&DUMMY_HASH_1);
        assert_eq!(
            Some(&b"blob"[..]),
            store.get(&DUMMY_HASH_1).await.unwrap().as_deref()
        );
        assert_eq!(1, store.hits());
        assert_eq!(Some(4), store.size(&DUMMY_HASH_1).await.unwrap());

        // absent everywhere
        assert!(store.get(&DUMMY_HASH_2).await.unwrap().is_none());
        assert!(!tmpdir.path().join(DUMMY_HASH_2.storage_key()).exists());
    }
}
