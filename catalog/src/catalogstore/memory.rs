use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::CatalogStore;
use crate::CatalogHash;

/// Keeps catalog blobs in a HashMap. Mostly useful for tests.
/// Clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct MemoryCatalogStore {
    db: Arc<RwLock<HashMap<CatalogHash, Bytes>>>,
    manifest: Arc<RwLock<Option<Bytes>>>,
    reads: Arc<AtomicUsize>,
}

impl MemoryCatalogStore {
    /// Inserts a blob under the given hash. The hash is not checked against
    /// the contents, which allows tests to insert corrupted blobs.
    pub fn put(&self, hash: CatalogHash, contents: impl Into<Bytes>) {
        self.db.write().insert(hash, contents.into());
    }

    pub fn remove(&self, hash: &CatalogHash) -> Option<Bytes> {
        self.db.write().remove(hash)
    }

    pub fn set_manifest(&self, contents: impl Into<Bytes>) {
        *self.manifest.write() = Some(contents.into());
    }

    /// Number of successful blob reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    #[instrument(level = "trace", skip_all, fields(catalog.hash = %hash))]
    async fn get(&self, hash: &CatalogHash) -> io::Result<Option<Bytes>> {
        let blob = self.db.read().get(hash).cloned();
        if blob.is_some() {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(blob)
    }

    async fn size(&self, hash: &CatalogHash) -> io::Result<Option<u64>> {
        Ok(self.db.read().get(hash).map(|b| b.len() as u64))
    }

    async fn manifest(&self) -> io::Result<Option<Bytes>> {
        Ok(self.manifest.read().clone())
    }
}
