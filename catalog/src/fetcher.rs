use std::num::NonZeroUsize;
use std::sync::Arc;

use async_compression::tokio::bufread::ZlibDecoder;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use crate::catalogstore::CatalogStore;
use crate::manifest::{self, Manifest};
use crate::{CatalogHash, CatalogRef, Error};

const DEFAULT_CACHE_CAPACITY: usize = 64;

/// A catalog as retrieved from a store and decompressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedCatalog {
    /// Size of the compressed blob, the cost of downloading it.
    pub compressed_size: u64,
    /// The decompressed SQLite database.
    pub raw: Bytes,
}

/// Retrieves catalogs from a [CatalogStore], verifies and decompresses them.
///
/// Catalogs are immutable and addressed by content, so decompressed results
/// are kept in a small LRU, and fetching the same hash again returns the
/// same bytes without going to the store.
/// There are no retries in here, that's up to the caller.
pub struct CatalogFetcher {
    store: Arc<dyn CatalogStore>,
    verify: bool,
    cache: Mutex<LruCache<CatalogHash, FetchedCatalog>>,
}

impl CatalogFetcher {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            verify: true,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).expect("non-zero"),
            )),
        }
    }

    pub fn with_cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cache = Mutex::new(LruCache::new(capacity));
        self
    }

    /// Controls whether the SHA-1 of retrieved blobs is checked against the
    /// requested hash. On by default.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    #[instrument(skip_all, fields(catalog.hash = %catalog.hash, catalog.mount_path = %catalog.mount_path), err)]
    pub async fn fetch(&self, catalog: &CatalogRef) -> Result<FetchedCatalog, Error> {
        let cached = self.cache.lock().get(&catalog.hash).cloned();
        if let Some(fetched) = cached {
            debug!("served from cache");
            return Ok(fetched);
        }

        let compressed = self
            .store
            .get(&catalog.hash)
            .await
            .map_err(|e| Error::Fetch(format!("catalog {}: {}", catalog.hash, e)))?
            .ok_or_else(|| Error::NotFound(format!("catalog {}", catalog.hash)))?;

        if self.verify {
            let actual = CatalogHash::of(&compressed);
            if actual != catalog.hash {
                warn!(catalog.actual_hash = %actual, "retrieved catalog has the wrong hash");
                return Err(Error::Decode(format!(
                    "content hash mismatch: expected {}, got {}",
                    catalog.hash, actual
                )));
            }
        }

        let fetched = FetchedCatalog {
            compressed_size: compressed.len() as u64,
            raw: decompress(&compressed).await?,
        };

        debug!(
            compressed_size = fetched.compressed_size,
            raw_size = fetched.raw.len(),
            "fetched catalog"
        );

        self.cache.lock().put(catalog.hash.clone(), fetched.clone());
        Ok(fetched)
    }

    /// Looks up the compressed size of a catalog without fetching it, if the
    /// store supports that. Returns Ok(None) if the store doesn't know it.
    #[instrument(skip_all, fields(catalog.hash = %hash), err)]
    pub async fn size_of(&self, hash: &CatalogHash) -> Result<Option<u64>, Error> {
        let cached = self.cache.lock().peek(hash).map(|f| f.compressed_size);
        if cached.is_some() {
            return Ok(cached);
        }

        self.store
            .size(hash)
            .await
            .map_err(|e| Error::Fetch(format!("catalog {}: {}", hash, e)))
    }

    pub async fn manifest(&self) -> Result<Manifest, Error> {
        manifest::resolve_root(&self.store).await
    }
}

/// Inflates a zlib-compressed catalog.
pub async fn decompress(compressed: &[u8]) -> Result<Bytes, Error> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .await
        .map_err(|e| Error::Decode(e.to_string()))?;

    if raw.is_empty() {
        return Err(Error::Decode("decompressed to nothing".to_string()));
    }

    Ok(raw.into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::CatalogFetcher;
    use crate::catalogstore::MemoryCatalogStore;
    use crate::fixtures::{compress, put_catalog, CATALOG_SMALL, DUMMY_HASH_1};
    use crate::{CatalogHash, CatalogRef, Error, ErrorKind};

    #[tokio::test]
    async fn fetch_twice_is_identical() {
        let store = MemoryCatalogStore::default();
        let (hash, size) = put_catalog(&store, &CATALOG_SMALL).await;
        let fetcher = CatalogFetcher::new(Arc::new(store.clone()));

        let first = fetcher.fetch(&CatalogRef::root(hash.clone())).await.unwrap();
        let second = fetcher.fetch(&CatalogRef::root(hash)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(&CATALOG_SMALL[..], &first.raw[..]);
        assert_eq!(size, first.compressed_size);
        // the second fetch didn't hit the store.
        assert_eq!(1, store.reads());
    }

    #[tokio::test]
    async fn fetch_missing() {
        let fetcher = CatalogFetcher::new(Arc::new(MemoryCatalogStore::default()));
        let err = fetcher
            .fetch(&CatalogRef::root(DUMMY_HASH_1.clone()))
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(ErrorKind::Fetch, err.kind());
    }

    #[tokio::test]
    async fn fetch_not_zlib() {
        let store = MemoryCatalogStore::default();
        let garbage = Bytes::from_static(b"definitely not zlib");
        let hash = CatalogHash::of(&garbage);
        store.put(hash.clone(), garbage);

        let fetcher = CatalogFetcher::new(Arc::new(store));
        assert!(matches!(
            fetcher.fetch(&CatalogRef::root(hash)).await,
            Err(Error::Decode(_))
        ));
    }

    #[tokio::test]
    async fn fetch_hash_mismatch() {
        let store = MemoryCatalogStore::default();
        store.put(DUMMY_HASH_1.clone(), compress(&CATALOG_SMALL).await);

        let fetcher = CatalogFetcher::new(Arc::new(store.clone()));
        assert!(matches!(
            fetcher.fetch(&CatalogRef::root(DUMMY_HASH_1.clone())).await,
            Err(Error::Decode(_))
        ));

        // without verification, the blob is accepted.
        let fetcher = CatalogFetcher::new(Arc::new(store)).with_verification(false);
        let fetched = fetcher
            .fetch(&CatalogRef::root(DUMMY_HASH_1.clone()))
            .await
            .expect("must succeed");
        assert_eq!(&CATALOG_SMALL[..], &fetched.raw[..]);
    }

    #[tokio::test]
    async fn size_of() {
        let store = MemoryCatalogStore::default();
        let (hash, size) = put_catalog(&store, &CATALOG_SMALL).await;
        let fetcher = CatalogFetcher::new(Arc::new(store));

        assert_eq!(Some(size), fetcher.size_of(&hash).await.unwrap());
        assert_eq!(None, fetcher.size_of(&DUMMY_HASH_1).await.unwrap());
    }
}
