use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::CatalogHash;

mod disk_cache;
mod from_addr;
mod fs;
mod http;
mod memory;

pub use self::disk_cache::DiskCacheCatalogStore;
pub use self::from_addr::{from_addr, from_location};
pub use self::fs::FsCatalogStore;
pub use self::http::HttpCatalogStore;
pub use self::memory::MemoryCatalogStore;

/// Name of the repository manifest, relative to the repository base.
pub const MANIFEST_NAME: &str = ".cvmfspublished";

/// The base trait all catalog stores need to implement.
/// A store hands out the compressed catalog blobs of a single repository,
/// addressed by their content hash, as well as the repository manifest.
/// Stores don't decompress or verify anything, that's left to the
/// [crate::CatalogFetcher].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Retrieves the compressed blob for the given hash.
    /// Returns Ok(None) if the store doesn't have it.
    async fn get(&self, hash: &CatalogHash) -> io::Result<Option<Bytes>>;

    /// Returns the compressed size of a blob, ideally without retrieving it.
    /// The default implementation retrieves the whole blob.
    async fn size(&self, hash: &CatalogHash) -> io::Result<Option<u64>> {
        Ok(self.get(hash).await?.map(|b| b.len() as u64))
    }

    /// Retrieves the raw `.cvmfspublished` manifest.
    async fn manifest(&self) -> io::Result<Option<Bytes>>;
}

#[async_trait]
impl<A> CatalogStore for A
where
    A: AsRef<dyn CatalogStore> + Send + Sync,
{
    async fn get(&self, hash: &CatalogHash) -> io::Result<Option<Bytes>> {
        self.as_ref().get(hash).await
    }

    async fn size(&self, hash: &CatalogHash) -> io::Result<Option<u64>> {
        self.as_ref().size(hash).await
    }

    async fn manifest(&self) -> io::Result<Option<Bytes>> {
        self.as_ref().manifest().await
    }
}
