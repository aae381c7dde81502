use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{instrument, warn};

use super::{CatalogStore, MANIFEST_NAME};
use crate::CatalogHash;

/// Reads catalogs from a local mirror of a repository, laid out the same
/// way as on a Stratum server (`<root>/data/xx/yyy…C`).
#[derive(Clone, Debug)]
pub struct FsCatalogStore {
    root: PathBuf,
}

impl FsCatalogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reads a whole file, mapping a missing file to Ok(None).
pub(super) async fn read_optional(path: &Path) -> io::Result<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents.into())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => {
            warn!(err = %e, path = %path.display(), "unable to read file");
            Err(e)
        }
    }
}

#[async_trait]
impl CatalogStore for FsCatalogStore {
    #[instrument(level = "trace", skip_all, fields(catalog.hash = %hash), err)]
    async fn get(&self, hash: &CatalogHash) -> io::Result<Option<Bytes>> {
        read_optional(&self.root.join(hash.storage_key())).await
    }

    #[instrument(level = "trace", skip_all, fields(catalog.hash = %hash), err)]
    async fn size(&self, hash: &CatalogHash) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(self.root.join(hash.storage_key())).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn manifest(&self) -> io::Result<Option<Bytes>> {
        read_optional(&self.root.join(MANIFEST_NAME)).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::FsCatalogStore;
    use crate::catalogstore::{CatalogStore, MANIFEST_NAME};
    use crate::fixtures::{DUMMY_HASH_1, DUMMY_HASH_2};

    #[tokio::test]
    async fn layout() {
        let tmpdir = TempDir::new().unwrap();
        let key = DUMMY_HASH_1.storage_key();
        let path = tmpdir.path().join(&key);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"blob").await.unwrap();
        tokio::fs::write(tmpdir.path().join(MANIFEST_NAME), b"C\n--\n")
            .await
            .unwrap();

        let store = FsCatalogStore::new(tmpdir.path());

        assert_eq!(
            Some(&b"blob"[..]),
            store.get(&DUMMY_HASH_1).await.unwrap().as_deref()
        );
        assert_eq!(Some(4), store.size(&DUMMY_HASH_1).await.unwrap());
        assert!(store.get(&DUMMY_HASH_2).await.unwrap().is_none());
        assert!(store.size(&DUMMY_HASH_2).await.unwrap().is_none());
        assert!(store.manifest().await.unwrap().is_some());
    }
}
