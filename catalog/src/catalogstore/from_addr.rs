use std::sync::Arc;

use url::Url;

use super::{CatalogStore, FsCatalogStore, HttpCatalogStore, MemoryCatalogStore};
use crate::Error;

/// Constructs a new instance of a [CatalogStore] from an URI.
///
/// The following schemes are supported by the following stores:
/// - `memory://` ([MemoryCatalogStore])
/// - `file:///path/to/repo` ([FsCatalogStore])
/// - `http://…`, `https://…` ([HttpCatalogStore])
pub fn from_addr(uri: &str) -> Result<Arc<dyn CatalogStore>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let catalog_store: Arc<dyn CatalogStore> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest("invalid url".to_string()));
            }
            Arc::<MemoryCatalogStore>::default()
        }
        "file" => {
            // "Returns Err if the host is neither empty nor "localhost""
            let path = url.to_file_path().map_err(|_| {
                Error::InvalidRequest("invalid host for file:// scheme".to_string())
            })?;
            Arc::new(FsCatalogStore::new(path))
        }
        "http" | "https" => Arc::new(HttpCatalogStore::new(url)),
        scheme => {
            return Err(Error::InvalidRequest(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok(catalog_store)
}

/// Like [from_addr], but also accepts plain filesystem paths, which are
/// turned into `file://` URLs.
pub fn from_location(location: &str) -> Result<Arc<dyn CatalogStore>, Error> {
    if location.contains("://") {
        return from_addr(location);
    }

    let path = std::path::absolute(location).map_err(|e| {
        Error::InvalidRequest(format!("unable to resolve {}: {}", location, e))
    })?;
    Ok(Arc::new(FsCatalogStore::new(path)))
}
