use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_LENGTH, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{CatalogStore, MANIFEST_NAME};
use crate::CatalogHash;

/// Fetches catalogs from a Stratum 0/1 server (or any HTTP mirror of one).
pub struct HttpCatalogStore {
    base_url: Url,
    http_client: ClientWithMiddleware,
}

impl HttpCatalogStore {
    pub fn new(mut base_url: Url) -> Self {
        // Url::join replaces the last segment unless there's a trailing slash.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        Self {
            base_url,
            http_client: ClientBuilder::new(reqwest::Client::new())
                .with(cvmfs_tracing::http_middleware())
                .build(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, key: &str) -> io::Result<Url> {
        self.base_url.join(key).map_err(|e| {
            warn!(err = %e, "unable to join URL");
            io::Error::new(io::ErrorKind::InvalidInput, "unable to join url")
        })
    }

    async fn get_optional(&self, url: Url) -> io::Result<Option<Bytes>> {
        debug!(url = %url, "requesting");

        let resp = self.http_client.get(url).send().await.map_err(|e| {
            warn!(err = %e, "unable to send request");
            io::Error::new(io::ErrorKind::Other, e)
        })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let resp = resp.error_for_status().map_err(|e| {
            warn!(err = %e, "unexpected response");
            io::Error::new(io::ErrorKind::Other, e.without_url())
        })?;

        let body = resp.bytes().await.map_err(|e| {
            warn!(err = %e, "failed to get response body");
            io::Error::new(io::ErrorKind::BrokenPipe, e.without_url())
        })?;

        Ok(Some(body))
    }
}

#[async_trait]
impl CatalogStore for HttpCatalogStore {
    #[instrument(skip_all, fields(catalog.hash = %hash), err)]
    async fn get(&self, hash: &CatalogHash) -> io::Result<Option<Bytes>> {
        self.get_optional(self.url_for(&hash.storage_key())?).await
    }

    /// Issues a HEAD request, and reads the Content-Length header.
    /// A response without that header is reported as size 0.
    #[instrument(skip_all, fields(catalog.hash = %hash), err)]
    async fn size(&self, hash: &CatalogHash) -> io::Result<Option<u64>> {
        let url = self.url_for(&hash.storage_key())?;

        let resp = self.http_client.head(url).send().await.map_err(|e| {
            warn!(err = %e, "unable to send HEAD request");
            io::Error::new(io::ErrorKind::Other, e)
        })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !resp.status().is_success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected status for HEAD request: {}", resp.status()),
            ));
        }

        Ok(Some(
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        ))
    }

    #[instrument(skip_all, fields(base_url = %self.base_url), err)]
    async fn manifest(&self) -> io::Result<Option<Bytes>> {
        self.get_optional(self.url_for(MANIFEST_NAME)?).await
    }
}
