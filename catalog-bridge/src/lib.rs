use std::collections::HashMap;
use std::sync::Arc;

use axum::{routing::get, Router};
use cvmfs_catalog::CatalogFetcher;

mod catalogs;

/// Repositories the bridge answers for, by name.
#[derive(Clone)]
pub struct AppState {
    repositories: Arc<HashMap<String, Arc<CatalogFetcher>>>,
}

impl AppState {
    pub fn new(repositories: HashMap<String, Arc<CatalogFetcher>>) -> Self {
        Self {
            repositories: Arc::new(repositories),
        }
    }

    fn fetcher(&self, repo: &str) -> Option<Arc<CatalogFetcher>> {
        self.repositories.get(repo).cloned()
    }
}

pub fn gen_router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/:repo/catalogs/:hash", get(catalogs::get))
}

async fn root() -> &'static str {
    "Hello from catalog-bridge"
}
