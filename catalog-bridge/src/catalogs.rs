use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use cvmfs_catalog::drilldown::build_directory_tree;
use cvmfs_catalog::{CatalogHash, Error, SiblingSizing};
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct GetCatalogParams {
    /// Mount path the caller expects the catalog at, `/` for the root
    /// catalog. Only checked, the catalog knows its own mount path.
    path: Option<String>,
    sizing: Option<String>,
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::InvalidHash(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Fetch(_) => StatusCode::BAD_GATEWAY,
        Error::Decode(_) | Error::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[instrument(skip(state))]
pub async fn get(
    Path((repo, hash)): Path<(String, String)>,
    Query(GetCatalogParams { path, sizing }): Query<GetCatalogParams>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let hash: CatalogHash = hash.parse().map_err(|e: Error| {
        warn!(err = %e, "invalid catalog hash");
        status_for(&e)
    })?;

    let sizing = match sizing {
        Some(sizing) => sizing.parse::<SiblingSizing>().map_err(|e: Error| {
            warn!(err = %e, "invalid sizing");
            status_for(&e)
        })?,
        None => SiblingSizing::Proportional,
    };

    let fetcher = state.fetcher(&repo).ok_or_else(|| {
        warn!("unknown repository");
        StatusCode::NOT_FOUND
    })?;

    let mount_path = path.as_deref().map(|p| p.trim_end_matches('/'));
    let tree = build_directory_tree(&fetcher, &hash, mount_path, sizing)
        .await
        .map_err(|e| status_for(&e))?;

    // catalogs are content-addressed, the answer never changes.
    Ok((
        [(header::CACHE_CONTROL, "max-age=31536000, immutable")],
        Json(tree),
    ))
}
