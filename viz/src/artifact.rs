//! The files a pipeline run leaves behind: one zstd-compressed JSON envelope
//! per repository, and optionally the raw walked tree for the next run.
use std::io;
use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use chrono::{DateTime, Utc};
use cvmfs_catalog::{Subtree, WalkConfig, WalkStats};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

use crate::VizNode;

pub const GENERATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M UTC";
pub const ARTIFACT_SUFFIX: &str = ".json.zst";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
        move |source| Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What the chart loads for a repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub repo_name: String,
    pub repo_url: String,
    pub generated_at: String,
    pub max_catalogs: Option<usize>,
    pub catalogs_downloaded: usize,
    /// Some catalogs couldn't be read, the tree has gaps.
    pub incomplete: bool,
    pub stats: WalkStats,
    pub tree: VizNode,
}

pub fn format_generated_at(at: DateTime<Utc>) -> String {
    at.format(GENERATED_AT_FORMAT).to_string()
}

/// Turns a repository name into something usable as a file name.
pub fn safe_name(repo_name: &str) -> String {
    repo_name.replace(['/', '.'], "_")
}

pub fn artifact_file_name(repo_name: &str) -> String {
    format!("{}{}", safe_name(repo_name), ARTIFACT_SUFFIX)
}

fn is_zstd(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "zst")
}

/// Serializes `value` as JSON into `path`, zstd-compressed if the file name
/// ends in `.zst`. The file is written next to its destination and renamed
/// into place, so readers never see a partial file.
#[instrument(skip_all, fields(path = %path.display()), err)]
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<u64, Error> {
    let json = serde_json::to_vec(value)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(Error::io(&tmp_path))?;

    if is_zstd(path) {
        let mut encoder = ZstdEncoder::new(file);
        encoder.write_all(&json).await.map_err(Error::io(&tmp_path))?;
        encoder.shutdown().await.map_err(Error::io(&tmp_path))?;
    } else {
        let mut file = file;
        file.write_all(&json).await.map_err(Error::io(&tmp_path))?;
        file.shutdown().await.map_err(Error::io(&tmp_path))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(Error::io(path))?;

    let size = tokio::fs::metadata(path)
        .await
        .map_err(Error::io(path))?
        .len();
    debug!(uncompressed = json.len(), size, "wrote file");
    Ok(size)
}

/// Counterpart of [write_json].
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(Error::io(path))?;

    let mut json = Vec::new();
    if is_zstd(path) {
        ZstdDecoder::new(BufReader::new(file))
            .read_to_end(&mut json)
            .await
            .map_err(Error::io(path))?;
    } else {
        let mut file = file;
        file.read_to_end(&mut json).await.map_err(Error::io(path))?;
    }

    Ok(serde_json::from_slice(&json)?)
}

/// The raw result of a walk, kept around so the next run can reuse
/// unchanged subtrees. Only valid for walks that prune the tree the same way.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeCache {
    pub stop_threshold: u64,
    pub max_depth: Option<usize>,
    /// Sorted, without trailing slashes.
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    pub tree: Subtree,
}

fn normalized_ignore_paths(walk: &WalkConfig) -> Vec<String> {
    let mut paths: Vec<String> = walk
        .ignore_paths
        .iter()
        .map(|p| p.trim_end_matches('/').to_string())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

impl TreeCache {
    pub fn new(walk: &WalkConfig, tree: Subtree) -> Self {
        Self {
            stop_threshold: walk.stop_threshold,
            max_depth: walk.max_depth,
            ignore_paths: normalized_ignore_paths(walk),
            tree,
        }
    }

    fn matches(&self, walk: &WalkConfig) -> bool {
        self.stop_threshold == walk.stop_threshold
            && self.max_depth == walk.max_depth
            && self.ignore_paths == normalized_ignore_paths(walk)
    }

    /// Loads a previous tree. Returns None if there is none, it can't be
    /// read, or it was produced with different walk parameters.
    pub async fn load(path: &Path, walk: &WalkConfig) -> Option<Subtree> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return None;
        }

        let cache: TreeCache = match read_json(path).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!(err = %e, path = %path.display(), "unable to load previous tree, ignoring");
                return None;
            }
        };

        if !cache.matches(walk) {
            warn!(
                path = %path.display(),
                cached.stop_threshold = cache.stop_threshold,
                cached.max_depth = ?cache.max_depth,
                cached.ignore_paths = ?cache.ignore_paths,
                "previous tree was walked with different parameters, ignoring"
            );
            return None;
        }

        Some(cache.tree)
    }

    pub async fn save(&self, path: &Path) -> Result<u64, Error> {
        write_json(path, self).await
    }
}
