//! The `repos.json` listing the viewer page loads to offer a repository
//! picker. It lives next to the data directory holding the artifacts.
use std::path::{Path, PathBuf};

use cvmfs_catalog::StopReason;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::artifact::{self, Envelope, Error, ARTIFACT_SUFFIX};

pub const INDEX_FILE_NAME: &str = "repos.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub generated_at: String,
    pub incomplete: bool,
    /// Relative to the directory `repos.json` is in.
    pub data_file: String,
    pub size_bytes: u64,
}

fn entry_incomplete(envelope: &Envelope) -> bool {
    if envelope.incomplete {
        return true;
    }
    if let Some(max) = envelope.max_catalogs {
        if max > 0 && envelope.catalogs_downloaded >= max {
            return true;
        }
    }
    envelope
        .tree
        .iter()
        .any(|n| n.stopped == Some(StopReason::TooLarge))
}

/// Describes every artifact in `data_dir`, sorted by file name. Artifacts
/// that can't be read are still listed, without metadata.
#[instrument(fields(data_dir = %data_dir.display()), err)]
pub async fn build_index(data_dir: &Path) -> Result<Vec<IndexEntry>, Error> {
    let io_err = |source| Error::Io {
        path: data_dir.to_path_buf(),
        source,
    };

    let mut file_names = vec![];
    let mut read_dir = tokio::fs::read_dir(data_dir).await.map_err(io_err)?;
    while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(ARTIFACT_SUFFIX) {
            file_names.push(file_name);
        }
    }
    file_names.sort();

    let dir_name = data_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());

    let mut entries = Vec::with_capacity(file_names.len());
    for file_name in file_names {
        let path = data_dir.join(&file_name);
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?
            .len();
        let stem = file_name
            .strip_suffix(ARTIFACT_SUFFIX)
            .unwrap_or(&file_name)
            .to_string();

        let (name, generated_at, incomplete) =
            match artifact::read_json::<Envelope>(&path).await {
                Ok(envelope) => {
                    let incomplete = entry_incomplete(&envelope);
                    (envelope.repo_name, envelope.generated_at, incomplete)
                }
                Err(e) => {
                    warn!(err = %e, path = %path.display(), "unable to read artifact");
                    (stem, String::new(), false)
                }
            };

        entries.push(IndexEntry {
            name,
            generated_at,
            incomplete,
            data_file: format!("{}/{}", dir_name, file_name),
            size_bytes,
        });
    }

    Ok(entries)
}

/// Where the index for `data_dir` goes.
pub fn index_path(data_dir: &Path) -> PathBuf {
    data_dir
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(INDEX_FILE_NAME)
}

/// Regenerates `repos.json` for `data_dir`, returning its path.
pub async fn write_index(data_dir: &Path) -> Result<PathBuf, Error> {
    let entries = build_index(data_dir).await?;
    let path = index_path(data_dir);
    artifact::write_json(&path, &entries).await?;
    info!(path = %path.display(), repositories = entries.len(), "wrote index");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use cvmfs_catalog::fixtures::{DUMMY_HASH_1, DUMMY_HASH_2};
    use cvmfs_catalog::{CatalogNode, CatalogRef, StopReason, Subtree, WalkStats};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::artifact::{artifact_file_name, write_json};
    use crate::{build_viz_tree, AggregateConfig};

    fn envelope(name: &str, incomplete: bool, max_catalogs: Option<usize>, stop: Option<StopReason>) -> Envelope {
        let child = match stop {
            Some(reason) => CatalogNode::stopped(CatalogRef::new(DUMMY_HASH_2.clone(), "/big"), 1, reason),
            None => CatalogNode::leaf(CatalogRef::new(DUMMY_HASH_2.clone(), "/small"), 1),
        };
        let tree = Subtree::Complete(CatalogNode {
            catalog: CatalogRef::root(DUMMY_HASH_1.clone()),
            size: 1,
            children: vec![Subtree::Complete(child)],
            stopped: None,
        });

        Envelope {
            repo_name: name.to_string(),
            repo_url: format!("http://example.com/cvmfs/{}", name),
            generated_at: "2024-03-07 09:05 UTC".to_string(),
            max_catalogs,
            catalogs_downloaded: 2,
            incomplete,
            stats: WalkStats::default(),
            tree: build_viz_tree(&tree, name, &AggregateConfig::default()),
        }
    }

    #[rstest]
    #[case::complete(false, None, None, false)]
    #[case::partial(true, None, None, true)]
    #[case::limit_hit(false, Some(2), None, true)]
    #[case::limit_not_hit(false, Some(3), None, false)]
    #[case::too_large(false, None, Some(StopReason::TooLarge), true)]
    #[case::max_depth(false, None, Some(StopReason::MaxDepth), false)]
    fn incomplete(
        #[case] partial: bool,
        #[case] max_catalogs: Option<usize>,
        #[case] stop: Option<StopReason>,
        #[case] expected: bool,
    ) {
        assert_eq!(
            expected,
            entry_incomplete(&envelope("repo", partial, max_catalogs, stop))
        );
    }

    #[tokio::test]
    async fn index() {
        let site = TempDir::new().unwrap();
        let data_dir = site.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();

        for (name, partial) in [("sft.cern.ch", false), ("atlas.cern.ch", true)] {
            write_json(
                &data_dir.join(artifact_file_name(name)),
                &envelope(name, partial, None, None),
            )
            .await
            .unwrap();
        }
        std::fs::write(data_dir.join("broken.json.zst"), b"nope").unwrap();
        std::fs::write(data_dir.join("notes.txt"), b"ignored").unwrap();

        let path = write_index(&data_dir).await.expect("must succeed");
        assert_eq!(site.path().join("repos.json"), path);

        let entries: Vec<IndexEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.incomplete, e.data_file.as_str()))
            .collect();
        assert_eq!(
            vec![
                ("atlas.cern.ch", true, "data/atlas_cern_ch.json.zst"),
                ("broken", false, "data/broken.json.zst"),
                ("sft.cern.ch", false, "data/sft_cern_ch.json.zst"),
            ],
            summary
        );
        assert_eq!("", entries[1].generated_at);
        assert_eq!("2024-03-07 09:05 UTC", entries[0].generated_at);
        assert!(entries.iter().all(|e| e.size_bytes > 0));
    }

    #[tokio::test]
    async fn missing_dir() {
        let site = TempDir::new().unwrap();
        assert!(matches!(
            build_index(&site.path().join("data")).await,
            Err(Error::Io { .. })
        ));
    }
}
