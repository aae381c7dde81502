use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cvmfs_catalog::catalogstore::{from_location, CatalogStore, DiskCacheCatalogStore};
use cvmfs_catalog::{CatalogFetcher, CatalogRef, CatalogWalker, Error, ErrorKind, WalkConfig, WalkStats};
use futures::{StreamExt, TryFutureExt};
use parking_lot::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, instrument, warn, Instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::artifact::{self, artifact_file_name, format_generated_at, safe_name, Envelope, TreeCache};
use crate::{build_viz_tree, index, AggregateConfig, RepositoryConfig};

/// Opens the store for a repository. The default resolves the location with
/// [from_location].
pub type StoreOpener =
    Arc<dyn Fn(&RepositoryConfig) -> Result<Arc<dyn CatalogStore>, Error> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Where artifacts are written. `repos.json` goes into its parent.
    pub out_dir: PathBuf,
    /// Number of repositories processed at the same time.
    pub concurrency: usize,
    /// Time budget for a single attempt at a repository.
    pub timeout: Option<Duration>,
    /// How often to retry a repository after a fetch error or timeout.
    pub retries: usize,
    pub walk: WalkConfig,
    pub aggregate: AggregateConfig,
    /// Keep downloaded catalogs here, shared by all repositories.
    pub cache_dir: Option<PathBuf>,
    /// Keep walked trees here, to reuse unchanged parts on the next run.
    pub tree_cache_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("data"),
            concurrency: 4,
            timeout: None,
            retries: 0,
            walk: WalkConfig::default(),
            aggregate: AggregateConfig::default(),
            cache_dir: None,
            tree_cache_dir: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Catalog(#[from] Error),

    #[error("unable to write output: {0}")]
    Output(#[from] artifact::Error),

    #[error("artifact {file_name} is already written for {other}")]
    NameCollision { file_name: String, other: String },
}

impl RunError {
    fn is_transient(&self) -> bool {
        matches!(self, RunError::Catalog(e) if matches!(e.kind(), ErrorKind::Fetch | ErrorKind::Timeout))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Catalog(ErrorKind),
    Output,
    /// Another repository of the batch maps to the same artifact file.
    NameCollision,
    /// The task processing the repository panicked.
    Panic,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Catalog(kind) => write!(f, "{}", kind),
            FailureKind::Output => f.write_str("output"),
            FailureKind::NameCollision => f.write_str("name_collision"),
            FailureKind::Panic => f.write_str("panic"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<RunError> for RepositoryFailure {
    fn from(e: RunError) -> Self {
        let kind = match &e {
            RunError::Catalog(e) => FailureKind::Catalog(e.kind()),
            RunError::Output(_) => FailureKind::Output,
            RunError::NameCollision { .. } => FailureKind::NameCollision,
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

/// What was produced for a repository.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactSummary {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub incomplete: bool,
    pub stats: WalkStats,
    /// Catalogs served from the local catalog cache.
    pub cache_hits: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryOutcome {
    pub name: String,
    pub result: Result<ArtifactSummary, RepositoryFailure>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
}

impl BatchStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            BatchStatus::AllSucceeded => 0,
            BatchStatus::PartialSuccess => 2,
            BatchStatus::AllFailed => 1,
        }
    }
}

/// The result of [Pipeline::run], one outcome per repository, in the
/// order they were passed in.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub outcomes: Vec<RepositoryOutcome>,
    /// The regenerated `repos.json`, if that worked out.
    pub index: Option<PathBuf>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn status(&self) -> BatchStatus {
        match (self.succeeded(), self.failed()) {
            (_, 0) => BatchStatus::AllSucceeded,
            (0, _) => BatchStatus::AllFailed,
            _ => BatchStatus::PartialSuccess,
        }
    }
}

/// Artifact file names handed out during a run, so two repositories never
/// write the same file. Maps the file name to the position and URL of the
/// repository that owns it.
#[derive(Default)]
struct ArtifactClaims(Mutex<HashMap<String, (usize, String)>>);

impl ArtifactClaims {
    fn claim(&self, file_name: &str, idx: usize, repo: &RepositoryConfig) -> Result<(), RunError> {
        let mut claims = self.0.lock();
        match claims.get(file_name) {
            Some((owner, other)) if *owner != idx => Err(RunError::NameCollision {
                file_name: file_name.to_string(),
                other: other.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                claims.insert(file_name.to_string(), (idx, repo.url.clone()));
                Ok(())
            }
        }
    }
}

/// Produces one artifact per repository. Repositories are independent of
/// each other: each is processed in its own task, with its own store,
/// fetcher and walker, and a failing repository doesn't affect the others.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    open_store: StoreOpener,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            open_store: Arc::new(|repo: &RepositoryConfig| from_location(&repo.url)),
        }
    }

    pub fn with_store_opener(mut self, open_store: StoreOpener) -> Self {
        self.open_store = open_store;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[instrument(skip_all, fields(repositories = repositories.len(), indicatif.pb_show = 1))]
    pub async fn run(&self, repositories: &[RepositoryConfig]) -> BatchReport {
        let span = Span::current();
        span.pb_set_style(&cvmfs_tracing::PB_BATCH_STYLE);
        span.pb_set_message("Processing repositories");
        span.pb_set_length(repositories.len() as u64);

        // Configured names are known upfront, earlier repositories win.
        let claims = Arc::new(ArtifactClaims::default());
        let mut early: Vec<(usize, RepositoryOutcome)> = vec![];
        let mut pending = vec![];
        for (idx, repo) in repositories.iter().enumerate() {
            let claimed = match &repo.name {
                Some(name) => claims.claim(&artifact_file_name(name), idx, repo),
                None => Ok(()),
            };
            match claimed {
                Ok(()) => pending.push((idx, repo.clone())),
                Err(e) => {
                    warn!(err = %e, repo.url = %repo.url, "repository skipped");
                    early.push((idx, failed(repo, e.into())));
                    span.pb_inc(1);
                }
            }
        }

        let mut outcomes: Vec<(usize, RepositoryOutcome)> = futures::stream::iter(pending)
            .map(|(idx, repo)| {
                let pipeline = self.clone();
                let claims = claims.clone();
                let handle = tokio::spawn(
                    async move { pipeline.process(idx, &repo, &claims).await }.in_current_span(),
                );
                (idx, repositories[idx].clone(), handle)
            })
            .map(|(idx, repo, handle)| async move {
                let outcome = handle.await.unwrap_or_else(|e| {
                    warn!(err = %e, repo.url = %repo.url, "repository task failed");
                    failed(
                        &repo,
                        RepositoryFailure {
                            kind: FailureKind::Panic,
                            message: format!("repository task failed: {}", e),
                        },
                    )
                });
                (idx, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .inspect(|_| span.pb_inc(1))
            .collect()
            .await;

        outcomes.extend(early);
        outcomes.sort_by_key(|(idx, _)| *idx);

        let index = match index::write_index(&self.config.out_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(err = %e, "unable to write index");
                None
            }
        };

        BatchReport {
            outcomes: outcomes.into_iter().map(|(_, o)| o).collect(),
            index,
        }
    }

    #[instrument(skip_all, fields(repo.url = %repo.url))]
    async fn process(
        &self,
        idx: usize,
        repo: &RepositoryConfig,
        claims: &ArtifactClaims,
    ) -> RepositoryOutcome {
        let strategy = ExponentialBackoff::from_millis(20)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.retries);

        let result = RetryIf::spawn(
            strategy,
            || self.attempt(idx, repo, claims),
            |e: &RunError| {
                let retry = e.is_transient();
                if retry {
                    warn!(err = %e, "retrying");
                }
                retry
            },
        )
        .await;

        match result {
            Ok(summary) => RepositoryOutcome {
                name: summary.name.clone(),
                result: Ok(summary),
            },
            Err(e) => {
                warn!(err = %e, "repository failed");
                failed(repo, e.into())
            }
        }
    }

    async fn attempt(
        &self,
        idx: usize,
        repo: &RepositoryConfig,
        claims: &ArtifactClaims,
    ) -> Result<ArtifactSummary, RunError> {
        match self.config.timeout {
            Some(budget) => tokio::time::timeout(budget, self.generate(idx, repo, claims))
                .unwrap_or_else(|_| Err(Error::Timeout(budget).into()))
                .await,
            None => self.generate(idx, repo, claims).await,
        }
    }

    #[instrument(skip_all, err)]
    async fn generate(
        &self,
        idx: usize,
        repo: &RepositoryConfig,
        claims: &ArtifactClaims,
    ) -> Result<ArtifactSummary, RunError> {
        let store = (self.open_store)(repo)?;
        let (store, disk_cache) = match &self.config.cache_dir {
            Some(cache_dir) => {
                let cached = Arc::new(DiskCacheCatalogStore::new(store, cache_dir.clone()));
                (cached.clone() as Arc<dyn CatalogStore>, Some(cached))
            }
            None => (store, None),
        };

        let fetcher = Arc::new(CatalogFetcher::new(store));
        let manifest = fetcher.manifest().await?;
        let name = repo
            .name
            .clone()
            .or_else(|| manifest.name.clone())
            .unwrap_or_else(|| repo.fallback_name());
        info!(repo.name = %name, catalog.hash = %manifest.root_hash, "resolved root catalog");

        let file_name = artifact_file_name(&name);
        claims.claim(&file_name, idx, repo)?;

        let tree_cache_path = self
            .config
            .tree_cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.tree.json.zst", safe_name(&name))));

        let previous = match &tree_cache_path {
            Some(path) => TreeCache::load(path, &self.config.walk).await,
            None => None,
        };

        let walk = CatalogWalker::new(fetcher, self.config.walk.clone())
            .with_previous(previous)
            .walk(CatalogRef::root(manifest.root_hash))
            .await?;

        let incomplete = !walk.root.is_complete();
        let envelope = Envelope {
            repo_name: name.clone(),
            repo_url: repo.url.clone(),
            generated_at: format_generated_at(Utc::now()),
            max_catalogs: self.config.walk.max_catalogs,
            catalogs_downloaded: walk.stats.catalogs_downloaded,
            incomplete,
            stats: walk.stats.clone(),
            tree: build_viz_tree(&walk.root, &name, &self.config.aggregate),
        };

        create_dir_all(&self.config.out_dir).await?;
        let path = self.config.out_dir.join(file_name);
        let size_bytes = artifact::write_json(&path, &envelope).await?;

        if let Some(tree_cache_path) = tree_cache_path {
            let cache = TreeCache::new(&self.config.walk, walk.root);
            if let Err(e) = save_tree(&tree_cache_path, &cache).await {
                warn!(err = %e, path = %tree_cache_path.display(), "unable to save tree for the next run");
            }
        }

        let cache_hits = disk_cache.map(|c| c.hits()).unwrap_or_default();
        info!(
            path = %path.display(),
            size_bytes,
            incomplete,
            cache_hits,
            "wrote artifact"
        );

        Ok(ArtifactSummary {
            name,
            path,
            size_bytes,
            incomplete,
            stats: walk.stats,
            cache_hits,
        })
    }
}

fn failed(repo: &RepositoryConfig, failure: RepositoryFailure) -> RepositoryOutcome {
    RepositoryOutcome {
        name: repo.fallback_name(),
        result: Err(failure),
    }
}

async fn save_tree(path: &Path, cache: &TreeCache) -> Result<(), artifact::Error> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await?;
    }
    cache.save(path).await?;
    Ok(())
}

async fn create_dir_all(path: &Path) -> Result<(), artifact::Error> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| artifact::Error::Io {
            path: path.to_path_buf(),
            source,
        })
}
