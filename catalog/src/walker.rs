use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::nodes::is_within;
use crate::schema::{self, NestedCatalog};
use crate::{
    CatalogFetcher, CatalogHash, CatalogNode, CatalogRef, Error, MissingCatalog, StopReason,
    Subtree,
};

/// Catalogs larger than this (compressed) are recorded, but not descended.
pub const DEFAULT_STOP_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Limits and knobs for a single walk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalkConfig {
    pub stop_threshold: u64,
    /// Nodes at this depth (the root being at 0) are not descended.
    pub max_depth: Option<usize>,
    /// Maximum number of catalogs to download, including the root.
    pub max_catalogs: Option<usize>,
    /// Mount path prefixes to skip entirely.
    pub ignore_paths: Vec<String>,
    /// Upper bound for concurrent catalog downloads within the walk.
    pub max_concurrent_fetches: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            stop_threshold: DEFAULT_STOP_THRESHOLD,
            max_depth: None,
            max_catalogs: None,
            ignore_paths: vec![],
            max_concurrent_fetches: 10,
        }
    }
}

impl WalkConfig {
    fn is_ignored(&self, mount_path: &str) -> bool {
        self.ignore_paths
            .iter()
            .any(|prefix| is_within(mount_path, prefix.trim_end_matches('/')))
    }
}

/// Counters collected during a walk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkStats {
    pub catalogs_found: usize,
    pub catalogs_downloaded: usize,
    pub bytes_downloaded: u64,
    pub large_catalogs: usize,
    pub bytes_skipped: u64,
    pub ignored: usize,
    pub head_requests: usize,
    pub reused: usize,
    pub missing: usize,
}

/// The result of a successful walk.
#[derive(Clone, Debug, PartialEq)]
pub struct Walk {
    pub root: Subtree,
    pub stats: WalkStats,
}

/// Whether a subtree of a previous walk can stand in for a fresh walk of the
/// same catalog. Partial subtrees might have recovered, and subtrees cut
/// off by the download limit are worth completing.
fn reusable(previous: &Subtree) -> bool {
    previous.is_complete() && !previous.contains_stop(StopReason::MaxCatalogs)
}

enum ChildOutcome {
    Node(Subtree),
    Missing(MissingCatalog),
    Ignored,
}

/// Bookkeeping shared by all branches of a single walk.
struct WalkState<'p> {
    seen: Mutex<HashSet<String>>,
    stats: Mutex<WalkStats>,
    downloads: AtomicUsize,
    fetch_permits: Semaphore,
    previous: HashMap<&'p str, &'p Subtree>,
    progress: Span,
}

impl<'p> WalkState<'p> {
    /// Claims a slot from the download limit. Returns false if exhausted.
    fn reserve_download(&self, max_catalogs: Option<usize>) -> bool {
        match max_catalogs {
            None => {
                self.downloads.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(max) => self
                .downloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    /// Records a mount path, failing if it was seen before in this walk.
    fn register(&self, mount_path: &str) -> Result<(), Error> {
        let inserted = self.seen.lock().insert(mount_path.to_string());
        if !inserted {
            return Err(Error::InvariantViolation(format!(
                "mount path {} appears more than once",
                mount_path
            )));
        }
        Ok(())
    }

    fn record_download(&self, compressed_size: u64) {
        {
            let mut stats = self.stats.lock();
            stats.catalogs_downloaded += 1;
            stats.bytes_downloaded += compressed_size;
        }
        self.progress.pb_inc(1);
    }
}

/// Walks the graph of nested catalogs of a repository, starting at its root
/// catalog, and produces the tree of [CatalogNode].
///
/// Edges are followed depth-first. Nested catalogs of the same parent are
/// processed concurrently, and end up in the order the parent lists them.
pub struct CatalogWalker {
    fetcher: Arc<CatalogFetcher>,
    config: WalkConfig,
    previous: Option<Subtree>,
}

impl CatalogWalker {
    pub fn new(fetcher: Arc<CatalogFetcher>, config: WalkConfig) -> Self {
        Self {
            fetcher,
            config,
            previous: None,
        }
    }

    /// Provides the tree of an earlier walk of the same repository. Nested
    /// catalogs with an unchanged mount path and hash are taken from there
    /// instead of being downloaded again.
    pub fn with_previous(mut self, previous: Option<Subtree>) -> Self {
        self.previous = previous;
        self
    }

    #[instrument(skip_all, fields(catalog.hash = %root.hash, indicatif.pb_show = 1), err)]
    pub async fn walk(&self, root: CatalogRef) -> Result<Walk, Error> {
        let span = Span::current();
        span.pb_set_style(&cvmfs_tracing::PB_WALK_STYLE);
        span.pb_set_message("Downloaded");

        if let Some(previous) = &self.previous {
            if previous.node().catalog.hash == root.hash && reusable(previous) {
                let reused = previous.catalog_count();
                info!(reused, "root catalog unchanged, reusing previous tree");
                return Ok(Walk {
                    root: previous.clone(),
                    stats: WalkStats {
                        catalogs_found: reused,
                        reused,
                        ..Default::default()
                    },
                });
            }
        }

        let state = WalkState {
            seen: Mutex::new(HashSet::new()),
            stats: Mutex::new(WalkStats::default()),
            downloads: AtomicUsize::new(0),
            fetch_permits: Semaphore::new(
                self.config
                    .max_concurrent_fetches
                    .clamp(1, Semaphore::MAX_PERMITS),
            ),
            previous: self
                .previous
                .iter()
                .flat_map(Subtree::iter)
                .map(|s| (s.node().catalog.mount_path.as_str(), s))
                .collect(),
            progress: span.clone(),
        };

        state.register(&root.mount_path)?;
        state.reserve_download(None);
        state.stats.lock().catalogs_found += 1;

        // Failing to read the root fails the whole walk.
        let fetched = self.fetcher.fetch(&root).await?;
        state.record_download(fetched.compressed_size);

        let mut node = CatalogNode::leaf(root.clone(), fetched.compressed_size);
        let mut missing = vec![];

        if node.size > self.config.stop_threshold {
            warn!(size = node.size, "root catalog exceeds the stop threshold");
            state.stats.lock().large_catalogs += 1;
            node.stopped = Some(StopReason::TooLarge);
        } else if self.config.max_depth == Some(0) {
            node.stopped = Some(StopReason::MaxDepth);
        } else {
            let nested = schema::list_nested_catalogs(fetched.raw).await?;
            let (children, root_missing) = self
                .walk_children(&state, root.clone(), vec![root.hash.clone()], nested, 1)
                .await?;
            node.children = children;
            missing = root_missing;
        }

        let stats = state.stats.lock().clone();
        info!(
            catalogs_found = stats.catalogs_found,
            catalogs_downloaded = stats.catalogs_downloaded,
            bytes_downloaded = stats.bytes_downloaded,
            missing = stats.missing,
            "walk finished"
        );

        Ok(Walk {
            root: Subtree::new(node, missing),
            stats,
        })
    }

    /// Processes all nested catalogs of `parent`, which sit at `depth`.
    /// Boxed, as it's (indirectly) recursive.
    fn walk_children<'a>(
        &'a self,
        state: &'a WalkState<'a>,
        parent: CatalogRef,
        ancestors: Vec<CatalogHash>,
        nested: Vec<NestedCatalog>,
        depth: usize,
    ) -> BoxFuture<'a, Result<(Vec<Subtree>, Vec<MissingCatalog>), Error>> {
        async move {
            let outcomes = try_join_all(
                nested
                    .into_iter()
                    .map(|n| self.walk_child(state, &parent, &ancestors, n, depth)),
            )
            .await?;

            let mut children = Vec::new();
            let mut missing = Vec::new();
            for outcome in outcomes {
                match outcome {
                    ChildOutcome::Node(subtree) => children.push(subtree),
                    ChildOutcome::Missing(m) => missing.push(m),
                    ChildOutcome::Ignored => {}
                }
            }

            Ok((children, missing))
        }
        .boxed()
    }

    #[instrument(level = "debug", skip_all, fields(catalog.mount_path = %nested.mount_path, depth = depth), err)]
    async fn walk_child(
        &self,
        state: &WalkState<'_>,
        parent: &CatalogRef,
        ancestors: &[CatalogHash],
        nested: NestedCatalog,
        depth: usize,
    ) -> Result<ChildOutcome, Error> {
        let catalog = CatalogRef::new(nested.hash, nested.mount_path);

        if self.config.is_ignored(&catalog.mount_path) {
            debug!("ignored");
            state.stats.lock().ignored += 1;
            return Ok(ChildOutcome::Ignored);
        }

        if !catalog.is_strict_descendant_of(&parent.mount_path) {
            return Err(Error::InvariantViolation(format!(
                "nested catalog {} is not below its parent {:?}",
                catalog.mount_path, parent.mount_path
            )));
        }

        if ancestors.contains(&catalog.hash) {
            return Err(Error::InvariantViolation(format!(
                "catalog {} at {} is its own ancestor",
                catalog.hash, catalog.mount_path
            )));
        }

        state.register(&catalog.mount_path)?;

        if let Some(previous) = state.previous.get(catalog.mount_path.as_str()) {
            if previous.node().catalog.hash == catalog.hash && reusable(previous) {
                for descendant in previous.iter().skip(1) {
                    state.register(&descendant.node().catalog.mount_path)?;
                }

                let reused = previous.catalog_count();
                debug!(reused, "unchanged, reusing previous subtree");
                {
                    let mut stats = state.stats.lock();
                    stats.reused += reused;
                    stats.catalogs_found += reused;
                }
                state.progress.pb_inc(reused as u64);
                return Ok(ChildOutcome::Node((*previous).clone()));
            }
        }

        state.stats.lock().catalogs_found += 1;

        let mut size = nested.size;
        if size == 0 {
            state.stats.lock().head_requests += 1;
            match self.fetcher.size_of(&catalog.hash).await {
                Ok(Some(s)) => size = s,
                // still unknown, determined by downloading below
                Ok(None) => {}
                Err(e) => return Ok(self.missing(state, catalog, size, e)),
            }
        }

        if size > self.config.stop_threshold {
            debug!(size, "exceeds the stop threshold");
            {
                let mut stats = state.stats.lock();
                stats.large_catalogs += 1;
                stats.bytes_skipped += size;
            }
            return Ok(ChildOutcome::Node(Subtree::Complete(CatalogNode::stopped(
                catalog,
                size,
                StopReason::TooLarge,
            ))));
        }

        if self.config.max_depth.is_some_and(|max| depth >= max) {
            return Ok(ChildOutcome::Node(Subtree::Complete(CatalogNode::stopped(
                catalog,
                size,
                StopReason::MaxDepth,
            ))));
        }

        if !state.reserve_download(self.config.max_catalogs) {
            return Ok(ChildOutcome::Node(Subtree::Complete(CatalogNode::stopped(
                catalog,
                size,
                StopReason::MaxCatalogs,
            ))));
        }

        // The permit only covers fetching and reading this catalog, never
        // waiting for its children, which need permits themselves.
        let read = {
            let _permit = state
                .fetch_permits
                .acquire()
                .await
                .map_err(|_| Error::Fetch("walk was cancelled".to_string()))?;

            match self.fetcher.fetch(&catalog).await {
                Ok(fetched) => schema::list_nested_catalogs(fetched.raw)
                    .await
                    .map(|nested| (fetched.compressed_size, nested)),
                Err(e) => Err(e),
            }
        };

        let (compressed_size, grandchildren) = match read {
            Ok(read) => read,
            Err(e) if e.is_catalog_local() => return Ok(self.missing(state, catalog, size, e)),
            Err(e) => return Err(e),
        };

        state.record_download(compressed_size);

        if size == 0 {
            size = compressed_size;
            if size > self.config.stop_threshold {
                state.stats.lock().large_catalogs += 1;
                return Ok(ChildOutcome::Node(Subtree::Complete(CatalogNode::stopped(
                    catalog,
                    size,
                    StopReason::TooLarge,
                ))));
            }
        }

        let mut ancestors = ancestors.to_vec();
        ancestors.push(catalog.hash.clone());

        let (children, missing) = self
            .walk_children(state, catalog.clone(), ancestors, grandchildren, depth + 1)
            .await?;

        Ok(ChildOutcome::Node(Subtree::new(
            CatalogNode {
                catalog,
                size,
                children,
                stopped: None,
            },
            missing,
        )))
    }

    fn missing(
        &self,
        state: &WalkState<'_>,
        catalog: CatalogRef,
        size: u64,
        err: Error,
    ) -> ChildOutcome {
        warn!(catalog.mount_path = %catalog.mount_path, err = %err, "nested catalog unavailable");
        state.stats.lock().missing += 1;
        ChildOutcome::Missing(MissingCatalog {
            catalog,
            size,
            kind: err.kind(),
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{CatalogWalker, WalkConfig};
    use crate::catalogstore::MemoryCatalogStore;
    use crate::fixtures::{
        compress, put_catalog, CatalogBuilder, RepositoryBuilder, RepositoryFixture,
        DUMMY_HASH_1, DUMMY_HASH_2,
    };
    use crate::{
        CatalogFetcher, CatalogNode, CatalogRef, Error, ErrorKind, StopReason, Subtree,
    };

    fn walker(fixture: &RepositoryFixture, config: WalkConfig) -> CatalogWalker {
        CatalogWalker::new(
            Arc::new(CatalogFetcher::new(Arc::new(fixture.store.clone()))),
            config,
        )
    }

    fn paths(subtree: &Subtree) -> Vec<String> {
        subtree
            .iter()
            .map(|s| s.node().catalog.mount_path.clone())
            .collect()
    }

    #[tokio::test]
    async fn no_nested_catalogs() {
        let fixture = RepositoryBuilder::new("empty").build().await;
        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .expect("must succeed");

        assert_eq!(
            Subtree::Complete(CatalogNode::leaf(
                CatalogRef::root(fixture.root.clone()),
                fixture.size("")
            )),
            walk.root
        );
        assert_eq!(1, walk.stats.catalogs_downloaded);
        assert_eq!(fixture.size(""), walk.stats.bytes_downloaded);
    }

    #[tokio::test]
    async fn nested_in_schema_order() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/b")
            .catalog("/a")
            .catalog("/a/x")
            .catalog("/a/y")
            .build()
            .await;

        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .expect("must succeed");

        assert!(walk.root.is_complete());
        assert_eq!(vec!["", "/b", "/a", "/a/x", "/a/y"], paths(&walk.root));
        assert_eq!(5, walk.stats.catalogs_downloaded);
        assert_eq!(5, walk.stats.catalogs_found);

        let a = &walk.root.node().children[1];
        assert_eq!(fixture.hash("/a"), &a.node().catalog.hash);
        assert_eq!(fixture.size("/a"), a.node().size);
    }

    #[tokio::test]
    async fn failing_child_marks_parent_partial() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/x")
            .corrupt_catalog("/y")
            .build()
            .await;

        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .expect("must succeed");

        match &walk.root {
            Subtree::Partial(node, missing) => {
                assert_eq!(vec!["", "/x"], paths(&walk.root));
                assert_eq!(1, node.children.len());
                assert_eq!(1, missing.len());
                assert_eq!("/y", missing[0].catalog.mount_path);
                assert_eq!(ErrorKind::Decode, missing[0].kind);
                assert_eq!(fixture.size("/y"), missing[0].size);
            }
            Subtree::Complete(_) => panic!("expected a partial tree"),
        }
        assert_eq!(1, walk.stats.missing);
    }

    #[tokio::test]
    async fn missing_grandchild() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/x")
            .missing_catalog("/x/gone")
            .build()
            .await;

        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .expect("must succeed");

        // the root itself is complete, its child isn't.
        assert!(matches!(walk.root, Subtree::Complete(_)));
        assert!(!walk.root.is_complete());
        let missing = walk.root.missing();
        assert_eq!(1, missing.len());
        assert_eq!(ErrorKind::Fetch, missing[0].kind);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::unbounded(usize::MAX)]
    #[tokio::test]
    async fn fetch_concurrency_out_of_range(#[case] max_concurrent_fetches: usize) {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/b")
            .build()
            .await;

        let walk = walker(
            &fixture,
            WalkConfig {
                max_concurrent_fetches,
                ..Default::default()
            },
        )
        .walk(CatalogRef::root(fixture.root.clone()))
        .await
        .expect("must succeed");

        assert_eq!(3, walk.stats.catalogs_downloaded);
    }

    #[tokio::test]
    async fn root_failure_is_fatal() {
        let fixture = RepositoryBuilder::new("repo").build().await;
        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(DUMMY_HASH_1.clone()))
            .await;
        assert!(matches!(walk, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_mount_path() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/a/x")
            .duplicate_in_root("/a/x")
            .build()
            .await;

        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await;
        assert!(matches!(walk, Err(Error::InvariantViolation(_))), "{:?}", walk);
    }

    #[tokio::test]
    async fn child_outside_parent() {
        let store = MemoryCatalogStore::default();
        let (a_hash, a_size) = put_catalog(
            &store,
            &CatalogBuilder::new("/a")
                .nested("/b", &DUMMY_HASH_2, 10)
                .build(),
        )
        .await;
        let (root_hash, _) = put_catalog(
            &store,
            &CatalogBuilder::new("").nested("/a", &a_hash, a_size).build(),
        )
        .await;

        let walker = CatalogWalker::new(
            Arc::new(CatalogFetcher::new(Arc::new(store))),
            WalkConfig::default(),
        );
        assert!(matches!(
            walker.walk(CatalogRef::root(root_hash)).await,
            Err(Error::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn cycle() {
        // Content addressing makes real cycles impossible, so store a catalog
        // referencing itself under an arbitrary hash, and skip verification.
        let store = MemoryCatalogStore::default();
        store.put(
            DUMMY_HASH_1.clone(),
            compress(
                &CatalogBuilder::new("")
                    .nested("/loop", &DUMMY_HASH_1, 10)
                    .build(),
            )
            .await,
        );

        let walker = CatalogWalker::new(
            Arc::new(CatalogFetcher::new(Arc::new(store)).with_verification(false)),
            WalkConfig::default(),
        );
        assert!(matches!(
            walker.walk(CatalogRef::root(DUMMY_HASH_1.clone())).await,
            Err(Error::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn stop_threshold() {
        let fixture = RepositoryBuilder::new("repo").catalog("/a").build().await;

        // The root is subject to the threshold as well.
        let walk = walker(
            &fixture,
            WalkConfig {
                stop_threshold: 0,
                ..Default::default()
            },
        )
        .walk(CatalogRef::root(fixture.root.clone()))
        .await
        .unwrap();
        assert_eq!(Some(StopReason::TooLarge), walk.root.node().stopped);
        assert!(walk.root.node().children.is_empty());
        assert_eq!(1, walk.stats.large_catalogs);

        // Only the nested catalog exceeds it.
        let walk = walker(
            &fixture,
            WalkConfig {
                stop_threshold: fixture.size(""),
                ..Default::default()
            },
        )
        .walk(CatalogRef::root(fixture.root.clone()))
        .await
        .unwrap();
        let a = walk.root.node().children[0].node();
        if fixture.size("/a") > fixture.size("") {
            assert_eq!(Some(StopReason::TooLarge), a.stopped);
            assert_eq!(1, walk.stats.catalogs_downloaded);
            assert_eq!(fixture.size("/a"), walk.stats.bytes_skipped);
        } else {
            assert_eq!(None, a.stopped);
        }
    }

    #[tokio::test]
    async fn max_depth() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/a/x")
            .catalog("/b")
            .build()
            .await;

        let walk = walker(
            &fixture,
            WalkConfig {
                max_depth: Some(1),
                ..Default::default()
            },
        )
        .walk(CatalogRef::root(fixture.root.clone()))
        .await
        .unwrap();

        assert_eq!(vec!["", "/a", "/b"], paths(&walk.root));
        for child in &walk.root.node().children {
            assert_eq!(Some(StopReason::MaxDepth), child.node().stopped);
        }
        assert_eq!(1, walk.stats.catalogs_downloaded);
    }

    #[tokio::test]
    async fn max_catalogs() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/b")
            .catalog("/c")
            .build()
            .await;

        let walk = walker(
            &fixture,
            WalkConfig {
                max_catalogs: Some(2),
                ..Default::default()
            },
        )
        .walk(CatalogRef::root(fixture.root.clone()))
        .await
        .unwrap();

        assert_eq!(2, walk.stats.catalogs_downloaded);
        assert_eq!(4, walk.stats.catalogs_found);
        let limited = walk
            .root
            .node()
            .children
            .iter()
            .filter(|c| c.node().stopped == Some(StopReason::MaxCatalogs))
            .count();
        assert_eq!(2, limited);
    }

    #[tokio::test]
    async fn ignore_paths() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/b")
            .catalog("/b/x")
            .catalog("/bc")
            .build()
            .await;

        let walk = walker(
            &fixture,
            WalkConfig {
                ignore_paths: vec!["/b/".into()],
                ..Default::default()
            },
        )
        .walk(CatalogRef::root(fixture.root.clone()))
        .await
        .unwrap();

        assert_eq!(vec!["", "/a", "/bc"], paths(&walk.root));
        assert_eq!(1, walk.stats.ignored);
    }

    #[tokio::test]
    async fn unknown_sizes_are_looked_up() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/b")
            .unknown_sizes()
            .build()
            .await;

        let walk = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();

        assert_eq!(2, walk.stats.head_requests);
        for child in &walk.root.node().children {
            let node = child.node();
            assert_eq!(fixture.size(&node.catalog.mount_path), node.size);
        }
    }

    #[tokio::test]
    async fn reuse_whole_previous_tree() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/a/x")
            .build()
            .await;

        let first = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();
        let reads = fixture.store.reads();

        let second = walker(&fixture, WalkConfig::default())
            .with_previous(Some(first.root.clone()))
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();

        assert_eq!(first.root, second.root);
        assert_eq!(3, second.stats.reused);
        assert_eq!(0, second.stats.catalogs_downloaded);
        assert_eq!(reads, fixture.store.reads());
    }

    #[tokio::test]
    async fn graft_unchanged_subtree() {
        let fixture = RepositoryBuilder::new("repo")
            .catalog("/a")
            .catalog("/a/x")
            .catalog("/b")
            .build()
            .await;

        let full = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();

        // Pretend the previous run saw a different root, with the same /a.
        let a_subtree = full.root.node().children[0].clone();
        let previous = Subtree::Complete(CatalogNode {
            catalog: CatalogRef::root(DUMMY_HASH_1.clone()),
            size: 1,
            children: vec![a_subtree],
            stopped: None,
        });

        let walk = walker(&fixture, WalkConfig::default())
            .with_previous(Some(previous))
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();

        assert_eq!(full.root, walk.root);
        assert_eq!(2, walk.stats.reused);
        // root and /b
        assert_eq!(2, walk.stats.catalogs_downloaded);
        assert_eq!(4, walk.stats.catalogs_found);
    }

    #[tokio::test]
    async fn partial_previous_tree_is_not_reused() {
        let fixture = RepositoryBuilder::new("repo").catalog("/a").build().await;

        let full = walker(&fixture, WalkConfig::default())
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();

        let previous = Subtree::Partial(full.root.node().clone(), vec![]);
        let walk = walker(&fixture, WalkConfig::default())
            .with_previous(Some(previous))
            .walk(CatalogRef::root(fixture.root.clone()))
            .await
            .unwrap();

        // the root is walked again, its unchanged child is still grafted.
        assert_eq!(full.root, walk.root);
        assert_eq!(1, walk.stats.catalogs_downloaded);
        assert_eq!(1, walk.stats.reused);
    }
}
