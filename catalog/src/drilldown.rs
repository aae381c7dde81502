use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::schema::{self, DirectoryEntry};
use crate::{CatalogFetcher, CatalogHash, CatalogRef, Error, SiblingSizing};

/// A node of the directory tree of a single catalog, weighted by the number
/// of entries below it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntryNode {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    /// A nested catalog is mounted here. Its contents live in another
    /// catalog, so this is always a leaf.
    pub is_mountpoint: bool,
    /// 1 for leaves (including empty directories), the sum of the children
    /// otherwise.
    pub value: u64,
    pub share: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DirectoryEntryNode>,
}

/// Fetches a single catalog and builds its directory tree. Nested catalogs
/// are not followed.
///
/// The catalog knows where it's mounted, so `mount_path` is optional. If
/// given, it must agree with the catalog, or [Error::InvalidRequest] is
/// returned.
#[instrument(skip_all, fields(catalog.hash = %hash, catalog.mount_path = ?mount_path), err)]
pub async fn build_directory_tree(
    fetcher: &CatalogFetcher,
    hash: &CatalogHash,
    mount_path: Option<&str>,
    sizing: SiblingSizing,
) -> Result<DirectoryEntryNode, Error> {
    let fetched = fetcher.fetch(&CatalogRef::root(hash.clone())).await?;
    let listing = schema::list_catalog_entries(fetched.raw, mount_path).await?;
    Ok(assemble(&listing.mount_path, listing.entries, sizing))
}

/// Turns the flat list of entries below `root_path` into a tree, and
/// computes values and shares.
pub fn assemble(
    root_path: &str,
    entries: Vec<DirectoryEntry>,
    sizing: SiblingSizing,
) -> DirectoryEntryNode {
    let mut by_parent: HashMap<String, Vec<DirectoryEntry>> = HashMap::new();
    for entry in entries {
        let parent = match entry.path.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => continue,
        };
        by_parent.entry(parent).or_default().push(entry);
    }

    let mut root = DirectoryEntryNode {
        name: root_path
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("/")
            .to_string(),
        path: if root_path.is_empty() {
            "/".to_string()
        } else {
            root_path.to_string()
        },
        is_directory: true,
        is_mountpoint: false,
        value: 0,
        share: 1.0,
        children: attach(root_path, &mut by_parent),
    };

    if !by_parent.is_empty() {
        debug!(orphans = by_parent.len(), "entries without a parent in this catalog");
    }

    compute_values(&mut root);
    assign_shares(&mut root, sizing);
    root
}

fn attach(
    parent_path: &str,
    by_parent: &mut HashMap<String, Vec<DirectoryEntry>>,
) -> Vec<DirectoryEntryNode> {
    let entries = match by_parent.remove(parent_path) {
        Some(entries) => entries,
        None => return vec![],
    };

    entries
        .into_iter()
        .map(|entry| {
            let children = if entry.is_directory && !entry.is_mountpoint {
                attach(&entry.path, by_parent)
            } else {
                vec![]
            };
            DirectoryEntryNode {
                name: entry.name,
                path: entry.path,
                is_directory: entry.is_directory,
                is_mountpoint: entry.is_mountpoint,
                value: 0,
                share: 0.0,
                children,
            }
        })
        .collect()
}

fn compute_values(node: &mut DirectoryEntryNode) -> u64 {
    node.value = if node.children.is_empty() {
        1
    } else {
        node.children.iter_mut().map(compute_values).sum()
    };
    node.value
}

fn assign_shares(node: &mut DirectoryEntryNode, sizing: SiblingSizing) {
    let values: Vec<f64> = node.children.iter().map(|c| c.value as f64).collect();
    let shares = sizing.split(node.share, &values);
    for (child, share) in node.children.iter_mut().zip(shares) {
        child.share = share;
        assign_shares(child, sizing);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::build_directory_tree;
    use crate::catalogstore::MemoryCatalogStore;
    use crate::fixtures::{put_catalog, CatalogBuilder, CATALOG_EMPTY, CATALOG_SMALL, DUMMY_HASH_1};
    use crate::{CatalogFetcher, CatalogHash, Error, ErrorKind, SiblingSizing};

    async fn fetcher_with(raw: &[u8]) -> (CatalogFetcher, CatalogHash) {
        let store = MemoryCatalogStore::default();
        let (hash, _) = put_catalog(&store, raw).await;
        (CatalogFetcher::new(Arc::new(store)), hash)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[tokio::test]
    async fn counts_entries() {
        let (fetcher, hash) = fetcher_with(&CATALOG_SMALL).await;
        let tree = build_directory_tree(&fetcher, &hash, None, SiblingSizing::Proportional)
            .await
            .expect("must succeed");

        assert_eq!("/", tree.path);
        assert_eq!(3, tree.value);
        assert!(close(1.0, tree.share));

        let names: Vec<_> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(vec!["a", "b"], names);

        let (a, b) = (&tree.children[0], &tree.children[1]);
        assert_eq!(1, a.value);
        assert_eq!(2, b.value);
        assert_eq!("/b", b.path);
        assert!(close(1.0 / 3.0, a.share));
        assert!(close(2.0 / 3.0, b.share));
        for leaf in &b.children {
            assert!(close(1.0 / 3.0, leaf.share));
        }
    }

    #[tokio::test]
    async fn equal_angle() {
        let (fetcher, hash) = fetcher_with(&CATALOG_SMALL).await;
        let tree = build_directory_tree(&fetcher, &hash, None, SiblingSizing::EqualAngle)
            .await
            .unwrap();

        assert!(close(0.5, tree.children[0].share));
        assert!(close(0.5, tree.children[1].share));
        assert!(close(0.25, tree.children[1].children[0].share));
        // values are independent of the sizing policy.
        assert_eq!(3, tree.value);
    }

    #[tokio::test]
    async fn empty_catalog() {
        let (fetcher, hash) = fetcher_with(&CATALOG_EMPTY).await;
        let tree = build_directory_tree(&fetcher, &hash, None, SiblingSizing::Proportional)
            .await
            .unwrap();

        assert!(tree.children.is_empty());
        assert_eq!(1, tree.value);
    }

    #[tokio::test]
    async fn mountpoints_and_empty_dirs_are_leaves() {
        let raw = CatalogBuilder::new("/sw")
            .mountpoint("/sw/nested")
            .dir("/sw/empty")
            .dir("/sw/lib")
            .file("/sw/lib/one")
            .file("/sw/lib/two")
            .symlink("/sw/link")
            .build();

        let (fetcher, hash) = fetcher_with(&raw).await;
        let tree = build_directory_tree(&fetcher, &hash, Some("/sw"), SiblingSizing::Proportional)
            .await
            .unwrap();

        assert_eq!("sw", tree.name);
        assert_eq!("/sw", tree.path);
        assert_eq!(5, tree.value);

        let summary: Vec<_> = tree
            .children
            .iter()
            .map(|c| (c.name.as_str(), c.is_mountpoint, c.value))
            .collect();
        assert_eq!(
            vec![
                ("empty", false, 1),
                ("lib", false, 2),
                ("link", false, 1),
                ("nested", true, 1)
            ],
            summary
        );
    }

    #[tokio::test]
    async fn missing_catalog() {
        let fetcher = CatalogFetcher::new(Arc::new(MemoryCatalogStore::default()));
        let err = build_directory_tree(&fetcher, &DUMMY_HASH_1, None, SiblingSizing::Proportional)
            .await
            .expect_err("must fail");
        assert_eq!(ErrorKind::Fetch, err.kind());
    }

    fn deeply_nested() -> Vec<u8> {
        CatalogBuilder::new("/a/b")
            .dir("/a/b/lib")
            .file("/a/b/lib/one")
            .file("/a/b/lib/two")
            .file("/a/b/README")
            .build()
    }

    #[tokio::test]
    async fn nested_catalog_by_hash_alone() {
        let (fetcher, hash) = fetcher_with(&deeply_nested()).await;

        let by_hash = build_directory_tree(&fetcher, &hash, None, SiblingSizing::Proportional)
            .await
            .expect("must succeed");
        assert_eq!("/a/b", by_hash.path);
        assert_eq!("b", by_hash.name);
        assert_eq!(3, by_hash.value);
        assert_eq!(2, by_hash.children.len());

        let with_path =
            build_directory_tree(&fetcher, &hash, Some("/a/b"), SiblingSizing::Proportional)
                .await
                .unwrap();
        assert_eq!(by_hash, with_path);
    }

    #[tokio::test]
    async fn nested_catalog_with_wrong_path() {
        let (fetcher, hash) = fetcher_with(&deeply_nested()).await;
        assert!(matches!(
            build_directory_tree(&fetcher, &hash, Some("/a"), SiblingSizing::Proportional).await,
            Err(Error::InvalidRequest(_))
        ));
    }
}
