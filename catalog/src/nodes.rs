use serde::{Deserialize, Serialize};

use crate::{CatalogHash, ErrorKind};

/// Identifies a catalog inside a repository: its content hash, and the
/// mount path it's attached at. The root catalog has an empty mount path,
/// all others look like `/a/b`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogRef {
    pub hash: CatalogHash,
    pub mount_path: String,
}

impl CatalogRef {
    pub fn new(hash: CatalogHash, mount_path: impl Into<String>) -> Self {
        Self {
            hash,
            mount_path: mount_path.into(),
        }
    }

    pub fn root(hash: CatalogHash) -> Self {
        Self::new(hash, "")
    }

    pub fn is_root(&self) -> bool {
        self.mount_path.is_empty()
    }

    /// Returns the last segment of the mount path, or an empty string for
    /// the root catalog.
    pub fn name(&self) -> &str {
        self.mount_path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is_strict_descendant_of(&self, parent_mount_path: &str) -> bool {
        is_strict_descendant(&self.mount_path, parent_mount_path)
    }
}

/// Checks whether `path` lies strictly below `parent`, comparing whole path
/// segments. `""` is the repository root, which every absolute path is
/// below.
pub fn is_strict_descendant(path: &str, parent: &str) -> bool {
    match path.strip_prefix(parent) {
        Some(rest) => rest.len() > 1 && rest.starts_with('/'),
        None => false,
    }
}

/// Checks whether `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix || is_strict_descendant(path, prefix)
}

/// Why the walker recorded a catalog without descending into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The compressed size exceeds the configured stop threshold.
    TooLarge,
    /// The node sits at the configured maximum depth.
    MaxDepth,
    /// The download limit for this walk was reached.
    MaxCatalogs,
}

/// A catalog in the walked tree. Owns its children exclusively, there are
/// no references back to the parent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogNode {
    pub catalog: CatalogRef,

    /// Compressed size of the catalog blob, in bytes.
    pub size: u64,

    /// One entry per nested catalog, in the order the parent lists them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Subtree>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
}

impl CatalogNode {
    pub fn leaf(catalog: CatalogRef, size: u64) -> Self {
        Self {
            catalog,
            size,
            children: vec![],
            stopped: None,
        }
    }

    pub fn stopped(catalog: CatalogRef, size: u64, reason: StopReason) -> Self {
        Self {
            catalog,
            size,
            children: vec![],
            stopped: Some(reason),
        }
    }
}

/// A nested catalog that couldn't be fetched, decoded or read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MissingCatalog {
    pub catalog: CatalogRef,
    /// The size announced by the parent, 0 if unknown.
    pub size: u64,
    pub kind: ErrorKind,
    pub reason: String,
}

/// A walked (sub)tree. [Subtree::Partial] marks a node where one or more
/// direct nested catalogs are missing. They're not part of `children`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtree {
    Complete(CatalogNode),
    Partial(CatalogNode, Vec<MissingCatalog>),
}

impl Subtree {
    /// Wraps a node, producing [Subtree::Partial] only if something is
    /// missing.
    pub fn new(node: CatalogNode, missing: Vec<MissingCatalog>) -> Self {
        if missing.is_empty() {
            Subtree::Complete(node)
        } else {
            Subtree::Partial(node, missing)
        }
    }

    pub fn node(&self) -> &CatalogNode {
        match self {
            Subtree::Complete(node) | Subtree::Partial(node, _) => node,
        }
    }

    pub fn into_node(self) -> CatalogNode {
        match self {
            Subtree::Complete(node) | Subtree::Partial(node, _) => node,
        }
    }

    /// Catalogs missing directly below this node.
    pub fn direct_missing(&self) -> &[MissingCatalog] {
        match self {
            Subtree::Complete(_) => &[],
            Subtree::Partial(_, missing) => missing,
        }
    }

    /// True if neither this node nor any descendant is partial.
    pub fn is_complete(&self) -> bool {
        match self {
            Subtree::Partial(..) => false,
            Subtree::Complete(node) => node.children.iter().all(Subtree::is_complete),
        }
    }

    /// All missing catalogs in this subtree, in pre-order.
    pub fn missing(&self) -> Vec<&MissingCatalog> {
        self.iter().flat_map(|s| s.direct_missing()).collect()
    }

    /// Iterates over this subtree and all of its descendants, in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &Subtree> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let current = stack.pop()?;
            stack.extend(current.node().children.iter().rev());
            Some(current)
        })
    }

    /// Number of catalogs in this subtree (missing ones excluded).
    pub fn catalog_count(&self) -> usize {
        self.iter().count()
    }

    /// Whether the walker stopped anywhere in this subtree for the given
    /// reason.
    pub fn contains_stop(&self, reason: StopReason) -> bool {
        self.iter().any(|s| s.node().stopped == Some(reason))
    }
}
