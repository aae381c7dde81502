//! Turns a walked catalog tree into the hierarchy the sunburst chart reads.
use cvmfs_catalog::{ErrorKind, SiblingSizing, StopReason, Subtree};
use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1_048_576.0;

fn mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

fn is_false(b: &bool) -> bool {
    !b
}

/// A nested catalog that couldn't be read, as shown in the info panel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MissingViz {
    pub path: String,
    pub hash: String,
    pub size_mb: f64,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VizNode {
    pub label: String,
    pub path: String,
    /// Empty for virtual nodes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Weight in MB, used as input for the angular share.
    pub value: f64,
    /// The node's own size in MB, for the colour scale.
    pub color_metric: f64,
    /// Fraction of the full circle, 1.0 at the root.
    pub share: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    /// An intermediate path segment without a catalog of its own.
    #[serde(default, skip_serializing_if = "is_false")]
    pub virtual_dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MissingViz>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<VizNode>,
}

impl VizNode {
    fn virtual_dir(label: &str, path: String) -> Self {
        VizNode {
            label: label.to_string(),
            path,
            hash: String::new(),
            value: 0.0,
            color_metric: 0.0,
            share: 0.0,
            stopped: None,
            virtual_dir: true,
            missing: vec![],
            incomplete: false,
            children: vec![],
        }
    }

    /// Iterates over this node and all its descendants, in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &VizNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let current = stack.pop()?;
            stack.extend(current.children.iter().rev());
            Some(current)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateConfig {
    pub sizing: SiblingSizing,
    /// Use own plus descendant sizes as the weight, instead of own size.
    pub cumulative: bool,
    /// Insert intermediate nodes for path segments between a catalog and a
    /// deeper nested one.
    pub virtual_dirs: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            sizing: SiblingSizing::EqualAngle,
            cumulative: false,
            virtual_dirs: true,
        }
    }
}

/// Builds the visualisation tree. The root is labelled with the repository
/// name, everything else with the last segment of its path.
pub fn build_viz_tree(root: &Subtree, repo_name: &str, config: &AggregateConfig) -> VizNode {
    let mut tree = convert(root, config);
    tree.label = repo_name.to_string();

    if config.cumulative {
        accumulate(&mut tree);
    } else {
        fill_virtual(&mut tree);
    }

    tree.share = 1.0;
    assign_shares(&mut tree, config.sizing);
    tree
}

fn display_path(mount_path: &str) -> String {
    if mount_path.is_empty() {
        "/".to_string()
    } else {
        mount_path.to_string()
    }
}

fn convert(subtree: &Subtree, config: &AggregateConfig) -> VizNode {
    let node = subtree.node();
    let mount_path = &node.catalog.mount_path;

    let mut children = Vec::with_capacity(node.children.len());
    for child in &node.children {
        let viz = convert(child, config);
        let child_path = &child.node().catalog.mount_path;
        if config.virtual_dirs {
            let relative = child_path
                .strip_prefix(mount_path.as_str())
                .unwrap_or(child_path)
                .trim_start_matches('/');
            let segments: Vec<&str> = relative.split('/').collect();
            let intermediate = &segments[..segments.len().saturating_sub(1)];
            insert_below(&mut children, mount_path, intermediate, viz);
        } else {
            children.push(viz);
        }
    }

    let missing: Vec<MissingViz> = subtree
        .direct_missing()
        .iter()
        .map(|m| MissingViz {
            path: m.catalog.mount_path.clone(),
            hash: m.catalog.hash.to_string(),
            size_mb: mb(m.size),
            kind: m.kind,
            reason: m.reason.clone(),
        })
        .collect();

    VizNode {
        label: node.catalog.name().to_string(),
        path: display_path(mount_path),
        hash: node.catalog.hash.to_string(),
        value: mb(node.size),
        color_metric: mb(node.size),
        share: 0.0,
        stopped: node.stopped,
        virtual_dir: false,
        incomplete: !missing.is_empty(),
        missing,
        children,
    }
}

/// Appends `child` to `siblings`, below (possibly new) virtual nodes for
/// each of the `intermediate` segments. Virtual nodes keep the order in
/// which they were first needed.
fn insert_below(siblings: &mut Vec<VizNode>, base: &str, intermediate: &[&str], child: VizNode) {
    let (segment, rest) = match intermediate.split_first() {
        Some(split) => split,
        None => {
            siblings.push(child);
            return;
        }
    };

    let path = format!("{}/{}", base, segment);
    let idx = match siblings
        .iter()
        .position(|s| s.virtual_dir && s.path == path)
    {
        Some(idx) => idx,
        None => {
            siblings.push(VizNode::virtual_dir(segment, path.clone()));
            siblings.len() - 1
        }
    };

    insert_below(&mut siblings[idx].children, &path, rest, child);
}

/// Post-order: value becomes own plus all descendants.
fn accumulate(node: &mut VizNode) -> f64 {
    let below: f64 = node.children.iter_mut().map(accumulate).sum();
    node.value = node.color_metric + below;
    node.value
}

/// Virtual nodes have no size of their own, they weigh what their children
/// weigh.
fn fill_virtual(node: &mut VizNode) -> f64 {
    let below: f64 = node.children.iter_mut().map(fill_virtual).sum();
    if node.virtual_dir {
        node.value = below;
    }
    node.value
}

fn assign_shares(node: &mut VizNode, sizing: SiblingSizing) {
    let values: Vec<f64> = node.children.iter().map(|c| c.value).collect();
    let shares = sizing.split(node.share, &values);
    for (child, share) in node.children.iter_mut().zip(shares) {
        child.share = share;
        assign_shares(child, sizing);
    }
}
