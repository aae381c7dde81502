mod errors;
mod hash;
mod nodes;
mod sizing;

pub mod catalogstore;
pub mod drilldown;
pub mod fetcher;
pub mod manifest;
pub mod schema;
pub mod walker;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use errors::{Error, ErrorKind};
pub use fetcher::{CatalogFetcher, FetchedCatalog};
pub use hash::{CatalogHash, HASH_LEN};
pub use manifest::Manifest;
pub use nodes::{CatalogNode, CatalogRef, MissingCatalog, StopReason, Subtree};
pub use sizing::SiblingSizing;
pub use walker::{CatalogWalker, Walk, WalkConfig, WalkStats};
