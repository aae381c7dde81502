pub mod aggregate;
pub mod artifact;
pub mod config;
pub mod index;
pub mod pipeline;

pub use aggregate::{build_viz_tree, AggregateConfig, MissingViz, VizNode};
pub use config::RepositoryConfig;
pub use pipeline::{BatchReport, BatchStatus, Pipeline, PipelineConfig, RepositoryOutcome};
