use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cvmfs_catalog::catalogstore::from_location;
use cvmfs_catalog::drilldown::build_directory_tree;
use cvmfs_catalog::{CatalogFetcher, CatalogHash, SiblingSizing};
use cvmfs_tracing::{LogFormat, TracingBuilder};
use cvmfs_viz::config::{normalize_ignore_path, parse_size, ReposFile};
use cvmfs_viz::pipeline::FailureKind;
use cvmfs_viz::{index, AggregateConfig, Pipeline, PipelineConfig, RepositoryConfig};
use tracing::{error, info, warn, Level};

/// Generates sunburst chart data for the nested catalogs of CernVM-FS
/// repositories.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    /// Don't draw progress bars.
    #[arg(long, short = 'q')]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walks the given repositories and writes one `.json.zst` artifact per
    /// repository, then regenerates `repos.json`.
    Generate {
        /// Repository locations, as `url`, `name=url`, or a local path.
        #[clap(value_name = "REPOSITORY")]
        repositories: Vec<RepositoryConfig>,

        /// A TOML file listing repositories and walk settings.
        /// Flags given on the command line take precedence.
        #[arg(long, env = "CVMFS_VIZ_REPOS_FILE")]
        repos_file: Option<PathBuf>,

        /// Don't descend into catalogs larger than this, e.g. 2MB or 500K.
        #[arg(long, short = 's', value_parser = parse_size)]
        stop_threshold: Option<u64>,

        /// Don't descend below this depth (the root being at 0).
        #[arg(long, short = 'd')]
        max_depth: Option<usize>,

        /// Stop downloading after this many catalogs per repository.
        #[arg(long)]
        max_catalogs: Option<usize>,

        /// Mount path prefixes to skip, can be repeated.
        #[arg(long = "ignore", value_name = "PATH")]
        ignore_paths: Vec<String>,

        /// Keep downloaded catalogs here.
        #[arg(long, env = "CVMFS_VIZ_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Don't keep downloaded catalogs on disk.
        #[arg(long)]
        no_cache: bool,

        /// Keep walked trees here, to reuse unchanged parts on the next run.
        #[arg(long, env = "CVMFS_VIZ_TREE_CACHE_DIR")]
        tree_cache_dir: Option<PathBuf>,

        /// Concurrent catalog downloads per repository.
        #[arg(long, short = 'j')]
        workers: Option<usize>,

        /// Repositories processed at the same time.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Time budget per repository attempt, in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Retries per repository after fetch errors or timeouts.
        #[arg(long, default_value_t = 0)]
        retries: usize,

        /// How the circle is divided between siblings.
        #[arg(long, default_value_t = SiblingSizing::EqualAngle)]
        sizing: SiblingSizing,

        /// Weigh catalogs by their own size plus everything below them.
        #[arg(long)]
        cumulative: bool,

        /// Don't insert nodes for path segments between nested catalogs.
        #[arg(long)]
        no_virtual_dirs: bool,

        /// Where to write the artifacts. `repos.json` goes into its parent.
        #[arg(long, short = 'o', default_value = "site/data")]
        out_dir: PathBuf,
    },
    /// Regenerates `repos.json` from the artifacts in a data directory.
    Index {
        #[clap(value_name = "DATA_DIR")]
        data_dir: PathBuf,
    },
    /// Prints the directory tree of a single catalog as JSON.
    Drilldown {
        /// Repository location, as URL or local path.
        location: String,

        /// Hash of the catalog.
        hash: CatalogHash,

        /// Mount path the catalog is expected at. Read from the catalog if
        /// not given.
        #[arg(long)]
        path: Option<String>,

        #[arg(long, default_value_t = SiblingSizing::Proportional)]
        sizing: SiblingSizing,
    },
}

fn default_cache_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache/cvmfs"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let logging = TracingBuilder::new(cli.log_level)
        .format(LogFormat::from_json_flag(cli.json))
        .progress(!cli.quiet)
        .build()?;

    match cli.command {
        Commands::Generate {
            repositories,
            repos_file,
            stop_threshold,
            max_depth,
            max_catalogs,
            ignore_paths,
            cache_dir,
            no_cache,
            tree_cache_dir,
            workers,
            concurrency,
            timeout,
            retries,
            sizing,
            cumulative,
            no_virtual_dirs,
            out_dir,
        } => {
            let file = match repos_file {
                Some(path) => ReposFile::load(&path).await?,
                None => ReposFile::default(),
            };

            let mut walk = file.walk;
            if let Some(stop_threshold) = stop_threshold {
                walk.stop_threshold = stop_threshold;
            }
            if max_depth.is_some() {
                walk.max_depth = max_depth;
            }
            if max_catalogs.is_some() {
                walk.max_catalogs = max_catalogs;
            }
            if let Some(workers) = workers {
                walk.max_concurrent_fetches = workers;
            }
            walk.ignore_paths.extend(ignore_paths);
            walk.ignore_paths = walk
                .ignore_paths
                .iter()
                .map(|p| normalize_ignore_path(p))
                .collect();

            let mut all_repositories = file.repositories;
            all_repositories.extend(repositories);
            if all_repositories.is_empty() {
                return Err("no repositories given".into());
            }

            let cache_dir = if no_cache {
                None
            } else {
                cache_dir.or_else(default_cache_dir)
            };

            info!(
                repositories = all_repositories.len(),
                stop_threshold = walk.stop_threshold,
                max_depth = ?walk.max_depth,
                max_catalogs = ?walk.max_catalogs,
                ignore_paths = ?walk.ignore_paths,
                cache_dir = ?cache_dir,
                "generating"
            );

            let pipeline = Pipeline::new(PipelineConfig {
                out_dir,
                concurrency,
                timeout: timeout.map(Duration::from_secs),
                retries,
                walk,
                aggregate: AggregateConfig {
                    sizing,
                    cumulative,
                    virtual_dirs: !no_virtual_dirs,
                },
                cache_dir,
                tree_cache_dir,
            });

            let report = pipeline.run(&all_repositories).await;

            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(summary) => info!(
                        repo.name = %outcome.name,
                        path = %summary.path.display(),
                        catalogs_found = summary.stats.catalogs_found,
                        catalogs_downloaded = summary.stats.catalogs_downloaded,
                        bytes_downloaded = summary.stats.bytes_downloaded,
                        large_catalogs = summary.stats.large_catalogs,
                        bytes_skipped = summary.stats.bytes_skipped,
                        reused = summary.stats.reused,
                        cache_hits = summary.cache_hits,
                        incomplete = summary.incomplete,
                        "succeeded"
                    ),
                    Err(failure) if failure.kind == FailureKind::Output => {
                        error!(repo.name = %outcome.name, err = %failure.message, "unable to write output")
                    }
                    Err(failure) => warn!(
                        repo.name = %outcome.name,
                        kind = %failure.kind,
                        err = %failure.message,
                        "failed"
                    ),
                }
            }

            let status = report.status();
            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                status = ?status,
                "done"
            );

            if status.exit_code() != 0 {
                std::process::exit(status.exit_code());
            }
        }
        Commands::Index { data_dir } => {
            let path = index::write_index(&data_dir).await?;
            info!(path = %path.display(), "wrote index");
        }
        Commands::Drilldown {
            location,
            hash,
            path,
            sizing,
        } => {
            let fetcher = CatalogFetcher::new(from_location(&location)?);
            let mount_path = path.as_deref().map(|p| p.trim_end_matches('/'));
            let tree = build_directory_tree(&fetcher, &hash, mount_path, sizing).await?;

            let mut stdout = logging.stdout();
            serde_json::to_writer(&mut stdout, &tree)?;
            writeln!(stdout)?;
        }
    }

    Ok(())
}
