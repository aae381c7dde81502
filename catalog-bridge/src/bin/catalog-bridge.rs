use std::collections::HashMap;
use std::sync::Arc;

use catalog_bridge::AppState;
use clap::Parser;
use cvmfs_catalog::catalogstore::from_location;
use cvmfs_catalog::CatalogFetcher;
use cvmfs_tracing::{LogFormat, TracingBuilder};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

/// Serves the directory tree of individual catalogs, for drilling down into
/// a nested catalog from the sunburst chart.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repositories to serve, as `name=url`. Can be repeated.
    #[arg(long = "repository", env = "CATALOG_BRIDGE_REPOSITORIES", value_delimiter = ',', value_parser = parse_repository, required = true)]
    repositories: Vec<(String, String)>,

    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    /// The address to listen on.
    #[clap(flatten)]
    listen_args: tokio_listener::ListenerAddressLFlag,
}

fn parse_repository(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, url)) if !name.is_empty() && !url.is_empty() => {
            Ok((name.to_string(), url.to_string()))
        }
        _ => Err(format!("expected name=url, got {}", s)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let _logging = TracingBuilder::new(cli.log_level)
        .format(LogFormat::from_json_flag(cli.json))
        .build()?;

    let mut repositories = HashMap::new();
    for (name, url) in cli.repositories {
        let fetcher = CatalogFetcher::new(from_location(&url)?);
        info!(repo.name = %name, repo.url = %url, "serving repository");
        repositories.insert(name, Arc::new(fetcher));
    }

    let app = catalog_bridge::gen_router()
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(repositories));

    let listen_address = &cli.listen_args.listen_address.unwrap_or_else(|| {
        "[::]:9000"
            .parse()
            .expect("invalid fallback listen address")
    });

    let listener = tokio_listener::Listener::bind(
        listen_address,
        &Default::default(),
        &cli.listen_args.listener_options,
    )
    .await?;

    info!(listen_address=%listen_address, "starting daemon");

    tokio_listener::axum07::serve(
        listener,
        app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
    )
    .await?;

    Ok(())
}
