//! Trellis Server - versioned file storage over HTTP

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_core::{Datastore, EngineConfig};
use trellis_server::TrellisHandler;

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author = "Trellis Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Versioned file storage server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Data directory; overrides the config file
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Create a repository with an empty main branch
    InitRepo {
        org: String,
        repo: String,

        #[arg(short, long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            data_dir,
            config,
            debug,
        } => {
            init_tracing(debug);

            let mut engine_config = match &config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            if let Some(dir) = data_dir {
                engine_config.data_dir = dir;
            }
            info!("Starting Trellis server on {}", addr);
            info!("Data directory: {}", engine_config.data_dir.display());

            let datastore = Datastore::open(&engine_config)
                .with_context(|| format!("Failed to open datastore at {:?}", engine_config.data_dir))?;
            let handler = Arc::new(TrellisHandler::new(datastore));

            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);

            loop {
                let (stream, _) = listener.accept().await?;
                let handler = handler.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler.handle(req).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection: {:?}", e);
                    }
                });
            }
        }

        Commands::InitRepo {
            org,
            repo,
            data_dir,
        } => {
            init_tracing(false);
            let engine_config = EngineConfig {
                data_dir,
                ..EngineConfig::default()
            };
            let datastore = Datastore::open(&engine_config)?;
            let entry = datastore.create_repo(&org, &repo).await?;
            println!("Created repository {}/{}", entry.org, entry.repo);
        }
    }

    Ok(())
}
