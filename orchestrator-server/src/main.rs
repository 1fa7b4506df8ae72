//! Orchestrator control server: JSON control surface plus an event stream.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use orchestrator::app::{Collaborators, Orchestrator};
use orchestrator::io::config::load_config;
use orchestrator::io::paths::{StatePaths, init_state};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "orchestrator-server")]
#[command(about = "HTTP control surface for the checkpoint orchestrator")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Project directory (contains .orchestrator/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orchestrator_server=info".parse()?)
                .add_directive("orchestrator=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting orchestrator-server");

    let paths = StatePaths::new(&project_dir);
    if init_state(&paths, false)? {
        info!(config = %paths.config_path.display(), "wrote default config");
    }
    let config = load_config(&paths.config_path)?;
    let collaborators = Collaborators::http(&config, &paths)?;
    let orch = Orchestrator::open(&paths, config, collaborators)?;
    let background = orch.spawn_background();

    let state = AppState::new(orch);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.shutdown().await;
    }
    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
    }
}
