use clap::Parser;
use gridrush_server::{
    config::ServerConfig,
    gateway::Gateway,
    http::{run_http_server, HttpState},
    leaderboard,
    manager::RoomManager,
    replay,
    storage::{JsonStore, TrackStore},
};
use gridrush_core::Track;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to server.toml configuration file
    #[arg(short, long, default_value = "./server.toml")]
    config: String,

    /// Override log level (trace|debug|info|warn|error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = ServerConfig::load_or_default(&args.config);

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    info!("Starting GridRush server v0.1.0");
    info!("Port: {}", config.server.port);
    info!("Data dir: {}", config.server.data_dir);
    info!("Mode: {}", config.server.deployment_mode);

    let data_dir = PathBuf::from(&config.server.data_dir);
    let tracks = Arc::new(TrackStore::open(data_dir.clone(), vec![Track::default_speedway()]).await?);
    let store = Arc::new(JsonStore::new(data_dir));

    let lap_reports = leaderboard::spawn_recorder(Arc::clone(&store));
    let replays = replay::spawn_recorder(Arc::clone(&store));
    let manager = RoomManager::new(Arc::clone(&tracks), config.game.clone(), lap_reports, replays);

    // Control surface on port + 1
    let http_state = HttpState {
        manager: Arc::clone(&manager),
        tracks: Arc::clone(&tracks),
        store,
    };
    let http_bind = format!("0.0.0.0:{}", config.server.port + 1);
    tokio::spawn(async move {
        if let Err(e) = run_http_server(http_bind, http_state).await {
            warn!("http server error: {}", e);
        }
    });

    // Game transport
    let bind = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&bind).await?;
    let gateway = Gateway::new(manager, tracks);
    tokio::spawn(gateway.run(listener));

    info!("Server is running on {}. Press Ctrl+C to stop.", bind);
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    Ok(())
}
