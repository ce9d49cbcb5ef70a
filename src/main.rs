#![forbid(unsafe_code)]

use anyhow::Result;
use liveswitch::config::ServerConfig;
use liveswitch::media::engine_events;
use liveswitch::media::mediasoup_engine::MediasoupEngine;
use liveswitch::metrics::ServerMetrics;
use liveswitch::room::RoomManager;
use liveswitch::signaling::SignalingServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "liveswitch=debug,mediasoup=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn report_server_exit(result: Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Signaling server error: {}", e),
        Err(e) => error!("Signaling server task failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;
    init_tracing(config.json_logs);

    info!("liveswitch - Starting server");
    info!("Configuration: {:?}", config);

    let (events_tx, events_rx) = engine_events();
    let engine = MediasoupEngine::new(config.media_config(), events_tx).await?;
    info!("Media engine initialized");

    let rooms = Arc::new(RoomManager::new(
        Arc::new(engine),
        config.ice_source.clone().into_provider(),
        ServerMetrics::new(),
        config.default_room_id.clone(),
    ));

    // Cancelled on Ctrl+C or when the media worker dies
    let shutdown = CancellationToken::new();
    let engine_task = rooms.spawn_engine_events(events_rx, shutdown.clone());

    let server = SignalingServer::new(rooms.clone(), config.max_connections, config.metrics_token.clone());
    let addr = SocketAddr::new(config.bind_addr, config.port);
    let mut serve_task = tokio::spawn(server.serve(addr, shutdown.clone()));
    let mut server_done = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = shutdown.cancelled() => {
            error!("Media engine failed, shutting down...");
        }
        result = &mut serve_task => {
            server_done = true;
            report_server_exit(result);
        }
    }
    shutdown.cancel();

    if !server_done {
        report_server_exit(serve_task.await);
    }
    let _ = engine_task.await;
    rooms.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
