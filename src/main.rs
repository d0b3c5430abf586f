//! HTTP server for the ride auction engine.
//!
//! Env: `PORT` (default 8080), `ARCHIVE_PATH` (optional ride state file: archived and in-flight
//! rides, loaded on start and saved on shutdown), plus the engine settings read by
//! `EngineConfig::from_env`.

use log::{error, info};
use ride_auction_engine::api;
use ride_auction_engine::clock::{Clock, SystemClock};
use ride_auction_engine::persistence::{FilePersistence, PersistedState};
use ride_auction_engine::{DispatchCoordinator, EngineConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    let _ = env_logger::try_init();
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let persistence = std::env::var("ARCHIVE_PATH").ok().map(FilePersistence::new);

    let config = EngineConfig::from_env();
    info!("engine config {:?}", config);
    let dispatcher = match DispatchCoordinator::new(config) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to start dispatcher: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(p) = &persistence {
        match p.load() {
            Ok(Some(state)) => match state.restore_into(&dispatcher) {
                Ok((archived, live)) => info!("state restored archived={} live={}", archived, live),
                Err(e) => {
                    error!("failed to restore ride state: {}", e);
                    std::process::exit(1);
                }
            },
            Ok(None) => {}
            Err(e) => error!("failed to load archive: {}", e),
        }
    }

    let app = api::create_router(dispatcher.clone());
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("bind {} failed: {}", addr, e);
            std::process::exit(1);
        }
    };
    eprintln!("listening on http://{}", addr);
    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    if let Err(e) = served {
        error!("server error: {}", e);
    }

    if let Some(p) = &persistence {
        let state = PersistedState::capture(&dispatcher, SystemClock.now_millis());
        match p.save(&state) {
            Ok(()) => info!(
                "ride state saved archived={} live={}",
                state.rides.len(),
                state.live.len()
            ),
            Err(e) => error!("failed to save archive: {}", e),
        }
    }
}
