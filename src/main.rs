//! ReliefNet server binary.
//!
//! # API Endpoints
//!
//! - `POST /incidents` - Report an incident
//! - `GET /incidents` - Paged incident list
//! - `POST /incidents/:id/assign` - Volunteer joins an incident
//! - `POST /incidents/:id/resolve` - Caller leaves an incident
//! - `GET /chat/incident/:id` - Incident chat log
//! - `GET /users/me/incidents` - Caller's incident history
//! - `GET /ws` - Real-time channel
//! - `GET /health` - Health check
//!
//! See [`reliefnet::api::router`] for the full route table.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use reliefnet::api::{AppState, router};
use reliefnet::config::Config;
use reliefnet::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Message bodies and credentials are never logged; INFO keeps it that way.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("reliefnet=info".parse()?))
        .init();

    let config = Config::from_env();
    info!(
        port = config.port,
        db_url = %config.database_url,
        persist_delay_ms = config.location_persist_delay.as_millis() as u64,
        "Starting ReliefNet server"
    );

    let storage = Storage::from_config(&config).await?;
    info!("Database initialized");

    if let Some(token) = config.bootstrap_admin_token.as_deref() {
        let admin = storage.ensure_admin("Administrator", token).await?;
        info!(user_id = %admin.id, "Bootstrap administrator ready");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(storage, config);
    let dispatcher = state.dispatcher.clone();
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "ReliefNet is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let flushed = dispatcher.flush_pending_locations().await;
    info!(flushed, "Pending locations written, shutting down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
