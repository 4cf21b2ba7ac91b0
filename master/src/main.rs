mod error;
mod failover;
mod handlers;
mod state;

use anyhow::{Context, Result};
use common::config::{env_or, pending_ttl};
use common::naming::NamingConvention;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

pub const MAX_TASK_ATTEMPTS: u32 = 3;
pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=debug,tower_http=info")),
        )
        .init();

    let naming = NamingConvention::from_env();
    let ttl = pending_ttl();
    info!(
        "markers {:?}, TTL de pendientes {}s",
        naming.markers,
        ttl.as_secs()
    );
    let state = AppState::new(naming, ttl);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // failover de workers en segundo plano
    tokio::spawn(failover::run_failover_loop(state));

    let addr: String = env_or("MASTER_BIND_ADDR", "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
