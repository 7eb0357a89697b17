//! cxmedic -- detection and root cause analysis for delivery CX metrics.
//!
//! This crate watches customer-experience metrics computed over order
//! observations, opens incidents when a detector ensemble agrees a metric
//! regressed, and tests a catalog of operational hypotheses against the
//! order data to explain why.

pub mod api;
pub mod config;
pub mod detect;
pub mod metrics;
pub mod rca;
pub mod stats;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;

use anyhow::Result;

/// Start the cxmedic daemon: the HTTP API over the order and incident store.
pub async fn serve(bind: &str, db_path: &str, config: config::EngineConfig) -> Result<()> {
    tracing::info!(%db_path, "opening database");
    let pool = storage::open_pool(db_path)?;

    let state = api::AppState::new(pool, config);
    let app = api::router(state);

    let addr: std::net::SocketAddr = bind.parse()?;
    tracing::info!(%addr, "cxmedic listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
