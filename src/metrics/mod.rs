//! Prometheus metrics for monitoring the relay progress.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    static ref PALETTE_NODE_HEIGHT: IntGauge = register_int_gauge!(
        "relayer_palette_node_height",
        "Latest block height reported by the palette node"
    )
    .unwrap();

    static ref PALETTE_SYNC_HEIGHT: IntGauge = register_int_gauge!(
        "relayer_palette_sync_height",
        "Palette checkpoint of the header-sync loop"
    )
    .unwrap();

    static ref POLY_NODE_HEIGHT: IntGauge = register_int_gauge!(
        "relayer_poly_node_height",
        "Latest block height reported by the poly node"
    )
    .unwrap();

    static ref POLY_SYNC_HEIGHT: IntGauge = register_int_gauge!(
        "relayer_poly_sync_height",
        "Poly checkpoint of the monitor loop"
    )
    .unwrap();

    static ref HEADERS_COMMITTED: IntCounter = register_int_counter!(
        "relayer_palette_headers_committed_total",
        "Epoch headers committed to the poly header-sync contract"
    )
    .unwrap();

    static ref DEPOSITS_SCANNED: IntCounter = register_int_counter!(
        "relayer_deposits_scanned_total",
        "Lock events enqueued into the retry table"
    )
    .unwrap();

    static ref DEPOSITS_SUBMITTED: IntCounter = register_int_counter!(
        "relayer_deposits_submitted_total",
        "Deposit proofs accepted by the poly cross-chain manager"
    )
    .unwrap();

    static ref DEPOSITS_CONFIRMED: IntCounter = register_int_counter!(
        "relayer_deposits_confirmed_total",
        "Deposit submissions confirmed on poly"
    )
    .unwrap();

    static ref CHECK_DEPTH: IntGauge = register_int_gauge!(
        "relayer_check_table_depth",
        "Submissions awaiting confirmation"
    )
    .unwrap();

    static ref BOOKKEEPER_ROTATIONS: IntCounter = register_int_counter!(
        "relayer_bookkeeper_rotations_total",
        "Bookkeeper rotations pushed to palette"
    )
    .unwrap();

    static ref POLY_TXS_RELAYED: IntCounter = register_int_counter!(
        "relayer_poly_txs_relayed_total",
        "Poly cross-chain messages executed on palette"
    )
    .unwrap();
}

pub fn set_palette_node_height(height: u64) {
    PALETTE_NODE_HEIGHT.set(height as i64);
}

pub fn set_palette_sync_height(height: u64) {
    PALETTE_SYNC_HEIGHT.set(height as i64);
}

pub fn set_poly_node_height(height: u32) {
    POLY_NODE_HEIGHT.set(height as i64);
}

pub fn set_poly_sync_height(height: u32) {
    POLY_SYNC_HEIGHT.set(height as i64);
}

pub fn inc_headers_committed() {
    HEADERS_COMMITTED.inc();
}

pub fn inc_deposits_scanned() {
    DEPOSITS_SCANNED.inc();
}

pub fn inc_deposits_submitted() {
    DEPOSITS_SUBMITTED.inc();
}

pub fn inc_deposits_confirmed() {
    DEPOSITS_CONFIRMED.inc();
}

pub fn set_check_depth(depth: usize) {
    CHECK_DEPTH.set(depth as i64);
}

pub fn inc_bookkeeper_rotations() {
    BOOKKEEPER_ROTATIONS.inc();
}

pub fn inc_poly_txs_relayed() {
    POLY_TXS_RELAYED.inc();
}

/// Serve `/metrics` on the configured port.
pub async fn run_server(port: u16) -> anyhow::Result<()> {
    use axum::{routing::get, Router};

    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("metrics server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render() {
        inc_headers_committed();
        set_check_depth(3);
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("relayer_palette_headers_committed_total"));
        assert!(text.contains("relayer_check_table_depth"));
    }
}
