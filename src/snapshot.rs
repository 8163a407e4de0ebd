//! JSON-over-HTTP neighbor snapshot.
//!
//! Any GET path returns `{node, time, neighbors: [{if_name, mac_address,
//! quality}]}` across all active interfaces.

use crate::interface::InterfaceMap;
use crate::scheduler::DaemonHandle;
use crate::store::Metric;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NeighborEntry {
    pub if_name: String,
    pub mac_address: String,
    pub quality: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Snapshot {
    pub node: String,
    pub time: f64,
    pub neighbors: Vec<NeighborEntry>,
}

/// Neighbors with a usable link and a known MAC, across interfaces.
pub fn collect<B>(interfaces: &mut InterfaceMap<B>, now: Instant) -> Vec<NeighborEntry> {
    let mut entries = Vec::new();
    for (if_name, iface) in interfaces.iter_mut() {
        let Some(store) = iface.store_mut() else {
            continue;
        };
        let view = store.view(now);
        for (neighbor, quality) in view.neighbors(Metric::Probability) {
            let Some(mac) = view.lookup_mac(neighbor) else {
                error!("Unable to determine MAC address for {}", neighbor);
                continue;
            };
            entries.push(NeighborEntry {
                if_name: if_name.clone(),
                mac_address: mac.to_string(),
                quality,
            });
        }
    }
    entries
}

#[derive(Clone)]
struct SnapshotState {
    handle: DaemonHandle,
    node: Arc<str>,
}

pub fn router(handle: DaemonHandle, node: String) -> Router {
    let state = SnapshotState {
        handle,
        node: node.into(),
    };
    Router::new()
        .route("/", get(serve_snapshot))
        .route("/*path", get(serve_snapshot))
        .with_state(state)
}

async fn serve_snapshot(
    State(state): State<SnapshotState>,
) -> Result<Json<Snapshot>, StatusCode> {
    let neighbors = state.handle.snapshot().await.map_err(|e| {
        error!("Snapshot unavailable: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    Ok(Json(Snapshot {
        node: state.node.to_string(),
        time,
        neighbors,
    }))
}

/// Serves snapshots on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    handle: DaemonHandle,
    node: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(handle, node))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Host name reported as `node`.
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
