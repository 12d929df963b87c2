use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::cache::MessageCache;
use crate::stats::Stats;

/// The control surface is loopback-only.
pub const CONTROL_ADDR: &str = "127.0.0.1:8053";

#[derive(Clone)]
pub struct ControlState {
    pub cache: Arc<MessageCache>,
    pub stats: Arc<Stats>,
}

#[derive(Serialize)]
struct PingResponse {
    ping: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    forward_count: u64,
    stub_forward_count: u64,
    lookup_count: u64,
    request_count: u64,
    dnssec_ok_count: u64,
    name_error_count: u64,
    no_data_count: u64,
    dnssec_cache_miss: u64,
    cache_miss: u64,
    cache_hit: u64,
    stale_cache_hit: u64,
    request_fail: u64,
    cache_size: usize,
    cache_capacity: i64,
    cache_hit_rate: f64,
}

impl StatsResponse {
    fn collect(state: &ControlState) -> Self {
        let stats = &state.stats;
        Self {
            forward_count: stats.forward_count.count(),
            stub_forward_count: stats.stub_forward_count.count(),
            lookup_count: stats.lookup_count.count(),
            request_count: stats.request_count.count(),
            dnssec_ok_count: stats.dnssec_ok_count.count(),
            name_error_count: stats.name_error_count.count(),
            no_data_count: stats.no_data_count.count(),
            dnssec_cache_miss: stats.dnssec_cache_miss.count(),
            cache_miss: stats.cache_miss.count(),
            cache_hit: stats.cache_hit.count(),
            stale_cache_hit: stats.stale_cache_hit.count(),
            request_fail: stats.request_fail.count(),
            cache_size: state.cache.len(),
            cache_capacity: state.cache.capacity(),
            cache_hit_rate: stats.cache_hit_rate(),
        }
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats))
        .route("/dump", get(dump))
        .with_state(state)
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse { ping: "pong" })
}

async fn stats(State(state): State<ControlState>) -> Json<StatsResponse> {
    Json(StatsResponse::collect(&state))
}

async fn dump(State(state): State<ControlState>) -> String {
    state.cache.dump()
}

pub async fn run(state: ControlState) -> anyhow::Result<()> {
    let addr: SocketAddr = CONTROL_ADDR.parse().context("parse control address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind control listener on {addr}"))?;
    info!(addr = %addr, "control server listening");
    axum::serve(listener, router(state))
        .await
        .context("control server")
}
