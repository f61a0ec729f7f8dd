//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Intent registrations and status transitions
//! - Outbound payouts, failures per step and replacements
//! - Stage ticks, errors and latency
//! - Chain health, big-value holds and admin commands

use crate::error::{SwapError, SwapResult};
use crate::ledger::{IntentStatus, SwapDirection, SwapType};
use crate::stages::StageReport;
use crate::tx::OutboundStep;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "swap_router_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    // Ledger metrics
    pub static ref INTENTS_REGISTERED: CounterVec = register_counter_vec!(
        "swap_router_intents_registered_total",
        "Total intents registered",
        &["direction"]
    ).unwrap();

    pub static ref INTENT_TRANSITIONS: CounterVec = register_counter_vec!(
        "swap_router_intent_transitions_total",
        "Total intent status transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref BIG_VALUE_HELD: CounterVec = register_counter_vec!(
        "swap_router_big_value_held_total",
        "Total deposits held for manual release",
        &["pair"]
    ).unwrap();

    // Outbound metrics
    pub static ref OUTBOUND_SENT: CounterVec = register_counter_vec!(
        "swap_router_outbound_sent_total",
        "Total payouts broadcast",
        &["chain", "swap_type"]
    ).unwrap();

    pub static ref OUTBOUND_FAILED: CounterVec = register_counter_vec!(
        "swap_router_outbound_failed_total",
        "Total failed payout attempts by step",
        &["chain", "step"]
    ).unwrap();

    pub static ref REPLACEMENTS: CounterVec = register_counter_vec!(
        "swap_router_replacements_total",
        "Total payouts replaced with the same nonce",
        &["chain"]
    ).unwrap();

    // Stage metrics
    pub static ref STAGE_RECORDS: CounterVec = register_counter_vec!(
        "swap_router_stage_records_total",
        "Records handled by stage and outcome",
        &["stage", "outcome"]
    ).unwrap();

    pub static ref STAGE_ERRORS: CounterVec = register_counter_vec!(
        "swap_router_stage_errors_total",
        "Stage ticks that failed as a whole",
        &["stage"]
    ).unwrap();

    pub static ref STAGE_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_router_stage_tick_seconds",
        "Stage tick duration",
        &["stage"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 120.0]
    ).unwrap();

    // Admin metrics
    pub static ref ADMIN_COMMANDS: CounterVec = register_counter_vec!(
        "swap_router_admin_commands_total",
        "Admin commands by method and result",
        &["method", "result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_intent_registered(direction: SwapDirection) {
    INTENTS_REGISTERED
        .with_label_values(&[direction.as_str()])
        .inc();
}

pub fn record_intent_transition(from: IntentStatus, to: IntentStatus) {
    INTENT_TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_big_value_held(pair_id: &str) {
    BIG_VALUE_HELD.with_label_values(&[pair_id]).inc();
}

pub fn record_outbound_sent(chain: &str, swap_type: SwapType) {
    OUTBOUND_SENT
        .with_label_values(&[chain, swap_type.as_str()])
        .inc();
}

pub fn record_outbound_failed(chain: &str, step: OutboundStep) {
    OUTBOUND_FAILED
        .with_label_values(&[chain, step.as_str()])
        .inc();
}

pub fn record_replacement(chain: &str) {
    REPLACEMENTS.with_label_values(&[chain]).inc();
}

pub fn record_stage_tick(stage: &str, report: &StageReport, latency_secs: f64) {
    STAGE_LATENCY
        .with_label_values(&[stage])
        .observe(latency_secs);
    for (outcome, count) in [
        ("advanced", report.advanced),
        ("failed", report.failed),
        ("unchanged", report.examined - report.advanced - report.failed),
    ] {
        STAGE_RECORDS
            .with_label_values(&[stage, outcome])
            .inc_by(count as f64);
    }
}

pub fn record_stage_error(stage: &str) {
    STAGE_ERRORS.with_label_values(&[stage]).inc();
}

pub fn record_admin_command(method: &str, accepted: bool) {
    ADMIN_COMMANDS
        .with_label_values(&[method, if accepted { "accepted" } else { "rejected" }])
        .inc();
}
