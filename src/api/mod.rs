//! HTTP API for health checks, deposit registration, lookups and admin commands

use crate::admin::{AdminCommand, AdminOutcome, AdminService};
use crate::chain::ChainRegistry;
use crate::config::{ApiConfig, Settings};
use crate::error::{SwapError, SwapResult};
use crate::ledger::{Ledger, SwapDirection, SwapIntent, SwapKey, SwapMatch};
use crate::registration::{Registrar, Registration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub ledger: Ledger,
    pub chains: Arc<ChainRegistry>,
    pub registrar: Arc<Registrar>,
    pub admin: Arc<AdminService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/swap/:direction/register", post(register_swap))
        .route("/swap/:direction/:pair_id/:txid", get(get_swap))
        .route("/history/:direction/:address", get(get_history))
        .route("/admin", post(admin_command))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

pub enum ApiError {
    BadRequest(String),
    Swap(SwapError),
}

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        ApiError::Swap(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Swap(e) => {
                let code = match e.status() {
                    "verify_failed" => StatusCode::UNPROCESSABLE_ENTITY,
                    "not_supported" | "bad_request" => StatusCode::BAD_REQUEST,
                    "not_found" => StatusCode::NOT_FOUND,
                    "unauthorized" => StatusCode::UNAUTHORIZED,
                    "invalid_state" => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (code, e.status(), e.to_string())
            }
        };

        let body = ErrorBody {
            status: status.to_string(),
            message,
        };
        (code, Json(body)).into_response()
    }
}

fn direction(raw: &str) -> Result<SwapDirection, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

/// Liveness plus ledger and chain health
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.ledger.health_check().await.is_ok();
    let chains: BTreeMap<String, bool> = state.chains.health_check().await.into_iter().collect();
    let healthy = database && chains.values().all(|h| *h);

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: state.settings.router.instance_id.clone(),
            database,
            chains,
        }),
    )
}

/// Intent counts by status
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.ledger.count_intents().await?;
    let intents: BTreeMap<String, u64> = counts
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();
    let total = intents.values().sum();
    Ok(Json(StatsResponse { total, intents }))
}

async fn register_swap(
    State(state): State<AppState>,
    Path(raw_direction): Path<String>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Registration>, ApiError> {
    let direction = direction(&raw_direction)?;
    let registration = state
        .registrar
        .register(
            direction,
            &request.pair_id,
            &request.txid,
            &request.bind,
            Utc::now(),
        )
        .await?;
    Ok(Json(registration))
}

async fn get_swap(
    State(state): State<AppState>,
    Path((raw_direction, pair_id, txid)): Path<(String, String, String)>,
    Query(query): Query<SwapQuery>,
) -> Result<Json<SwapResponse>, ApiError> {
    let direction = direction(&raw_direction)?;
    let key = SwapKey::new(direction, txid, pair_id, query.bind);
    let intent = state.ledger.get_intent(&key).await?;
    let swap = state.ledger.find_match(&key).await?;
    Ok(Json(SwapResponse {
        intent,
        swap_match: swap,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Path((raw_direction, address)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SwapMatch>>, ApiError> {
    let direction = direction(&raw_direction)?;
    let max = state.settings.router.history_limit;
    let limit = query.limit.unwrap_or(max).min(max);
    let history = state.ledger.find_history(direction, &address, limit).await?;
    Ok(Json(history))
}

async fn admin_command(
    State(state): State<AppState>,
    Json(command): Json<AdminCommand>,
) -> Result<Json<AdminOutcome>, ApiError> {
    let outcome = state.admin.execute(&command, Utc::now()).await?;
    Ok(Json(outcome))
}

// Request and response types

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    pair_id: String,
    txid: String,
    bind: String,
}

#[derive(Debug, Deserialize)]
struct SwapQuery {
    bind: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    instance_id: String,
    database: bool,
    chains: BTreeMap<String, bool>,
}

#[derive(Serialize)]
struct StatsResponse {
    total: u64,
    intents: BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct SwapResponse {
    intent: SwapIntent,
    #[serde(rename = "match")]
    swap_match: Option<SwapMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{Harness, BIND, PAIR};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(h: &Harness) -> Router {
        let ctx = &h.ctx;
        let registrar = Registrar::new(
            ctx.settings.clone(),
            ctx.ledger.clone(),
            ctx.chains.clone(),
        );
        let admin = AdminService::new(&ctx.settings.admin, ctx.ledger.clone()).unwrap();
        router(AppState {
            settings: ctx.settings.clone(),
            ledger: ctx.ledger.clone(),
            chains: ctx.chains.clone(),
            registrar: Arc::new(registrar),
            admin: Arc::new(admin),
        })
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn register_then_fetch() {
        let h = Harness::new();
        let body = serde_json::json!({ "pair_id": PAIR, "txid": "tx123", "bind": BIND });

        let (status, json) = call(app(&h), post_json("/swap/swapin/register", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["created"], true);
        assert_eq!(json["intent"]["status"], "not_stable");

        let (_, json) = call(app(&h), post_json("/swap/swapin/register", body)).await;
        assert_eq!(json["created"], false);

        let uri = format!("/swap/swapin/{}/tx123?bind={}", PAIR, BIND);
        let (status, json) = call(app(&h), get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["intent"]["key"]["txid"], "tx123");
        assert!(json["match"].is_null());

        let (status, json) = call(app(&h), get("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);
        assert_eq!(json["intents"]["not_stable"], 1);
    }

    #[tokio::test]
    async fn errors_carry_status_and_message() {
        let h = Harness::new();

        let uri = format!("/swap/swapin/{}/missing?bind={}", PAIR, BIND);
        let (status, json) = call(app(&h), get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["status"], "not_found");

        let (status, json) = call(app(&h), get("/history/sideways/0xbind")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "bad_request");

        let body = serde_json::json!({ "pair_id": "nope", "txid": "tx1", "bind": BIND });
        let (status, json) = call(app(&h), post_json("/swap/swapin/register", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "not_supported");

        let body = serde_json::json!({ "pair_id": PAIR, "txid": "", "bind": BIND });
        let (status, json) = call(app(&h), post_json("/swap/swapin/register", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], "bad_request");
    }

    #[tokio::test]
    async fn unsigned_admin_command_is_unauthorized() {
        let h = Harness::new();
        let body = serde_json::json!({
            "method": "allow_address",
            "params": { "address": "0x01" },
            "timestamp": Utc::now().timestamp(),
            "signature": "00",
        });

        let (status, json) = call(app(&h), post_json("/admin", body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["status"], "unauthorized");
    }

    #[tokio::test]
    async fn health_reports_chains() {
        let h = Harness::new();
        let (status, json) = call(app(&h), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["database"], true);
        assert_eq!(json["chains"]["src"], true);
    }
}
