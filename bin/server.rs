// Serialstock - REST API server
// JSON interface over the inbound and outbound engines. The web UI,
// auth and rendering live elsewhere; this binary only speaks the data.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

use serialstock::inbound::{DuplicatePolicy, InboundContext, InboundReconciler};
use serialstock::{
    outbound_commit, outbound_preview, parse_scan_payload, setup_database, stock_overview,
    DeviceStock, InboundReport, OutboundCommit, OutboundPreview, ParsedLabel, SerialConflict,
    StockError,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Structured error body: expected failure classes carry the detail the
/// caller needs to correct its input, never a bare string.
#[derive(Serialize)]
struct ApiError {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unresolved_devices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate_serials: Option<Vec<SerialConflict>>,
}

impl ApiError {
    fn simple(kind: &'static str, message: String) -> Self {
        ApiError {
            kind,
            message,
            unresolved_devices: None,
            duplicate_serials: None,
        }
    }
}

fn error_response<T: Serialize>(err: StockError) -> axum::response::Response {
    let message = err.to_string();
    let (status, body) = match err {
        StockError::UnresolvedDevices(names) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            ApiError {
                kind: "unresolved_devices",
                message,
                unresolved_devices: Some(names),
                duplicate_serials: None,
            },
        ),
        StockError::DuplicateSerials(conflicts) => (
            StatusCode::CONFLICT,
            ApiError {
                kind: "duplicate_serials",
                message,
                unresolved_devices: None,
                duplicate_serials: Some(conflicts),
            },
        ),
        StockError::MalformedSheet { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::simple("malformed_sheet", message),
        ),
        StockError::EmptyScan | StockError::InvalidSerial(_) => (
            StatusCode::BAD_REQUEST,
            ApiError::simple("invalid_input", message),
        ),
        StockError::NothingToCommit => (
            StatusCode::CONFLICT,
            ApiError::simple("nothing_to_commit", message),
        ),
        StockError::UnknownDevice(_) | StockError::UnknownBox(_) => (
            StatusCode::NOT_FOUND,
            ApiError::simple("not_found", message),
        ),
        StockError::Db(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::simple("internal", message),
        ),
    };

    (status, Json(ApiResponse::<T>::err(body))).into_response()
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Deserialize)]
struct InboundLabelRequest {
    device: String,
    box_code: String,
    location: Option<String>,
    serials: Vec<String>,
}

#[derive(Deserialize)]
struct InboundConfirmRequest {
    labels: Vec<InboundLabelRequest>,
    actor: String,
    vendor: Option<String>,
    /// "skip" (default, bulk import) or "strict" (manual entry)
    policy: Option<String>,
}

#[derive(Deserialize)]
struct OutboundPreviewRequest {
    scan: String,
}

#[derive(Deserialize)]
struct OutboundCommitRequest {
    scan: String,
    actor: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/stock - Per-device stock overview
async fn get_stock(State(state): State<AppState>) -> impl IntoResponse {
    let conn = state.db.lock().unwrap();

    match stock_overview(&conn) {
        Ok(overview) => (StatusCode::OK, Json(ApiResponse::ok(overview))).into_response(),
        Err(e) => error_response::<Vec<DeviceStock>>(StockError::Db(e)),
    }
}

/// POST /api/inbound/confirm - Reconcile labels into the ledger
async fn inbound_confirm(
    State(state): State<AppState>,
    Json(request): Json<InboundConfirmRequest>,
) -> impl IntoResponse {
    let policy = match request.policy.as_deref() {
        None | Some("skip") => DuplicatePolicy::SkipAndCount,
        Some("strict") => DuplicatePolicy::RejectBatch,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<InboundReport>::err(ApiError::simple(
                    "invalid_input",
                    format!("unknown policy '{other}' (expected skip|strict)"),
                ))),
            )
                .into_response();
        }
    };

    let labels: Vec<ParsedLabel> = request
        .labels
        .into_iter()
        .map(|l| ParsedLabel {
            qty: l.serials.len() as i64,
            device: l.device,
            box_code: l.box_code,
            location: l.location,
            serials: l.serials,
        })
        .collect();

    let mut ctx = InboundContext::new(&request.actor);
    if let Some(vendor) = &request.vendor {
        ctx = ctx.with_vendor(vendor);
    }

    let mut conn = state.db.lock().unwrap();
    match InboundReconciler::with_policy(policy).reconcile(&mut conn, &labels, &ctx) {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::ok(report))).into_response(),
        Err(e) => error_response::<InboundReport>(e),
    }
}

/// POST /api/outbound/preview - Non-mutating preview of a scan
async fn outbound_preview_handler(
    State(state): State<AppState>,
    Json(request): Json<OutboundPreviewRequest>,
) -> impl IntoResponse {
    let payload = match parse_scan_payload(&request.scan) {
        Ok(payload) => payload,
        Err(e) => return error_response::<OutboundPreview>(e),
    };

    let conn = state.db.lock().unwrap();
    match outbound_preview(&conn, &payload) {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::ok(report))).into_response(),
        Err(e) => error_response::<OutboundPreview>(e),
    }
}

/// POST /api/outbound/commit - Commit a scan with re-check semantics
async fn outbound_commit_handler(
    State(state): State<AppState>,
    Json(request): Json<OutboundCommitRequest>,
) -> impl IntoResponse {
    let payload = match parse_scan_payload(&request.scan) {
        Ok(payload) => payload,
        Err(e) => return error_response::<OutboundCommit>(e),
    };

    let mut conn = state.db.lock().unwrap();
    match outbound_commit(&mut conn, &payload, &request.actor) {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::ok(report))).into_response(),
        Err(e) => error_response::<OutboundCommit>(e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let db_path = std::env::var("SERIALSTOCK_DB").unwrap_or_else(|_| "serialstock.db".to_string());
    let conn = Connection::open(&db_path).expect("Failed to open database");
    setup_database(&conn).expect("Failed to set up schema");
    tracing::info!(db = %db_path, "database opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stock", get(get_stock))
        .route("/inbound/confirm", post(inbound_confirm))
        .route("/outbound/preview", post(outbound_preview_handler))
        .route("/outbound/commit", post(outbound_commit_handler))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!(addr, "server listening");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
