// Gear Watch - Operator API
// Read-only catalog views plus the out-of-stock override

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use gear_watch::db::LINK_ENTITY;
use gear_watch::logging::init_tracing;
use gear_watch::{
    clear_out_of_stock, get_entry, get_events_for_entity, link_entity_id, load_catalog,
    mark_out_of_stock, CatalogEntry, Config, Event, LinkNotFound, SqliteCatalog, Vendor,
    VendorLink,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }

    fn fail(status: StatusCode, message: String) -> Response {
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(message),
            }),
        )
            .into_response()
    }
}

/// Vendor link response, one per tracked or untracked vendor
#[derive(Serialize)]
struct LinkResponse {
    vendor: Vendor,
    vendor_name: &'static str,
    url: String,
    price: String,
    health: &'static str,
    tracked: bool,
}

#[derive(Serialize)]
struct EntryResponse {
    id: i64,
    name: String,
    category: String,
    links: Vec<LinkResponse>,
}

impl From<VendorLink> for LinkResponse {
    fn from(link: VendorLink) -> Self {
        Self {
            vendor: link.vendor,
            vendor_name: link.vendor.name(),
            tracked: link.is_tracked(),
            health: link.health.code(),
            url: link.url,
            price: link.last_known_price,
        }
    }
}

impl From<CatalogEntry> for EntryResponse {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            category: entry.category,
            links: entry.links.into_iter().map(LinkResponse::from).collect(),
        }
    }
}

fn parse_vendor(code: &str) -> Result<Vendor, Response> {
    Vendor::from_code(code).ok_or_else(|| {
        ApiResponse::<()>::fail(StatusCode::BAD_REQUEST, format!("unknown vendor: {}", code))
    })
}

fn internal_error(context: &str, e: anyhow::Error) -> Response {
    error!(error = %e, "{}", context);
    ApiResponse::<()>::fail(StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
}

/// 404 for a link that does not exist, 500 for anything the store threw
fn override_error(e: anyhow::Error) -> Response {
    match e.downcast_ref::<LinkNotFound>() {
        Some(missing) => ApiResponse::<()>::fail(StatusCode::NOT_FOUND, missing.to_string()),
        None => internal_error("Error updating vendor link", e),
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// GET /api/gear - Whole catalog with link states
async fn list_gear(State(state): State<AppState>) -> Response {
    let conn = state.conn();

    match load_catalog(&conn) {
        Ok(catalog) => {
            let response: Vec<EntryResponse> = catalog.into_iter().map(|e| e.into()).collect();
            ApiResponse::ok(response)
        }
        Err(e) => internal_error("Error loading catalog", e),
    }
}

/// GET /api/gear/:id - Prices for one entry
async fn view_prices(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let conn = state.conn();

    match get_entry(&conn, id) {
        Ok(Some(entry)) => ApiResponse::ok(EntryResponse::from(entry)),
        Ok(None) => ApiResponse::<()>::fail(StatusCode::NOT_FOUND, format!("no catalog entry {}", id)),
        Err(e) => internal_error("Error loading catalog entry", e),
    }
}

/// GET /api/gear/:id/:vendor/events - Audit trail of one link
async fn link_events(
    State(state): State<AppState>,
    Path((id, vendor)): Path<(i64, String)>,
) -> Response {
    let vendor = match parse_vendor(&vendor) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn();

    match get_events_for_entity(&conn, LINK_ENTITY, &link_entity_id(id, vendor)) {
        Ok(events) => ApiResponse::<Vec<Event>>::ok(events),
        Err(e) => internal_error("Error loading events", e),
    }
}

/// POST /api/gear/:id/:vendor/out-of-stock - Operator marks out of stock
async fn mark_link_out_of_stock(
    State(state): State<AppState>,
    Path((id, vendor)): Path<(i64, String)>,
) -> Response {
    let vendor = match parse_vendor(&vendor) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn();

    match mark_out_of_stock(&conn, id, vendor) {
        Ok(link) => {
            info!(entry_id = id, vendor = vendor.code(), "marked out of stock");
            ApiResponse::ok(LinkResponse::from(link))
        }
        Err(e) => override_error(e),
    }
}

/// DELETE /api/gear/:id/:vendor/out-of-stock - Operator lifts the flag
async fn clear_link_out_of_stock(
    State(state): State<AppState>,
    Path((id, vendor)): Path<(i64, String)>,
) -> Response {
    let vendor = match parse_vendor(&vendor) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn();

    match clear_out_of_stock(&conn, id, vendor) {
        Ok(link) => {
            info!(entry_id = id, vendor = vendor.code(), "cleared out of stock");
            ApiResponse::ok(LinkResponse::from(link))
        }
        Err(e) => override_error(e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    init_tracing(&cfg.log_level, cfg.log_json);

    let store = SqliteCatalog::open(&cfg.database_path)?;
    info!(path = %cfg.database_path.display(), "database opened");

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(store.into_connection())),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/gear", get(list_gear))
        .route("/gear/:id", get(view_prices))
        .route("/gear/:id/:vendor/events", get(link_events))
        .route(
            "/gear/:id/:vendor/out-of-stock",
            post(mark_link_out_of_stock).delete(clear_link_out_of_stock),
        )
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&cfg.bind_address).await?;
    info!(addr = %cfg.bind_address, "operator API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
