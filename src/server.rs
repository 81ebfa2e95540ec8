//! # Server Configuration
//!
//! Router assembly and the collector's serve loop.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers::{self, datetime, detections};
use crate::stats::DetectionQueryService;
use crate::store::{DetectionStore, EventStore};
use crate::{db, telemetry};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub store: Arc<dyn EventStore>,
    pub queries: DetectionQueryService,
}

impl AppState {
    /// Wire the event store and query service over one connection pool.
    pub fn new(db: DatabaseConnection) -> Self {
        let store: Arc<dyn EventStore> = Arc::new(DetectionStore::new(db.clone()));
        let queries = DetectionQueryService::new(store.clone());
        Self { db, store, queries }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route(
            "/api/train/detection",
            post(detections::ingest_detection).get(detections::list_detections),
        )
        .route(
            "/api/train/detection/latest",
            get(detections::latest_detection),
        )
        .route("/api/train/detection/{id}", get(detections::get_detection))
        .route("/api/train/stats", get(detections::detection_stats))
        .route(
            "/api/datetime",
            post(datetime::create_datetime).get(datetime::list_datetimes),
        )
        .route("/api/datetime/latest", get(datetime::latest_datetime))
        .route(
            "/api/datetime/{id}",
            get(datetime::get_datetime)
                .put(datetime::update_datetime)
                .delete(datetime::delete_datetime),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Run the collector until `shutdown` fires.
///
/// Opens the pool, applies pending migrations, then serves HTTP with
/// graceful shutdown.
pub async fn run_server(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("Invalid server address")?;

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("Failed to apply database migrations")?;

    let app = create_app(AppState::new(db));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, profile = %config.profile, "Collector listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Collector stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::readyz,
        crate::handlers::detections::ingest_detection,
        crate::handlers::detections::list_detections,
        crate::handlers::detections::latest_detection,
        crate::handlers::detections::get_detection,
        crate::handlers::detections::detection_stats,
        crate::handlers::datetime::create_datetime,
        crate::handlers::datetime::list_datetimes,
        crate::handlers::datetime::latest_datetime,
        crate::handlers::datetime::get_datetime,
        crate::handlers::datetime::update_datetime,
        crate::handlers::datetime::delete_datetime,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::DetectionEvent,
            crate::stats::DetectionStats,
            crate::handlers::HealthStatus,
            crate::handlers::datetime::DateTimeRequest,
            crate::handlers::datetime::DateTimeRecordResponse,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information and probes"),
        (name = "detections", description = "Train detection ingestion and queries"),
        (name = "datetime", description = "Operator time windows"),
    ),
    info(
        title = "trainwatch collector",
        description = "Stores train detections relayed from the MQTT bridge",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

/// Router over a fresh in-memory database.
#[cfg(test)]
pub(crate) async fn test_app() -> Router {
    create_app(AppState::new(crate::test_support::memory_db().await))
}
