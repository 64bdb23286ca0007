use axum::{
    Json, Router,
    routing::{get, put},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub mod assembler;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod responses;
pub mod storage_class;

pub use error::*;
pub use handlers::*;
pub use storage_class::StorageClass;

#[derive(Clone)]
pub struct AppState {
    pub catalog: driftbay_catalog::CatalogService,
    pub registry: Arc<driftbay_session::SessionRegistry>,
    pub writer: Arc<driftbay_engine::ResumableWriter>,
    pub multipart: Arc<driftbay_engine::MultipartEngine>,
    pub store: driftbay_engine::LocalStore,
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_buckets))
        .route("/health", get(health_check))
        // Resumable stream surface
        .route(
            "/resumable/:upload_id",
            put(handlers::write_resumable_chunk)
                .get(handlers::query_resumable_status)
                .delete(handlers::abort_resumable),
        )
        // Bucket routes
        .route(
            "/:bucket",
            put(handlers::create_bucket)
                .get(handlers::get_bucket)
                .delete(handlers::delete_bucket),
        )
        // Object routes; the query string picks the multipart operation
        .route(
            "/:bucket/*key",
            put(handlers::put_object_or_part)
                .post(handlers::post_object)
                .get(handlers::get_object_or_parts)
                .delete(handlers::delete_object_or_abort)
                .head(handlers::head_object),
        )
        // Apply middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "driftbay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
