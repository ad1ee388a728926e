//! HTTP API server assembly

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{middleware as api_middleware, routes};
use crate::types::{EngineError, EngineResult};
use crate::SynapseRuntime;

/// Build the router with all endpoints and middleware.
pub fn build_router(runtime: Arc<SynapseRuntime>) -> Router {
    let mut router = Router::new()
        .route("/chat", post(routes::chat))
        .route("/engine/execute-step", post(routes::execute_step))
        .route("/mesh/resume", post(routes::mesh_resume))
        .route("/executions/:id", get(routes::get_execution))
        .route("/executions/:id/cancel", post(routes::cancel_execution))
        .route("/dlq/sagas", get(routes::dlq_list))
        .route("/dlq/stats", get(routes::dlq_stats))
        .route("/dlq/sagas/:id", get(routes::dlq_get))
        .route("/dlq/sagas/:id/resume", post(routes::dlq_resume))
        .route("/dlq/sagas/:id/cancel", post(routes::dlq_cancel))
        .route("/health", get(routes::health));

    if runtime.config.api.enable_rate_limiting {
        router = router.layer(middleware::from_fn(api_middleware::rate_limit_middleware));
    }
    router = router.layer(middleware::from_fn(api_middleware::logging_middleware));
    if runtime.config.api.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router.layer(TraceLayer::new_for_http()).with_state(runtime)
}

/// Bind and serve until the process is stopped.
pub async fn serve(runtime: Arc<SynapseRuntime>) -> EngineResult<()> {
    let address = format!(
        "{}:{}",
        runtime.config.api.bind_address, runtime.config.api.port
    );
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| EngineError::Internal(format!("failed to bind {address}: {e}")))?;
    tracing::info!(address = %address, "HTTP API listening");
    let router = build_router(runtime);
    axum::serve(listener, router)
        .await
        .map_err(|e| EngineError::Internal(format!("server error: {e}")))
}
