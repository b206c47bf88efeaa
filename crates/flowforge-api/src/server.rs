use crate::api::create_rest_api;
use crate::{ApiMetrics, AppState};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// The public API with its middleware stack
pub fn app(state: AppState) -> Router {
    create_rest_api(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(CatchPanicLayer::new())
            .layer(CorsLayer::permissive()),
    )
}

pub fn metrics_app(metrics: Arc<ApiMetrics>) -> Router {
    async fn metrics_handler(
        State(metrics): State<Arc<ApiMetrics>>,
    ) -> Result<String, (StatusCode, String)> {
        metrics
            .render()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `router` on `addr` until `shutdown` fires.
pub async fn serve(
    name: &'static str,
    addr: &str,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("{} listening on {}", name, listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("{} stopped", name);
    Ok(())
}
