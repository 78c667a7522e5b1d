//! API server assembly.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

use super::v0;
use crate::coordinator::CoordinatorHandle;
use crate::notify::LocalNotificationScheduler;
use crate::refresh::RefreshHandle;
use crate::store::AlarmStore;
use crate::tracing::prelude::*;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "daybreak-engine API",
        description = "Smart alarm orchestration engine"
    ),
    tags(
        (name = "engine", description = "Engine status and control"),
        (name = "alarms", description = "Alarm collection"),
        (name = "notifications", description = "Pending local notifications"),
    )
)]
struct ApiDoc;

/// Everything the handlers need, shared behind an `Arc`.
pub struct ApiState {
    pub store: Arc<AlarmStore>,
    pub coordinator: CoordinatorHandle,
    pub refresh: RefreshHandle,
    pub notifier: Arc<LocalNotificationScheduler>,
    pub started: Instant,
}

pub type SharedState = Arc<ApiState>;

/// Build the full application router, Swagger UI included.
pub fn router(state: SharedState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/api/v0", v0::routes())
        .split_for_parts();

    router
        .merge(SwaggerUi::new("/docs").url("/api/v0/openapi.json", api))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until cancelled.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    cancellation: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await
}
