//! API server entry: bind and serve the router.

use std::sync::Arc;

use crate::api::router::api_router;
use crate::core_state::CoreState;

/// Bind `addr` and serve the API until the process exits.
pub async fn serve(core: Arc<CoreState>, addr: &str) -> std::io::Result<()> {
    let app = api_router(core);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, app).await
}
