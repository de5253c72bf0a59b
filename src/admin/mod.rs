//! Admin HTTP surface: liveness, chat command routing and pushed member
//! events.

pub mod handlers;
pub mod router;

use tracing::info;

use crate::context::WatchContext;

pub use router::build_router;

/// Serve the admin router on `bind_addr` until the context's shutdown token
/// is cancelled.
pub async fn serve(ctx: WatchContext, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "admin: listening");
    let shutdown = ctx.shutdown.clone();
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
