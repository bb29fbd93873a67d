//! HTTP server wiring.
//!
//! ```text
//! GET  /                 service info
//! GET  /health           health + persist queue metrics
//! GET  /status           scan state
//! GET  /latest-frame     latest frame bytes
//! POST /frame            ingest a frame
//! POST /action/{action}  start-scan | proceed-to-scan | stop-scan
//! POST /save-result      persist a client result
//! GET  /history          recent saved scans (last 20)
//! GET  /records          stored record ids
//! GET  /records/{id}     stored record payload
//! ```

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::handlers::{self, AppState};

/// Builds the router. Kept separate from `start_server` for tests.
pub fn create_router(state: Arc<AppState>, max_frame_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/latest-frame", get(handlers::latest_frame))
        .route("/frame", post(handlers::receive_frame))
        .route("/action/{action}", post(handlers::handle_action))
        .route("/save-result", post(handlers::save_result))
        .route("/history", get(handlers::history))
        .route("/records", get(handlers::list_records))
        .route("/records/{scan_id}", get(handlers::get_record))
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(max_frame_bytes))
        .with_state(state)
}

/// Binds the listener and serves until the state's shutdown token fires.
///
/// Returns the bound address (useful with port 0) and the server task.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    max_frame_bytes: usize,
) -> Result<(SocketAddr, JoinHandle<()>), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| format!("Failed to bind {}: {}", addr, err))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| format!("Failed to read bound address: {}", err))?;

    let shutdown = state.shutdown_token.clone();
    let app = create_router(state, max_frame_bytes);
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %err, "HTTP server error");
        }
    });

    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, StoragePaths};
    use crate::state::SharedState;

    #[tokio::test]
    async fn start_server_binds_and_shuts_down() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = DaemonConfig::default();
        let paths = StoragePaths::new(temp_dir.path().to_path_buf());
        let shared = SharedState::open(&config, &paths).expect("open state");
        let (state, shutdown) = AppState::new(shared);

        let (addr, handle) = start_server(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            state,
            config.server.max_frame_bytes,
        )
        .await
        .expect("server should start");
        assert!(addr.port() > 0);

        shutdown.cancel();
        handle.await.expect("server task");
    }
}
