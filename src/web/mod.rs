mod routes;

pub use routes::router;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::progress::Tracker;
use crate::tags::TagManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub tracker: Arc<Tracker>,
    pub tags: Arc<TagManager>,
}

/// Start the web server and serve until the task is aborted.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    config: Arc<Config>,
    db: Database,
    tracker: Arc<Tracker>,
    tags: Arc<TagManager>,
) -> Result<()> {
    let host = config.web_server.host.clone();
    let port = config.web_server.port;

    let state = AppState {
        db,
        config,
        tracker,
        tags,
    };

    let app = routes::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // bind() resolves names, so "localhost" works as well as an address.
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind web server to {host}:{port}"))?;

    info!(host = %host, port, "Web server listening");

    axum::serve(listener, app).await.context("Web server error")?;

    Ok(())
}
