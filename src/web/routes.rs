use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::db::{self, MediaFilter, StoreError, TimelinePeriod};
use crate::progress::Tracker;

use super::AppState;

/// Deadline for a single WebSocket write before the listener is dropped.
const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/stats", get(api_stats))
        .route("/api/media", get(api_media))
        .route("/api/media/{id}", get(api_media_by_id))
        .route("/api/media/{id}/tags", get(api_media_tags).post(api_assign_tag))
        .route("/api/media/{id}/tags/{tag_id}", delete(api_unassign_tag))
        .route("/api/search", get(api_search))
        .route("/api/communities", get(api_communities))
        .route("/api/timeline", get(api_timeline))
        .route("/api/creators", get(api_creators))
        .route("/api/storage", get(api_storage))
        .route("/api/runs", get(api_runs))
        .route("/api/tags", get(api_tags).post(api_create_tag))
        .route("/api/tags/{id}", delete(api_delete_tag))
        .route("/ws", get(ws_upgrade))
}

fn internal_error(err: &anyhow::Error) -> Response {
    warn!("API error: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

async fn api_status(State(state): State<AppState>) -> Response {
    Json(state.tracker.status().await).into_response()
}

async fn api_stats(State(state): State<AppState>) -> Response {
    match db::get_stats(state.db.pool()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct MediaParams {
    community: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn api_media(
    State(state): State<AppState>,
    Query(params): Query<MediaParams>,
) -> Response {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(50).min(200);

    let filter = MediaFilter {
        community: params.community.filter(|c| !c.is_empty()),
        media_type: params.media_type.filter(|t| !t.is_empty()),
        sort_by: params.sort.unwrap_or_default(),
        sort_order: params.order.unwrap_or_default(),
        limit: i64::from(per_page),
        offset: i64::from(page - 1) * i64::from(per_page),
    };

    match db::get_media_with_filters(state.db.pool(), &filter).await {
        Ok((media, total)) => Json(json!({
            "media": media,
            "total": total,
            "page": page,
            "per_page": per_page,
        }))
        .into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn api_media_by_id(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let media = match db::get_media_by_id(state.db.pool(), id).await {
        Ok(Some(media)) => media,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(&e),
    };

    let tags = db::get_tags_for_media(state.db.pool(), id)
        .await
        .unwrap_or_default();
    let thumbnail = db::get_thumbnail(state.db.pool(), id).await.ok().flatten();
    let metadata = db::get_metadata(state.db.pool(), id).await.ok().flatten();

    Json(json!({
        "media": media,
        "tags": tags,
        "thumbnail": thumbnail,
        "metadata": metadata,
    }))
    .into_response()
}

async fn api_media_tags(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match db::get_tags_for_media(state.db.pool(), id).await {
        Ok(tags) => Json(tags).into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct AssignTagBody {
    tag_id: i64,
}

async fn api_assign_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AssignTagBody>,
) -> Response {
    match db::assign_tag(state.db.pool(), id, body.tag_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn api_unassign_tag(
    State(state): State<AppState>,
    Path((id, tag_id)): Path<(i64, i64)>,
) -> Response {
    match db::unassign_tag(state.db.pool(), id, tag_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn api_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let query = params.q.unwrap_or_default();
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(50).min(200);
    let offset = i64::from(page - 1) * i64::from(per_page);

    match db::search_media(&state.db, &query, i64::from(per_page), offset).await {
        Ok((media, total)) => Json(json!({
            "media": media,
            "total": total,
            "page": page,
            "per_page": per_page,
        }))
        .into_response(),
        Err(StoreError::SearchUnavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "full-text search is not available"})),
        )
            .into_response(),
        Err(e) => internal_error(&anyhow::Error::new(e)),
    }
}

async fn api_communities(State(state): State<AppState>) -> Response {
    match db::get_communities(state.db.pool()).await {
        Ok(communities) => Json(communities).into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct TimelineParams {
    period: Option<String>,
}

async fn api_timeline(
    State(state): State<AppState>,
    Query(params): Query<TimelineParams>,
) -> Response {
    let period = params
        .period
        .as_deref()
        .and_then(TimelinePeriod::from_str)
        .unwrap_or(TimelinePeriod::Day);

    match db::get_timeline(state.db.pool(), period).await {
        Ok(buckets) => Json(buckets).into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<u32>,
}

async fn api_creators(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Response {
    let limit = params.limit.unwrap_or(10).min(100);
    match db::get_top_creators(state.db.pool(), i64::from(limit)).await {
        Ok(creators) => Json(creators).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn api_storage(State(state): State<AppState>) -> Response {
    match db::get_storage_breakdown(state.db.pool()).await {
        Ok(breakdown) => Json(breakdown).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn api_runs(State(state): State<AppState>, Query(params): Query<LimitParams>) -> Response {
    let limit = params.limit.unwrap_or(20).min(100);
    match db::recent_runs(state.db.pool(), i64::from(limit)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => internal_error(&e),
    }
}

async fn api_tags(State(state): State<AppState>) -> Response {
    match db::get_all_tags(state.db.pool()).await {
        Ok(tags) => Json(tags).into_response(),
        Err(e) => internal_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTagBody {
    name: String,
    color: Option<String>,
}

async fn api_create_tag(
    State(state): State<AppState>,
    Json(body): Json<CreateTagBody>,
) -> Response {
    match state.tags.create_user_tag(&body.name, body.color.as_deref()).await {
        Ok(tag) => (StatusCode::CREATED, Json(tag)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn api_delete_tag(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match db::delete_tag(state.db.pool(), id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(&e),
    }
}

// ========== Live progress ==========

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_progress(socket, state.tracker))
}

/// Push status snapshots to one listener until it disconnects or a write
/// misses the deadline.
async fn stream_progress(mut socket: WebSocket, tracker: std::sync::Arc<Tracker>) {
    let mut rx = tracker.subscribe();

    // New listeners get the current snapshot immediately.
    let current = tracker.status().await;
    if send_snapshot(&mut socket, &current).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Ok(snapshot) => {
                        if send_snapshot(&mut socket, &snapshot).await.is_err() {
                            debug!("Dropping progress listener after failed write");
                            return;
                        }
                    }
                    // Skipped snapshots are fine; resume with the newest.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Progress listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    // Pings are answered by axum; other messages are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_snapshot(socket: &mut WebSocket, status: &crate::progress::Status) -> Result<(), ()> {
    let payload = serde_json::to_string(status).map_err(|_| ())?;
    match tokio::time::timeout(WS_WRITE_TIMEOUT, socket.send(Message::Text(payload.into()))).await
    {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
