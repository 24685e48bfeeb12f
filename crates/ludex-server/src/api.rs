//! HTTP handlers and router.
//!
//! Extension endpoints verify the request signature before the body is
//! interpreted; dashboard endpoints check the session token. The event
//! stream is plain SSE: it connects for anyone, but its authorization flag
//! is decided exactly once, here, at connect time.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use ludex_core::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::broadcast::ServerEvent;
use crate::error::ApiError;
use crate::state::{AppState, unix_ms};
use crate::trust::{ExtensionRegistration, RegisterCommand};
use crate::{auth, catalog, dashboard, notes, sessions, trust};

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let files = ServeDir::new(state.config.data_dir.clone());

    Router::new()
        .route("/health", get(health))
        // Extension surface
        .route("/api/extension/register", post(register_extension))
        .route("/api/session/open", post(open_session))
        .route("/api/session/close", post(close_session))
        .route("/api/library/sync", post(library_sync))
        .route("/api/library/manifest", get(library_manifest))
        .route("/api/notes/reconcile", post(notes_reconcile))
        .route("/api/notes/sync-check", get(notes_sync_check))
        .route("/api/screenshot", post(screenshot))
        // Dashboard surface
        .route("/api/auth/register", post(auth_register))
        .route("/api/auth/login", post(auth_login))
        .route("/api/auth/logout", post(auth_logout))
        .route("/api/extensions", get(list_extensions))
        .route("/api/extension/{id}/approve", post(approve_extension))
        .route("/api/extension/{id}/reject", post(reject_extension))
        .route("/api/extension/{id}/revoke", post(revoke_extension))
        .route("/api/extension/{id}", delete(remove_extension))
        .route("/api/sessions/recent", get(recent_sessions))
        .route("/api/notes", get(list_notes))
        .route("/api/events", get(events))
        // Reference data (read-only, ETag conditional)
        .route("/api/genres", get(list_genres))
        .route("/api/platforms", get(list_platforms))
        .route("/api/companies", get(list_companies))
        .nest_service("/files", files)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// ── Extension registration ──

async fn register_extension(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<RegisterCommand>,
) -> Result<impl IntoResponse, ApiError> {
    let id = trust::register(&state, &cmd, unix_ms())?;
    Ok((StatusCode::CREATED, Json(json!({ "registrationId": id }))))
}

async fn list_extensions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ExtensionRegistration>>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    Ok(Json(state.db.list_registrations()?))
}

async fn approve_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    trust::approve(&state, id, unix_ms())?;
    Ok(Json(json!({ "ok": true })))
}

async fn reject_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    trust::reject(&state, id, unix_ms())?;
    Ok(Json(json!({ "ok": true })))
}

async fn revoke_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    trust::revoke(&state, id, unix_ms())?;
    Ok(Json(json!({ "ok": true })))
}

async fn remove_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    trust::remove(&state, id)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Play sessions ──

async fn open_session(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<sessions::GameSession>, ApiError> {
    auth::authorize_extension(&state, "POST", uri.path(), &headers, &body, unix_ms())?;
    let cmd: sessions::OpenCommand = parse_body(&body)?;
    Ok(Json(sessions::open(&state, &cmd)?))
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth::authorize_extension(&state, "POST", uri.path(), &headers, &body, unix_ms())?;
    let cmd: sessions::CloseCommand = parse_body(&body)?;
    let closed = sessions::close(&state, &cmd)?;
    Ok(Json(json!({ "closed": closed.is_some() })))
}

async fn recent_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<sessions::GameSession>>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(sessions::get_recent(&state, unix_ms(), limit)?))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

// ── Catalog ──

async fn library_sync(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<catalog::SyncOutcome>, ApiError> {
    auth::authorize_extension(&state, "POST", uri.path(), &headers, &body, unix_ms())?;
    let snapshot: catalog::LibrarySnapshot = parse_body(&body)?;
    Ok(Json(catalog::sync_snapshot(&state, &snapshot)?))
}

async fn library_manifest(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::authorize_extension(&state, "GET", uri.path(), &headers, b"", unix_ms())?;

    // Before the first sync there is no persisted manifest; serve the
    // (empty) computed one without persisting it.
    let manifest = match state.db.load_manifest()? {
        Some(m) => m,
        None => catalog::build_manifest(&state)?,
    };
    let etag = manifest.hash.clone();
    Ok(conditional_json(&headers, &etag, &manifest))
}

// ── Notes ──

async fn notes_reconcile(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<notes::ReconcileResponse>, ApiError> {
    auth::authorize_extension(&state, "POST", uri.path(), &headers, &body, unix_ms())?;
    let request: notes::ReconcileRequest = parse_body(&body)?;
    Ok(Json(notes::reconcile(&state, request.notes)?))
}

async fn notes_sync_check(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth::authorize_extension(&state, "GET", uri.path(), &headers, b"", unix_ms())?;

    let Some(client_id) = headers.get("x-sync-id").and_then(|v| v.to_str().ok()) else {
        return Err(ApiError::Validation("missing X-Sync-Id header".into()));
    };
    let matched = notes::sync_check(&state, client_id)?;
    Ok(Json(json!({ "match": matched })))
}

async fn list_notes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<notes::GameNote>>, ApiError> {
    dashboard::require_session(&state, &headers)?;
    Ok(Json(state.db.live_notes()?))
}

// ── Screenshots ──

#[derive(Debug, Deserialize)]
struct ScreenshotQuery {
    name: String,
}

async fn screenshot(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(query): Query<ScreenshotQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // The raw image bytes are part of the signed payload, so a tampered
    // upload fails verification like any other request.
    auth::authorize_extension(&state, "POST", uri.path(), &headers, &body, unix_ms())?;

    let name = sanitize_file_name(&query.name)?;
    if body.is_empty() {
        return Err(ApiError::Validation("empty screenshot body".into()));
    }

    let dir = state.config.data_dir.join("screenshots");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot create screenshot dir: {e}")))?;
    tokio::fs::write(dir.join(&name), &body)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot store screenshot: {e}")))?;

    let url = format!("/files/screenshots/{name}");
    state.broadcaster.broadcast(ServerEvent::ScreenshotTaken {
        file: name.clone(),
        url: url.clone(),
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({ "file": name, "url": url })),
    ))
}

fn sanitize_file_name(name: &str) -> Result<String, ApiError> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(name.to_string())
    } else {
        Err(ApiError::Validation(
            "screenshot name must be a plain file name (letters, digits, '.', '_', '-')".into(),
        ))
    }
}

// ── Dashboard auth ──

#[derive(Debug, Deserialize)]
struct PasswordBody {
    password: String,
}

async fn auth_register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PasswordBody>,
) -> Result<impl IntoResponse, ApiError> {
    dashboard::register_password(&state, &body.password)?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true }))))
}

async fn auth_login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PasswordBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = dashboard::login(&state, &body.password, unix_ms())?;
    Ok(Json(json!({ "token": token })))
}

async fn auth_logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = dashboard::logout(&state, &headers)?;
    Ok(Json(json!({ "ok": removed })))
}

// ── Event stream ──

async fn events(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    // Authorization is decided once, here. The flag rides with the stream
    // for its whole life; privileged events are filtered out below for
    // streams that connected without a valid session.
    let authorized = dashboard::session_is_valid(&state, &headers);
    let (guard, rx) = state.broadcaster.subscribe(authorized);

    let intro = if authorized {
        Vec::new()
    } else {
        vec![ServerEvent::AuthError {
            message: "no valid dashboard session; restricted stream".into(),
        }]
    };

    let live = BroadcastStream::new(rx).filter_map(move |result| {
        // The guard lives inside this closure: when the client disconnects
        // the stream drops, the guard drops, and the registry entry goes.
        let _registered = &guard;
        match result {
            Ok(event) if authorized || !event.is_privileged() => Some(event),
            _ => None,
        }
    });

    let stream = tokio_stream::iter(intro).chain(live).map(|event| {
        let sse_event = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("encode error"));
        Ok::<_, Infallible>(sse_event)
    });

    Sse::new(stream)
}

// ── Reference data ──

async fn list_genres(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    reference_response(&headers, state.db.list_genres()?)
}

async fn list_platforms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    reference_response(&headers, state.db.list_platforms()?)
}

async fn list_companies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    reference_response(&headers, state.db.list_companies()?)
}

fn reference_response(
    headers: &HeaderMap,
    list: Vec<catalog::RefEntry>,
) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(&list)
        .map_err(|e| ApiError::Internal(format!("serialize reference list: {e}")))?;
    let etag = ContentHash::digest(&body).to_hex();
    Ok(conditional_json(headers, &etag, &list))
}

// ── Helpers ──

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("invalid body: {e}")))
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_matches('"') == etag)
        .unwrap_or(false)
}

fn conditional_json<T: Serialize>(headers: &HeaderMap, etag: &str, value: &T) -> Response {
    let etag_header = [(header::ETAG, format!("\"{etag}\""))];
    if etag_matches(headers, etag) {
        (StatusCode::NOT_MODIFIED, etag_header).into_response()
    } else {
        (etag_header, Json(value)).into_response()
    }
}
