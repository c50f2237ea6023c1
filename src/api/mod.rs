//! Read API and route wiring. Thin axum handlers that delegate to
//! the Event Store, Media Proxy, Reclassifier and Broadcaster; business
//! logic lives in those modules (grounded on the pack's `api::http`
//! "thin handlers delegate to services" idiom).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broadcast::{guest_filter_for, Broadcaster};
use crate::config::SettingsHandle;
use crate::error::{AppError, Result};
use crate::model::{Detection, DetectionFilters, SortOrder};
use crate::ratelimit::{client_identity, RateLimiter};
use crate::reclassify::{ReclassifyOutcome, Reclassifier};
use crate::media_proxy::MediaProxy;
use crate::storage::EventStore;

const GUEST_ACCESS_CAPACITY: u32 = 60;
const GUEST_ACCESS_REFILL: Duration = Duration::from_secs(60);
const RECLASSIFY_CAPACITY: u32 = 10;
const RECLASSIFY_REFILL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub media_proxy: Arc<MediaProxy>,
    pub broadcaster: Arc<Broadcaster>,
    pub reclassifier: Arc<Reclassifier>,
    pub settings: SettingsHandle,
    pub guest_limiter: Arc<RateLimiter>,
    pub reclassify_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EventStore>,
        media_proxy: Arc<MediaProxy>,
        broadcaster: Arc<Broadcaster>,
        reclassifier: Arc<Reclassifier>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            store,
            media_proxy,
            broadcaster,
            reclassifier,
            settings,
            guest_limiter: Arc::new(RateLimiter::new(GUEST_ACCESS_CAPACITY, GUEST_ACCESS_REFILL)),
            reclassify_limiter: Arc::new(RateLimiter::new(RECLASSIFY_CAPACITY, RECLASSIFY_REFILL)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(list_events))
        .route("/events/count", get(count_events))
        .route("/events/:id", patch(patch_event))
        .route("/events/:id/reclassify", post(reclassify_event))
        .route("/frigate/:id/snapshot.jpg", get(snapshot))
        .route("/frigate/:id/clip.mp4", get(clip).head(clip))
        .route("/frigate/:id/clip-thumbnails.vtt", get(vtt))
        .route("/frigate/:id/clip-thumbnails.jpg", get(vtt_sprite))
        .route("/sse", get(sse_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A request is authenticated when it presents a bearer token (header or
/// `?token=`) matching `settings.api_auth_token`. When no token is
/// configured, every caller is treated as authenticated.
fn is_authenticated(headers: &HeaderMap, token_param: Option<&str>, configured: &Option<String>) -> bool {
    let Some(expected) = configured else {
        return true;
    };
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer.is_some_and(|t| t == expected) || token_param.is_some_and(|t| t == expected)
}

fn check_guest_rate_limit(state: &AppState, headers: &HeaderMap, peer: SocketAddr, authenticated: bool) -> Result<()> {
    if authenticated {
        return Ok(());
    }
    let settings = state.settings.current();
    let identity = client_identity(headers, peer.ip(), &settings.trusted_proxies);
    if !state.guest_limiter.check(&identity) {
        return Err(AppError::RateLimited);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    start_date: Option<String>,
    end_date: Option<String>,
    camera: Option<String>,
    species: Option<String>,
    min_score: Option<f64>,
    sort: Option<String>,
    include_hidden: Option<bool>,
    token: Option<String>,
}

impl EventsQuery {
    fn filters(&self) -> DetectionFilters {
        DetectionFilters {
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            camera: self.camera.clone(),
            species: self.species.clone(),
            min_score: self.min_score,
            audio_confirmed: None,
            include_hidden: self.include_hidden.unwrap_or(false),
        }
    }

    fn sort(&self) -> Result<SortOrder> {
        match &self.sort {
            None => Ok(SortOrder::Newest),
            Some(s) => SortOrder::parse(s).ok_or_else(|| AppError::InvalidInput(format!("invalid sort: {s}"))),
        }
    }

    fn limit(&self) -> Result<u32> {
        let limit = self.limit.unwrap_or(50);
        if !(1..=500).contains(&limit) {
            return Err(AppError::InvalidInput("limit must be within [1, 500]".to_string()));
        }
        Ok(limit)
    }
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<Detection>,
}

async fn list_events(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    check_guest_rate_limit(&state, &headers, peer, authenticated)?;

    let mut filters = query.filters();
    if !authenticated {
        guest_scope_filters(&mut filters, &state);
    }
    let sort = query.sort()?;
    let limit = query.limit()?;
    let offset = query.offset.unwrap_or(0);
    let events = state.store.list(&filters, sort, limit, offset)?;
    Ok(Json(EventsResponse { events }))
}

#[derive(Serialize)]
struct CountResponse {
    count: u64,
}

async fn count_events(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<CountResponse>> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    check_guest_rate_limit(&state, &headers, peer, authenticated)?;

    let mut filters = query.filters();
    if !authenticated {
        guest_scope_filters(&mut filters, &state);
    }
    let count = state.store.count(&filters)?;
    Ok(Json(CountResponse { count }))
}

/// Narrows a guest's filters to the configured public history window and
/// guest-allowed cameras, mirroring the Media Proxy's guest authorization
/// (`media_proxy::guest_authorize`) so the list/count endpoints never leak
/// what the media endpoints would refuse to serve.
fn guest_scope_filters(filters: &mut DetectionFilters, state: &AppState) {
    let settings = state.settings.current();
    filters.include_hidden = false;
    if filters.camera.is_none() && settings.guest_allowed_cameras.len() == 1 {
        filters.camera = Some(settings.guest_allowed_cameras[0].clone());
    }
    let cutoff = crate::time::to_canonical(crate::time::now() - chrono::Duration::hours(settings.public_history_hours as i64));
    filters.start_date = Some(match &filters.start_date {
        Some(existing) if existing.as_str() > cutoff.as_str() => existing.clone(),
        _ => cutoff,
    });
}

#[derive(Debug, Deserialize)]
struct PatchQuery {
    token: Option<String>,
}

async fn patch_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<PatchQuery>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<Detection>> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    if !authenticated {
        return Err(AppError::Unauthorized);
    }
    state.store.get_by_external_id(&id)?.ok_or(AppError::NotFound)?;
    let updated = state.store.patch(&id, patch)?;
    state.broadcaster.publish(crate::broadcast::BroadcastEvent::DetectionUpdated(updated.clone()));
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct ReclassifyRequest {
    #[serde(default)]
    strategy: Option<String>,
}

#[derive(Serialize)]
struct ReclassifyResponse {
    external_event_id: String,
    outcome: String,
}

async fn reclassify_event(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReclassifyRequest>>,
) -> Result<(StatusCode, Json<ReclassifyResponse>)> {
    let authenticated = is_authenticated(&headers, None, &state.settings.current().api_auth_token);
    if !authenticated {
        return Err(AppError::Unauthorized);
    }
    let settings = state.settings.current();
    let identity = client_identity(&headers, peer.ip(), &settings.trusted_proxies);
    if !state.reclassify_limiter.check(&identity) {
        return Err(AppError::RateLimited);
    }

    let strategy = body.and_then(|b| b.strategy.clone()).unwrap_or_else(|| "video".to_string());
    if strategy != "video" {
        return Err(AppError::InvalidInput(format!("unsupported reclassify strategy: {strategy}")));
    }

    let reclassifier = state.reclassifier.clone();
    let external_id = id.clone();
    tokio::spawn(async move {
        let _ = reclassifier.reclassify(&external_id).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ReclassifyResponse {
            external_event_id: id,
            outcome: "accepted".to_string(),
        }),
    ))
}

#[allow(dead_code)]
fn describe_outcome(outcome: &ReclassifyOutcome) -> &'static str {
    match outcome {
        ReclassifyOutcome::Completed { promoted: true } => "completed_promoted",
        ReclassifyOutcome::Completed { promoted: false } => "completed",
        ReclassifyOutcome::Failed(_) => "failed",
        ReclassifyOutcome::NoClip => "no_clip",
        ReclassifyOutcome::AlreadyRunning => "already_running",
    }
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    token: Option<String>,
}

async fn snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<MediaQuery>,
) -> Result<Response> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    state.media_proxy.snapshot(&id, authenticated).await
}

async fn clip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<MediaQuery>,
) -> Result<Response> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    let range = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok());
    state.media_proxy.clip(&id, authenticated, range, method == Method::HEAD).await
}

async fn vtt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<MediaQuery>,
) -> Result<Response> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    state.media_proxy.vtt(&id, authenticated).await
}

async fn vtt_sprite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<MediaQuery>,
) -> Result<Response> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    state.media_proxy.vtt_sprite(&id, authenticated).await
}

#[derive(Debug, Deserialize)]
struct SseQuery {
    token: Option<String>,
}

async fn sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>>> {
    let authenticated = is_authenticated(&headers, query.token.as_deref(), &state.settings.current().api_auth_token);
    let filter = guest_filter_for(&state.settings.current(), authenticated);
    let subscription = state.broadcaster.subscribe(filter);

    let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Some((Ok(SseEvent::default().data(payload)), sub))
    })
    .boxed();

    Sse::new(stream).keep_alive(KeepAlive::new().interval(crate::broadcast::HEARTBEAT_INTERVAL).text("heartbeat"))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    classifier_loaded: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let classifier_loaded = state.reclassifier.classifier_status().loaded;
    Json(HealthResponse {
        status: if classifier_loaded { "ok" } else { "degraded" },
        classifier_loaded,
    })
}

async fn ready(State(state): State<AppState>) -> Result<StatusCode> {
    if state.reclassifier.classifier_status().loaded {
        Ok(StatusCode::OK)
    } else {
        Err(AppError::StartupNotReady)
    }
}

