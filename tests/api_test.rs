//! HTTP surface tests for the Read API, driven through `tower::ServiceExt::oneshot`
//! against the real router (mirrors the pack's `monitor_api_tests.rs` shape).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use feederwatch::api::AppState;
use feederwatch::broadcast::Broadcaster;
use feederwatch::config::{Settings, SettingsHandle};
use feederwatch::detect::{ClassifierRuntime, StubBackend};
use feederwatch::enrich::Enrichment;
use feederwatch::audio::AudioCorrelator;
use feederwatch::media_cache::MediaCache;
use feederwatch::media_proxy::MediaProxy;
use feederwatch::model::{Detection, DetectionSource, VideoClassificationStatus};
use feederwatch::reclassify::Reclassifier;
use feederwatch::storage::{EventStore, SqliteEventStore};
use serde_json::Value;
use tower::ServiceExt;

fn sample_detection(id: &str, camera: &str) -> Detection {
    Detection {
        external_event_id: id.to_string(),
        camera: camera.to_string(),
        detection_time: feederwatch::time::to_canonical(feederwatch::time::now()),
        display_name: "House Sparrow".to_string(),
        category_name: "bird".to_string(),
        score: 0.9,
        source: DetectionSource::Snapshot,
        frigate_score: None,
        sub_label: None,
        audio_detected: false,
        audio_confirmed: false,
        audio_species: None,
        audio_score: None,
        video_classification_status: VideoClassificationStatus::None,
        video_classification_label: None,
        video_classification_score: None,
        temperature: None,
        weather_condition: None,
        wind_speed: None,
        cloud_cover: None,
        precipitation: None,
        scientific_name: Some("Passer domesticus".to_string()),
        common_name: None,
        taxa_id: None,
        is_hidden: false,
    }
}

fn build_app() -> (Router, Arc<dyn EventStore>) {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MediaCache::new(dir.path().to_path_buf(), 30, 10_000_000).unwrap());
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    store.upsert(&sample_detection("E1", "cam1")).unwrap();

    let handle = SettingsHandle::new(Settings::default());
    let media_proxy = Arc::new(MediaProxy::new(reqwest::Client::new(), cache, store.clone(), handle.clone()));
    let classifier = Arc::new(ClassifierRuntime::new(Arc::new(StubBackend::new()), Duration::from_secs(5)).unwrap());
    let audio = Arc::new(AudioCorrelator::new(store.clone(), 6));
    let enrichment = Arc::new(Enrichment::new(None, None, 0.0, 0.0));
    let broadcaster = Arc::new(Broadcaster::new());
    let reclassifier = Arc::new(Reclassifier::new(
        store.clone(),
        media_proxy.clone(),
        classifier,
        audio,
        enrichment,
        broadcaster.clone(),
        handle.clone(),
        2,
    ));

    let state = AppState::new(store.clone(), media_proxy, broadcaster, reclassifier, handle);
    (feederwatch::api::router(state), store)
}

fn request(method: &str, uri: &str) -> Request<Body> {
    let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    let mut req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

#[tokio::test]
async fn health_reports_classifier_loaded() {
    let (app, _store) = build_app();
    let response = app.oneshot(request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["classifier_loaded"], true);
}

#[tokio::test]
async fn ready_is_ok_once_classifier_loaded() {
    let (app, _store) = build_app();
    let response = app.oneshot(request("GET", "/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn list_events_returns_seeded_detection() {
    let (app, _store) = build_app();
    let response = app.oneshot(request("GET", "/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["external_event_id"], "E1");
}

#[tokio::test]
async fn list_events_rejects_limit_out_of_range() {
    let (app, _store) = build_app();
    let response = app.oneshot(request("GET", "/events?limit=0")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "invalid_input");
}

#[tokio::test]
async fn count_events_reflects_store() {
    let (app, _store) = build_app();
    let response = app.oneshot(request("GET", "/events/count")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 1);
}

#[tokio::test]
async fn patch_event_missing_id_is_not_found() {
    let (app, _store) = build_app();
    let req = Request::builder()
        .method("PATCH")
        .uri("/events/MISSING")
        .header("content-type", "application/json")
        .body(Body::from("{\"is_hidden\":true}"))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn patch_event_updates_existing_detection() {
    let (app, _store) = build_app();
    let req = Request::builder()
        .method("PATCH")
        .uri("/events/E1")
        .header("content-type", "application/json")
        .body(Body::from("{\"is_hidden\":true}"))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["is_hidden"], true);
}

#[tokio::test]
async fn reclassify_unknown_strategy_is_rejected() {
    let (app, _store) = build_app();
    let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    let mut req = Request::builder()
        .method("POST")
        .uri("/events/E1/reclassify")
        .header("content-type", "application/json")
        .body(Body::from("{\"strategy\":\"audio\"}"))
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reclassify_accepts_video_strategy_and_returns_202() {
    let (app, _store) = build_app();
    let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    let mut req = Request::builder()
        .method("POST")
        .uri("/events/E1/reclassify")
        .header("content-type", "application/json")
        .body(Body::empty())
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["external_event_id"], "E1");
    assert_eq!(json["outcome"], "accepted");
}

#[tokio::test]
async fn snapshot_for_unknown_event_is_not_found() {
    let (app, _store) = build_app();
    let response = app.oneshot(request("GET", "/frigate/MISSING/snapshot.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
