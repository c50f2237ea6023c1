//! feederwatchd - bird detection pipeline daemon.
//!
//! Wires the Event Store, Media Cache, Classifier Runtime, Audio
//! Correlator, Enrichment, Media Proxy, Broadcaster, Detection Processor,
//! Reclassifier and Event Router together, then serves the Read API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use feederwatch::api::{router, AppState};
use feederwatch::audio::AudioCorrelator;
use feederwatch::broadcast::Broadcaster;
use feederwatch::config::{self, Settings, SettingsHandle};
use feederwatch::detect::preprocess::Normalization;
use feederwatch::detect::{ClassifierBackend, ClassifierRuntime, StubBackend, TractBackend};
use feederwatch::enrich::Enrichment;
use feederwatch::media_cache::MediaCache;
use feederwatch::media_proxy::MediaProxy;
use feederwatch::processor::DetectionProcessor;
use feederwatch::reclassify::Reclassifier;
use feederwatch::router::EventRouter;
use feederwatch::storage::{EventStore, SqliteEventStore};

const CLASSIFIER_DEADLINE: Duration = Duration::from_secs(10);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Event-driven bird detection pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the persisted settings file.
    #[arg(long, env = "FEEDERWATCH_CONFIG", default_value = "config/config.json")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "FEEDERWATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn load_classifier(settings: &Settings) -> Arc<dyn ClassifierBackend> {
    if settings.model_path.exists() {
        match TractBackend::load(
            &settings.model_path,
            &settings.model_labels_path,
            settings.model_input_size,
            settings.model_input_size,
            Normalization::ZeroToOne,
        ) {
            Ok(backend) => return Arc::new(backend),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load classifier model, falling back to stub backend");
            }
        }
    } else {
        tracing::warn!(path = %settings.model_path.display(), "no classifier model found, running with stub backend");
    }
    Arc::new(StubBackend::new())
}

fn spawn_retention_loop(store: Arc<dyn EventStore>, cache: Arc<MediaCache>, settings: SettingsHandle) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            ticker.tick().await;
            let current = settings.current();
            let cutoff = feederwatch::time::to_canonical(
                feederwatch::time::now() - chrono::Duration::days(current.retention_days as i64),
            );
            if let Err(err) = store.enforce_retention(&cutoff) {
                tracing::warn!(error = %err, "event store retention sweep failed");
            }
            if let Err(err) = cache.enforce_retention(store.as_ref()).await {
                tracing::warn!(error = %err, "media cache retention sweep failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| "info".into()))
        .init();

    let settings = config::load(&args.config).context("failed to load configuration")?;
    let settings_handle = SettingsHandle::new(settings.clone());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "feederwatchd starting");

    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open(&settings.db_path).context("failed to open event store")?);
    let cache = Arc::new(MediaCache::new(settings.media_cache_dir.clone(), settings.retention_days, 10_000_000_000)?);
    let http_client = reqwest::Client::new();

    let media_proxy = Arc::new(MediaProxy::new(http_client.clone(), cache.clone(), store.clone(), settings_handle.clone()));
    let classifier_backend = load_classifier(&settings);
    let classifier = Arc::new(ClassifierRuntime::new(classifier_backend, CLASSIFIER_DEADLINE)?);
    let audio = Arc::new(AudioCorrelator::new(store.clone(), settings.audio_buffer_hours));
    let enrichment = Arc::new(Enrichment::new(
        settings.weather_base_url.clone(),
        settings.taxonomy_base_url.clone(),
        settings.latitude,
        settings.longitude,
    ));
    let broadcaster = Arc::new(Broadcaster::new());

    let processor = Arc::new(DetectionProcessor::new(
        store.clone(),
        media_proxy.clone(),
        classifier.clone(),
        audio.clone(),
        enrichment.clone(),
        broadcaster.clone(),
        settings_handle.clone(),
    ));

    let reclassifier = Arc::new(Reclassifier::new(
        store.clone(),
        media_proxy.clone(),
        classifier.clone(),
        audio.clone(),
        enrichment.clone(),
        broadcaster.clone(),
        settings_handle.clone(),
        num_cpus::get(),
    ));

    spawn_retention_loop(store.clone(), cache.clone(), settings_handle.clone());

    let event_router = EventRouter::new(settings_handle.clone(), processor.clone(), audio.clone());
    let router_handle = tokio::spawn(async move {
        if let Err(err) = event_router.run().await {
            tracing::error!(error = %err, "event router exited");
        }
    });

    let state = AppState::new(store, media_proxy, broadcaster, reclassifier, settings_handle);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&settings.api_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.api_addr))?;
    tracing::info!(addr = %settings.api_addr, "read API listening");

    let serve = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = serve => result.context("HTTP server failed")?,
        _ = router_handle => tracing::warn!("event router task ended unexpectedly"),
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
