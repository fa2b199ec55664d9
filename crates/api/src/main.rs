use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use citypulse_api::background::cache_sweep;
use citypulse_api::config::HubConfig;
use citypulse_api::producer::{ProducerSet, ReplayFile};
use citypulse_api::routes;
use citypulse_api::state::AppState;
use citypulse_api::upstream::UpstreamBridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "citypulse_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration and app state ---
    let state = AppState::from_env().context("Failed to build hub state")?;
    let config = Arc::clone(&state.config);
    tracing::info!(
        host = %config.host,
        port = config.port,
        reading_capacity = config.reading_buffer_capacity,
        alert_capacity = config.alert_log_capacity,
        "Loaded hub configuration"
    );

    // --- CORS ---
    let cors = build_cors_layer(&config)?;

    let shutdown = tokio_util::sync::CancellationToken::new();

    // --- Cache sweep ---
    let sweep_handle = tokio::spawn(cache_sweep::run(
        Arc::clone(&state.query),
        Arc::clone(&state.broadcaster),
        cache_sweep::SWEEP_INTERVAL,
        shutdown.child_token(),
    ));

    // --- Replay producers ---
    let mut producers = ProducerSet::new(shutdown.child_token());
    if let Some(path) = &config.replay_file {
        let replay = ReplayFile::load(path)?;
        for (name, source) in replay.into_sources() {
            producers.spawn(name, source, config.replay_interval, Arc::clone(&state.ingestor));
        }
        tracing::info!(count = producers.len(), path = %path.display(), "Replay producers started");
    }

    // --- Upstream bridge ---
    let bridge_handle = config.bridge_upstream_url.as_ref().map(|url| {
        tracing::info!(url = %url, "Upstream bridge enabled");
        let bridge = UpstreamBridge::new(url.clone(), Arc::clone(&state.broadcaster));
        tokio::spawn(bridge.run(shutdown.child_token()))
    });

    // --- Request ID header name ---
    let request_id_header = HeaderName::from_static("x-request-id");

    // --- Router ---
    let app = routes::router()
        // -- Middleware stack (applied bottom-up) --
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state.clone());

    // --- Start server ---
    let ip: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(ip, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    // WebSocket connections only end once their queues are closed, so the
    // broadcaster is shut down as soon as the signal arrives.
    let broadcaster = Arc::clone(&state.broadcaster);
    let cancel = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            cancel.cancel();
            let ws_count = broadcaster.connection_count();
            tracing::info!(ws_count, "Closing WebSocket connections");
            broadcaster.shutdown_all();
        })
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let produced = producers.shutdown().await;
    tracing::info!(
        accepted = produced.accepted,
        rejected = produced.rejected,
        "Producers stopped"
    );
    let _ = tokio::time::timeout(Duration::from_secs(5), sweep_handle).await;
    if let Some(handle) = bridge_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        tracing::info!("Upstream bridge stopped");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Build the CORS middleware layer from hub configuration.
///
/// Fails startup if any configured origin is invalid.
fn build_cors_layer(config: &HubConfig) -> anyhow::Result<CorsLayer> {
    let origins = config
        .cors_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin '{o}'"))
        })
        .collect::<anyhow::Result<Vec<HeaderValue>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600)))
}
