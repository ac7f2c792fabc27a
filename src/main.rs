use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentrel::auth::DsnAuth;
use sentrel::batcher::Batcher;
use sentrel::client::SearchClient;
use sentrel::config::Settings;
use sentrel::handlers::AppState;
use sentrel::pipeline::{EventSink, Pipeline};
use sentrel::ratelimit::RateLimiter;
use sentrel::server;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let settings = Settings::from_env().context("invalid configuration")?;
    init_tracing(&settings);

    info!(
        app = %settings.app_name,
        host = %settings.host,
        port = settings.port,
        "starting ingestion gateway"
    );
    let settings = Arc::new(settings);

    // OpenSearch client and startup upserts. A down cluster is logged and the
    // service keeps serving; writes retry against it later.
    let client = Arc::new(SearchClient::connect(&settings).context("opensearch client setup")?);
    client.ensure_startup_resources().await;

    let pipeline = Pipeline::from_settings(&settings, client.clone());

    let batcher = Arc::new(Batcher::new(
        settings.batch_size,
        Duration::from_secs(settings.batch_timeout_seconds),
        pipeline.flush_handler(),
    ));
    batcher.start().await;

    if settings.use_celery {
        warn!("distributed task queue not configured; routing events through the in-process batcher");
    }
    let sink: Arc<dyn EventSink> = batcher.clone();

    let rate_limiter = settings.rate_limit_enabled.then(|| {
        Arc::new(RateLimiter::new(
            settings.rate_limit_requests,
            Duration::from_secs(settings.rate_limit_window),
        ))
    });

    let state = AppState {
        settings: settings.clone(),
        auth: Arc::new(DsnAuth::new(
            settings.allowed_public_keys.clone(),
            settings.auth_required,
        )),
        sink,
        batcher: batcher.clone(),
        client,
        pipeline,
        rate_limiter,
    };

    let app = server::build_router(state);
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Drain buffered events before the process exits.
    info!("draining event buffer");
    batcher.stop().await;
    info!("shutdown complete");

    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
