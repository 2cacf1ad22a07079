//! Adaptive Cache Service
//!
//! Runs the cache maintenance loop against a league data API and serves
//! health and metrics endpoints.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Adaptive Cache Service                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  League API  │───▶│    Cache     │───▶│  Ops Server  │       │
//! │  │  (phase +    │    │   Manager    │    │  /healthz    │       │
//! │  │   producers) │    │              │    │  /metrics    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use adaptive_cache::adapters::HttpLeagueClient;
use adaptive_cache::cache::{
    CacheManager, CacheWarmer, Codec, InMemoryBackend, InvalidationEngine, LocalTier,
    TieredStore, TtlPolicyEngine,
};
use adaptive_cache::config::CacheSettings;
use adaptive_cache::domain::SystemClock;
use adaptive_cache::monitoring::CacheExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Adaptive Cache - season-aware caching for league data
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// League data API base URL (overrides the settings file)
    #[arg(long, env = "FEED_URL")]
    feed_url: Option<String>,

    /// Sport whose state drives the league phase
    #[arg(long, env = "SPORT")]
    sport: Option<String>,

    /// League IDs warmed on every cycle, comma separated
    #[arg(long, env = "LEAGUES", value_delimiter = ',')]
    leagues: Vec<String>,

    /// Attach an in-process distributed tier
    #[arg(long, env = "MEMORY_BACKEND")]
    memory_backend: bool,

    /// Ops server bind address
    #[arg(long, env = "OPS_ADDR", default_value = "0.0.0.0:8080")]
    ops_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut settings = match &args.config {
        Some(path) => CacheSettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => CacheSettings::default(),
    };
    if let Some(url) = &args.feed_url {
        settings.feed.base_url = url.clone();
    }
    if let Some(sport) = &args.sport {
        settings.feed.sport = sport.clone();
        settings.warmer.sport = sport.clone();
    }
    settings.warmer.tracked_leagues.extend(args.leagues.iter().cloned());
    settings.validate()?;

    info!("Starting Adaptive Cache");
    info!("  Feed URL: {}", settings.feed.base_url);
    info!("  Sport: {}", settings.feed.sport);
    info!("  Tracked leagues: {:?}", settings.warmer.tracked_leagues);
    info!("  Local tier capacity: {} bytes", settings.local.max_bytes);
    info!("  Distributed tier: {}", args.memory_backend);

    let client = Arc::new(HttpLeagueClient::new(settings.feed.clone())?);

    let policy = Arc::new(TtlPolicyEngine::with_feed(
        settings.policy.clone(),
        client.clone(),
        Arc::new(SystemClock),
    ));

    let mut store = TieredStore::new(
        LocalTier::with_config(settings.local.clone()),
        Arc::new(Codec::new(settings.codec.clone())),
        policy,
    )
    .with_config(settings.store.clone());
    if args.memory_backend {
        store = store.with_remote(Arc::new(InMemoryBackend::new()));
    }
    let store = Arc::new(store);

    let invalidation = Arc::new(InvalidationEngine::new(
        store.clone(),
        settings.invalidation.clone(),
    )?);
    let warmer = Arc::new(CacheWarmer::new(
        store.clone(),
        client,
        settings.warmer.clone(),
    ));
    let exporter = Arc::new(CacheExporter::new()?);

    let manager = Arc::new(
        CacheManager::new(store, invalidation, warmer, settings.manager.clone())
            .with_exporter(exporter),
    );

    let shutdown = CancellationToken::new();
    manager.start(&shutdown);

    let ops_addr: SocketAddr = args
        .ops_addr
        .parse()
        .with_context(|| format!("invalid ops server address {}", args.ops_addr))?;

    tokio::select! {
        result = ops::run_ops_server(ops_addr, manager.clone(), shutdown.clone()) => {
            if let Err(e) = result {
                error!("Ops server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    shutdown.cancel();
    manager.stop().await;

    info!("Adaptive Cache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn",
            level.as_str().to_lowercase()
        ))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Ops Server
// =============================================================================

mod ops {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, info};

    use adaptive_cache::cache::CacheManager;
    use adaptive_cache::error::{Error, Result};

    fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        manager: Arc<CacheManager>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let response = match req.uri().path() {
            "/healthz" => {
                let report = manager
                    .last_health()
                    .unwrap_or_else(|| manager.health_status());
                let status = if report.status.is_operational() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_vec(&report) {
                    Ok(body) => respond(status, "application/json", body),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
            "/readyz" => {
                if manager.is_running() {
                    respond(StatusCode::OK, "text/plain", "ok")
                } else {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
                }
            }
            "/metrics" => match manager.exporter().map(|e| e.encode()) {
                Some(Ok(text)) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Some(Err(e)) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
                None => respond(StatusCode::NOT_FOUND, "text/plain", "metrics disabled"),
            },
            "/stats" => match serde_json::to_vec(&manager.performance_metrics()) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            },
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    pub async fn run_ops_server(
        addr: SocketAddr,
        manager: Arc<CacheManager>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind ops server: {}", e)))?;

        info!("Ops server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted
                    .map_err(|e| Error::Internal(format!("Ops server accept error: {}", e)))?,
            };

            let io = TokioIo::new(stream);
            let manager = manager.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, manager.clone()));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Ops server connection error: {}", e);
                }
            });
        }
    }
}
