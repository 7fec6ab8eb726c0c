use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_cell::SchedulingEngine;
use audit_cell::AuditRecorder;
use shared_config::AppConfig;
use shared_database::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());

    // Open the store (runs migrations)
    let store = SqliteStore::from_config(&config)
        .with_context(|| format!("opening store at {}", config.database_path))?;
    info!("Store ready at {}", config.database_path);

    // Audit recorder and its retry worker
    let (recorder, worker) = AuditRecorder::with_retry_worker(
        store,
        config.audit_retry_attempts,
        config.audit_retry_delay(),
    );
    let worker = tokio::spawn(worker.run());

    // Pending-appointment expiry sweep
    let (stop_sweep, sweep_stopped) = watch::channel(false);
    let engine = SchedulingEngine::new(recorder.clone(), &config);
    let sweep = tokio::spawn(expiry_sweep(
        engine,
        config.expiry_sweep_interval(),
        sweep_stopped,
    ));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(config.clone(), &recorder)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down background tasks");
    stop_sweep.send(true).ok();
    if let Err(e) = sweep.await {
        error!("Expiry sweep task failed: {}", e);
    }

    // Deliver queued audit records before exiting
    recorder.retry_handle().shutdown();
    if let Err(e) = worker.await {
        error!("Audit retry worker failed: {}", e);
    }

    let dead = recorder.retry_handle().dead_letters();
    if !dead.is_empty() {
        error!(target: "audit_alert", "{} audit records were never written", dead.len());
    }

    Ok(())
}

async fn expiry_sweep(engine: SchedulingEngine<SqliteStore>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.expire_pending(Utc::now()).await {
                    error!("Expiry sweep failed: {}", e);
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
