//! # Streaming Speech-to-Text Backend
//!
//! HTTP/WebSocket server for speech recognition:
//! - `GET /ws/transcribe` — real-time streaming transcription over WebSocket
//! - `POST /transcribe` — one-shot transcription of an uploaded file or URL
//! - `GET /health`, `/api/v1/metrics`, `/api/v1/config` — ops surface
//!
//! ## Architecture:
//! - **config**: layered configuration (defaults, config.toml, env)
//! - **state**: shared configuration handle and service counters
//! - **audio**: the streaming core — buffer, chunk policy, VAD, FFmpeg
//!   decode pipeline, per-connection sessions
//! - **transcription**: Whisper recognition behind a capability trait
//! - **websocket**: the connection-facing protocol handler
//! - **handlers**/**middleware**/**health**: HTTP plumbing

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;
mod websocket;

use crate::config::AppConfig;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use candle_core::Device;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{Transcriber, WhisperTranscriber};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting stt-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Model: {}, limits: {}MB / {}s",
        config.models.model_size, config.limits.max_file_mb, config.limits.max_duration_sec
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // One recognizer for the whole process; engines are created lazily per
    // model size inside.
    let transcriber: Arc<dyn Transcriber> = Arc::new(WhisperTranscriber::new(Device::Cpu));
    let transcriber_data = web::Data::from(transcriber);

    info!("Binding HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(transcriber_data.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestMetrics)
            .wrap(middleware::RequestLog)
            .route("/transcribe", web::post().to(handlers::transcribe))
            .route("/ws/transcribe", web::get().to(websocket::ws_transcribe))
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stt_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
