//! # Voice Relay Backend - Main Application Entry Point
//!
//! An Actix-web server relaying voice conversations: audio in over a
//! WebSocket, speech-to-text, a conversational reply engine, text-to-speech,
//! and synthesized audio back out, with ordered progress events throughout.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (TOML file + environment variables)
//! - **state**: Shared application state and metrics
//! - **pipeline**: Stage timing and transcript normalization
//! - **providers**: STT/Reply/TTS adapter chains over external services
//! - **session**: The per-connection pipeline coordinator
//! - **websocket**: The transport boundary (frames, close codes)
//! - **handlers**: Stateless companion endpoints (chat, token, config, debug)
//! - **health / middleware / error**: Observability and HTTP error mapping

mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod pipeline;    // Stage timing + normalization (pipeline/ directory)
mod providers;   // Provider adapter chains (providers/ directory)
mod session;     // Session coordinator (session/ directory)
mod state;       // Application state management (state.rs)
mod websocket;   // WebSocket transport boundary (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handlers and polled by main.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (stt={}, tts={}, reply={:?})",
        config.server.host,
        config.server.port,
        config.active_stt_backend(),
        config.active_tts_backend(),
        config.reply_variants(),
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Permissive CORS for browser-based development clients
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/chat", web::post().to(handlers::chat))
                    .route("/token", web::post().to(handlers::issue_token)),
            )
            .configure(handlers::configure_debug_routes)
            // Root-level aliases kept for existing clients
            .route("/health", web::get().to(health::health_check))
            .route("/chat", web::post().to(handlers::chat))
            .route("/config", web::get().to(handlers::get_config))
            // The voice pipeline itself
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .route(
                "/ws/audio-stream",
                web::get().to(websocket::audio_stream_websocket),
            )
            .default_service(web::route().to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Run until the server dies or a shutdown signal arrives
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls the filter; the default keeps the relay chatty and
/// the framework quiet.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag without busy-waiting.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
