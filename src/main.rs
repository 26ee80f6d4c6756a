mod config;
mod converters;
mod error;
mod handlers;
mod paths;
mod registry;
mod sanity;

use anyhow::Context;
use handlers::AppState;
use paths::Paths;
use registry::ConverterRegistry;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webpmill=info,tower_http=info".into()),
        )
        .init();

    let paths = Paths::from_env()?;
    info!("document root: {}", paths.doc_root().display());
    info!("content dir:   {}", paths.content_dir().display());
    info!("uploads dir:   {}", paths.upload_dir().display());

    // Probe the converter backends once at startup
    let registry = ConverterRegistry::new().await;

    let nonce_secret = std::env::var("WEBPMILL_NONCE_SECRET").unwrap_or_else(|_| {
        warn!("WEBPMILL_NONCE_SECRET is not set, using an insecure development secret");
        "webpmill-dev-secret".to_string()
    });

    let state = Arc::new(AppState {
        paths,
        registry,
        nonce_secret,
    });

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = handlers::app(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start the server
    let addr = std::env::var("WEBPMILL_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("🚀 webpmill server running on http://{}", addr);
    info!("📖 API documentation: http://{}/info", addr);
    info!("🔄 Convert files: POST http://{}/convert", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
