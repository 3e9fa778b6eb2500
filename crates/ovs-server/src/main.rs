//! ovs-server entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads settings,
//! builds the shared state, wires middleware, and starts the HTTP server.
//! All route handlers live under `routes/`; shared state lives in `state.rs`.

use std::net::SocketAddr;

use anyhow::Context;
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use ovs_config::Settings;
use ovs_server::{routes, state::AppState, trace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = Settings::from_env().context("load settings")?;
    let pool = ovs_db::connect(&settings.database_url).await?;
    ovs_db::migrate(&pool).await?;

    let cors = cors_from_settings(&settings);
    let state = AppState::new(pool, settings);

    let app = routes::build_router(state)
        .layer(axum::middleware::from_fn(trace::trace_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8088)));
    info!("ovs-server listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("BIND_ADDR").ok()?.parse().ok()
}

fn cors_from_settings(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
