use std::{net::SocketAddr, sync::Arc};

use axum::{
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod cache;
mod config;
mod db;
mod error;
mod geo;
mod handlers;
mod lifecycle;
mod models;
mod recorder;

#[cfg(test)]
mod test_support;

use auth::{AdminCredential, SessionStore};
use cache::LinkCache;
use geo::{GeoLocator, IpApiLocator};

// ── Shared application state ───────────────────────────────────────────────

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: config::AppConfig,
    pub cache: LinkCache,
    pub sessions: SessionStore,
    pub admin: AdminCredential,
    pub geo: Arc<dyn GeoLocator>,
}

// ── Router ─────────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Root redirect
        .route("/", get(handlers::admin::index))
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        // Management API (AuthUser-gated per handler)
        .route(
            "/links",
            get(handlers::admin::list_links).post(handlers::admin::create_link),
        )
        .route(
            "/links/:id",
            get(handlers::admin::get_link)
                .put(handlers::admin::edit_link)
                .delete(handlers::admin::delete_link),
        )
        .route("/links/:id/restore", post(handlers::admin::restore_link))
        .route("/links/:id/active", put(handlers::admin::set_active))
        .route("/links/:id/analytics", get(handlers::admin::analytics))
        // Short-link redirect; static routes above take priority
        .route("/:code", get(handlers::redirect::redirect))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env; the file is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linktrail=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::AppConfig::from_env()?;
    tracing::info!("Starting linktrail on {}:{}", config.host, config.port);
    tracing::info!("Base URL: {}", config.base_url);

    let db = db::connect(&config.database_url).await?;
    tracing::info!("Database migrations applied");

    let cache = LinkCache::new();
    db::warm_cache(&db, &cache).await?;

    let geo: Arc<dyn GeoLocator> =
        Arc::new(IpApiLocator::new(&config.geo_api_url, config.geo_timeout)?);

    let state = Arc::new(AppState {
        db,
        sessions: SessionStore::new(config.session_duration_hours),
        admin: AdminCredential::from_password(&config.admin_password)?,
        cache,
        geo,
        config,
    });

    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
