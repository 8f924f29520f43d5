//! Shared fixtures for the in-crate tests.

use crate::{
    auth::{AdminCredential, SessionStore},
    cache::LinkCache,
    config::AppConfig,
    db,
    geo::GeoLocator,
    models::{Link, NewLink},
    AppState,
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

pub const ADMIN_PASSWORD: &str = "correct horse";
pub const BASE_URL: &str = "http://sho.rt";
pub const STUB_COUNTRY: &str = "Testland";

/// Answers every lookup with [`STUB_COUNTRY`] without touching the network.
pub struct StubLocator;

#[async_trait]
impl GeoLocator for StubLocator {
    async fn country(&self, _ip: &str) -> Option<String> {
        Some(STUB_COUNTRY.to_owned())
    }
}

/// A migrated, file-backed database. Keep the `TempDir` alive for the
/// duration of the test.
pub async fn pool() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = db::connect(&url).await.expect("connect test database");
    (dir, pool)
}

pub async fn state() -> (TempDir, Arc<AppState>) {
    let (dir, db) = pool().await;

    let config = AppConfig {
        database_url: String::new(),
        admin_password: ADMIN_PASSWORD.into(),
        host: "127.0.0.1".into(),
        port: 0,
        base_url: BASE_URL.into(),
        session_duration_hours: 1,
        root_redirect_url: "https://example.com".into(),
        geo_api_url: String::new(),
        geo_timeout: Duration::from_millis(200),
    };

    let state = Arc::new(AppState {
        db,
        sessions: SessionStore::new(config.session_duration_hours),
        admin: AdminCredential::from_password(ADMIN_PASSWORD).expect("hash password"),
        cache: LinkCache::new(),
        geo: Arc::new(StubLocator),
        config,
    });
    (dir, state)
}

/// Insert an active link with no dates.
pub async fn insert(pool: &SqlitePool, short_code: &str, destination_url: &str) -> Link {
    db::create_link(
        pool,
        &NewLink {
            short_code: short_code.into(),
            destination_url: destination_url.into(),
            is_active: true,
            expiration_date: None,
            scheduled_date: None,
        },
    )
    .await
    .expect("insert link")
}
