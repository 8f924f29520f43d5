use crate::{
    db,
    error::AppError,
    geo,
    models::normalize_destination,
    recorder::{self, RequestMeta},
    AppState,
};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use chrono::Utc;
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinHandle;

/// A successful resolution: where to send the visitor, plus the background
/// task recording the visit.
pub struct Resolved {
    pub target: String,
    pub recording: JoinHandle<()>,
}

/// GET /:code
///
/// 307 to the link's destination, or a plain 404 for anything else. Missing,
/// inactive and erroring lookups are indistinguishable to the visitor.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let meta = RequestMeta::from_headers(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    match resolve(&state, &code, meta).await {
        Ok(resolved) => Redirect::temporary(&resolved.target).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Short link not found").into_response(),
    }
}

/// Resolve a short code for a visitor.
///
/// 1. Check the in-memory cache (active links only), falling back to the store.
/// 2. Inactive or missing links resolve to `NotFound`; so do storage errors.
/// 3. Spawn the visit recording (geolocation + store write) so the redirect
///    never waits on it and a client disconnect cannot cancel it.
/// 4. Return the destination with an `https://` prefix if it has no scheme.
pub async fn resolve(
    state: &Arc<AppState>,
    code: &str,
    meta: RequestMeta,
) -> Result<Resolved, AppError> {
    let seen = state.cache.generation();
    let destination = match state.cache.get(code) {
        Some(url) => url,
        None => match db::find_by_short_code(&state.db, code).await {
            Ok(Some(link)) if link.is_active => {
                state.cache.fill(seen, &link.short_code, &link.destination_url);
                link.destination_url
            }
            Ok(Some(_)) => {
                tracing::debug!("Short code '{}' is inactive", code);
                return Err(AppError::NotFound);
            }
            Ok(None) => return Err(AppError::NotFound),
            Err(e) => {
                tracing::error!("DB error looking up short code '{}': {:?}", code, e);
                return Err(AppError::NotFound);
            }
        },
    };

    let visited_at = Utc::now();
    let state_bg = state.clone();
    let code_bg = code.to_owned();

    let recording = tokio::spawn(async move {
        let country = geo::resolve_country(
            state_bg.geo.as_ref(),
            meta.ip.as_deref(),
            state_bg.config.geo_timeout,
        )
        .await;
        let event = meta.into_event(country, visited_at);
        recorder::record_visit(&state_bg.db, &code_bg, event).await;
    });

    Ok(Resolved {
        target: normalize_destination(&destination),
        recording,
    })
}
