use crate::{
    auth::AuthUser,
    db,
    error::AppError,
    lifecycle::{self, CreateLink, EditLink},
    models::{AnalyticsSummary, Breakdown, Link, LinkListing, ListFilter, SortOrder},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use woothee::parser::Parser;

/// Upper bound for `?recent=`.
const MAX_RECENT: u32 = 100;

// ── Query / body types ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    recent: Option<u32>,
    sort: Option<SortOrder>,
    deleted: Option<bool>,
    search: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    permanent: Option<String>,
    action: Option<String>,
}

impl DeleteParams {
    /// `?permanent`, `?permanent=true` and `?action=permanent` all ask for a hard delete.
    fn is_permanent(&self) -> bool {
        let flag = matches!(self.permanent.as_deref(), Some(v) if v != "false" && v != "0");
        flag || self.action.as_deref() == Some("permanent")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRequest {
    is_active: bool,
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// GET /
/// Redirect root visitors to the configured ROOT_REDIRECT_URL.
pub async fn index(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::to(&state.config.root_redirect_url)
}

/// GET /links
/// GET /links?recent=10
/// GET /links?sort=duplicateAsc&search=promo&deleted=false
pub async fn list_links(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<LinkListing>>, AppError> {
    let links = match params.recent {
        Some(n) => db::recently_visited(&state.db, n.min(MAX_RECENT)).await?,
        None => {
            let filter = ListFilter {
                deleted: params.deleted,
                search: params.search,
                sort: params.sort.unwrap_or_default(),
            };
            db::list_links(&state.db, &filter).await?
        }
    };

    let counts = db::destination_counts(&state.db).await?;
    Ok(Json(to_listings(links, &state.config.base_url, &counts)))
}

/// POST /links
pub async fn create_link(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateLink>,
) -> Result<Response, AppError> {
    let link = lifecycle::create(&state.db, req).await?;
    if link.is_active {
        state.cache.set(&link.short_code, &link.destination_url);
    }

    // Already stored, so a failed count is not an error.
    let duplicates = best_effort_count(
        db::count_by_destination(&state.db, &link.destination_url).await,
    );
    let listing = listing(link, &state.config.base_url, duplicates);
    Ok((StatusCode::CREATED, Json(listing)).into_response())
}

/// GET /links/:id
pub async fn get_link(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<LinkListing>, AppError> {
    let link = db::find_by_id(&state.db, id)
        .await?
        .ok_or(AppError::NotFound)?;

    let duplicates = db::count_by_destination(&state.db, &link.destination_url).await?;

    Ok(Json(listing(link, &state.config.base_url, duplicates)))
}

/// PUT /links/:id
pub async fn edit_link(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<EditLink>,
) -> Result<Json<serde_json::Value>, AppError> {
    let edited = lifecycle::edit(&state.db, id, req).await?;
    state.cache.refresh(&edited.previous_short_code, &edited.link);

    Ok(Json(json!({ "message": "URL updated successfully" })))
}

/// PUT /links/:id/active
pub async fn set_active(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let link = lifecycle::set_active(&state.db, id, req.is_active).await?;
    state.cache.refresh(&link.short_code, &link);

    let message = if link.is_active {
        "URL activated"
    } else {
        "URL deactivated"
    };
    Ok(Json(json!({ "message": message })))
}

/// DELETE /links/:id            soft delete
/// DELETE /links/:id?permanent  hard delete
pub async fn delete_link(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    if params.is_permanent() {
        let removed = lifecycle::permanent_delete(&state.db, id).await?;
        state.cache.remove(&removed.short_code);
        return Ok(Json(json!({ "message": "URL permanently deleted" })));
    }

    lifecycle::soft_delete(&state.db, id).await?;
    Ok(Json(json!({ "message": "URL deleted successfully" })))
}

/// POST /links/:id/restore
pub async fn restore_link(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    lifecycle::restore(&state.db, id).await?;
    Ok(Json(json!({ "message": "URL restored successfully" })))
}

/// GET /links/:id/analytics
pub async fn analytics(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<AnalyticsSummary>, AppError> {
    let link = db::find_by_id(&state.db, id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(summarize(&link, &state.config.base_url)))
}

// ── Private helpers ────────────────────────────────────────────────────────

fn listing(link: Link, base_url: &str, duplicate_count: usize) -> LinkListing {
    LinkListing {
        short_url: format!("{}/{}", base_url, link.short_code),
        duplicate_count,
        link,
    }
}

/// Attach the short URL and the store-wide duplicate count.
fn to_listings(
    links: Vec<Link>,
    base_url: &str,
    counts: &HashMap<String, usize>,
) -> Vec<LinkListing> {
    links
        .into_iter()
        .map(|link| {
            let duplicates = counts.get(&link.destination_url).copied().unwrap_or(1);
            listing(link, base_url, duplicates)
        })
        .collect()
}

/// A newly created link shares its destination with at least itself.
fn best_effort_count(count: Result<usize, sqlx::Error>) -> usize {
    count.unwrap_or_else(|e| {
        tracing::warn!("Could not count links sharing a destination: {:?}", e);
        1
    })
}

fn summarize(link: &Link, base_url: &str) -> AnalyticsSummary {
    let events = &link.accesses.last_accessed;
    let total = events.len() as i64;

    let parser = Parser::new();
    let parsed: Vec<(Option<String>, Option<String>)> = events
        .iter()
        .map(|e| match parser.parse(&e.user_agent) {
            Some(r) => (known(r.name), known(r.os)),
            None => (None, None),
        })
        .collect();

    AnalyticsSummary {
        id: link.id,
        short_code: link.short_code.clone(),
        short_url: format!("{}/{}", base_url, link.short_code),
        total_clicks: link.accesses.count,
        retained_events: events.len(),
        top_countries: with_pct(
            count_field(events.iter().map(|e| Some(e.country.as_str()))),
            total,
        ),
        top_referrers: with_pct(
            count_field(events.iter().map(|e| Some(e.referrer.as_str()))),
            total,
        ),
        top_browsers: with_pct(
            count_field(parsed.iter().map(|(browser, _)| browser.as_deref())),
            total,
        ),
        top_os: with_pct(count_field(parsed.iter().map(|(_, os)| os.as_deref())), total),
    }
}

fn known(value: &str) -> Option<String> {
    if value.is_empty() || value == "UNKNOWN" {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Tally occurrences of each non-None value, sort descending by count, and
/// return the top 10.
fn count_field<'a>(iter: impl Iterator<Item = Option<&'a str>>) -> Vec<(String, i64)> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for val in iter.flatten() {
        if !val.is_empty() {
            *counts.entry(val.to_owned()).or_insert(0) += 1;
        }
    }
    let mut sorted: Vec<(String, i64)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(10);
    sorted
}

/// Attach a percentage-of-total column to each breakdown row.
fn with_pct(items: Vec<(String, i64)>, total: i64) -> Vec<Breakdown> {
    items
        .into_iter()
        .map(|(name, count)| {
            let pct = if total > 0 { count * 100 / total } else { 0 };
            Breakdown { name, count, pct }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::VisitEvent, test_support};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request},
        Router,
    };
    use chrono::{Duration, Utc};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn send(app: &Router, method: Method, uri: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
        let req = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn requests_without_session_are_rejected() {
        let (_dir, state) = test_support::state().await;
        let app = crate::build_router(state);

        let (status, body) = send(&app, Method::GET, "/links", "not-a-session", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Unauthorized");
    }

    #[tokio::test]
    async fn login_issues_usable_token() {
        let (_dir, state) = test_support::state().await;
        let app = crate::build_router(state);

        let (status, body) = send(
            &app,
            Method::POST,
            "/auth/login",
            "",
            Some(json!({ "password": test_support::ADMIN_PASSWORD })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_owned();

        let (status, _) = send(&app, Method::GET, "/links", &token, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_logout_revokes_token() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let app = crate::build_router(state.clone());

        let (status, _) = send(&app, Method::GET, "/links", &token, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, Method::POST, "/auth/logout", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!state.sessions.is_valid(&token).await);

        let (status, _) = send(&app, Method::GET, "/links", &token, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cookie_logout_revokes_session() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let app = crate::build_router(state.clone());

        let req = Request::post("/auth/logout")
            .header(header::COOKIE, format!("session_id={token}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!state.sessions.is_valid(&token).await);
    }

    #[tokio::test]
    async fn listing_supports_search_and_duplicate_sort() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        test_support::insert(&state.db, "spring-sale", "example.com/sale").await;
        test_support::insert(&state.db, "sale2", "example.com/sale").await;
        test_support::insert(&state.db, "blog", "example.org/Sale-Notes").await;
        test_support::insert(&state.db, "about", "example.net").await;
        let app = crate::build_router(state);

        let codes = |list: &Value| -> Vec<String> {
            list.as_array()
                .unwrap()
                .iter()
                .map(|l| l["shortCode"].as_str().unwrap().to_owned())
                .collect()
        };

        let (status, list) = send(&app, Method::GET, "/links?search=SALE&sort=dateAsc", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(codes(&list), vec!["spring-sale", "sale2", "blog"]);

        let (status, list) = send(&app, Method::GET, "/links?sort=duplicateAsc", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(codes(&list), vec!["spring-sale", "sale2"]);
        assert!(list.as_array().unwrap().iter().all(|l| l["duplicateCount"] == 2));

        let (_, list) = send(&app, Method::GET, "/links?search=blog", &token, None).await;
        assert_eq!(list[0]["duplicateCount"], 1);
    }

    #[tokio::test]
    async fn create_list_and_fetch() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let app = crate::build_router(state.clone());

        let (status, created) = send(
            &app,
            Method::POST,
            "/links",
            &token,
            Some(json!({ "destinationUrl": "example.com", "shortCode": "ex" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["shortCode"], "ex");
        assert_eq!(created["shortUrl"], format!("{}/ex", test_support::BASE_URL));
        assert_eq!(created["accesses"]["count"], 0);
        assert_eq!(created["isDeleted"], false);
        assert_eq!(state.cache.get("ex").as_deref(), Some("example.com"));

        send(
            &app,
            Method::POST,
            "/links",
            &token,
            Some(json!({ "destinationUrl": "example.com", "shortCode": "ex2" })),
        )
        .await;

        let (status, list) = send(&app, Method::GET, "/links", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|l| l["duplicateCount"] == 2));

        let id = created["id"].as_i64().unwrap();
        let (status, one) = send(&app, Method::GET, &format!("/links/{id}"), &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one["destinationUrl"], "example.com");

        let (status, _) = send(&app, Method::GET, "/links/9999", &token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn edit_maps_errors_to_statuses() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let a = test_support::insert(&state.db, "a", "example.com").await;
        test_support::insert(&state.db, "b", "example.com").await;
        state.cache.set("a", "example.com");
        let app = crate::build_router(state.clone());
        let uri = format!("/links/{}", a.id);

        let (status, body) = send(&app, Method::PUT, &uri, &token, Some(json!({ "shortCode": "b" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Shortened URL must be unique");

        let (status, _) = send(&app, Method::PUT, &uri, &token, Some(json!({ "shortCode": 7 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::PUT, "/links/999", &token, Some(json!({ "shortCode": "z" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            Method::PUT,
            &uri,
            &token,
            Some(json!({ "shortCode": "renamed", "expirationDate": "2030-01-01" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "URL updated successfully");
        assert!(state.cache.get("a").is_none());
        assert_eq!(state.cache.get("renamed").as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn delete_and_restore_flow() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let link = test_support::insert(&state.db, "d", "example.com").await;
        let app = crate::build_router(state.clone());
        let uri = format!("/links/{}", link.id);

        let (status, _) = send(&app, Method::DELETE, &uri, &token, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, Method::DELETE, &uri, &token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "URL has already been deleted");

        let (status, _) = send(&app, Method::POST, &format!("{uri}/restore"), &token, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::POST, &format!("{uri}/restore"), &token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, Method::DELETE, &format!("{uri}?permanent"), &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "URL permanently deleted");
        assert!(db::find_by_id(&state.db, link.id).await.unwrap().is_none());

        let (status, _) = send(&app, Method::DELETE, &format!("{uri}?permanent"), &token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::POST, &format!("{uri}/restore"), &token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deactivation_stops_redirects() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let link = test_support::insert(&state.db, "pause", "example.com").await;
        state.cache.set("pause", "example.com");
        let app = crate::build_router(state.clone());

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("/links/{}/active", link.id),
            &token,
            Some(json!({ "isActive": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.cache.get("pause").is_none());

        let resp = app
            .oneshot(Request::get("/pause").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recent_lists_visited_links_newest_first() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        test_support::insert(&state.db, "idle", "example.com").await;
        let old = test_support::insert(&state.db, "old", "example.com").await;
        let new = test_support::insert(&state.db, "new", "example.com").await;

        let visit = |minutes_ago: i64| VisitEvent {
            date: Utc::now() - Duration::minutes(minutes_ago),
            user_agent: "Unknown".into(),
            referrer: "Direct".into(),
            country: "Unknown".into(),
        };
        db::increment_and_append_access(&state.db, "old", &visit(30)).await.unwrap();
        db::increment_and_append_access(&state.db, "new", &visit(1)).await.unwrap();

        let app = crate::build_router(state);
        let (status, list) = send(&app, Method::GET, "/links?recent=10", &token, None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<i64> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![new.id, old.id]);
    }

    #[tokio::test]
    async fn analytics_breaks_down_retained_events() {
        let (_dir, state) = test_support::state().await;
        let token = state.sessions.create().await;
        let link = test_support::insert(&state.db, "stats", "example.com").await;

        let chrome = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                      (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        for (country, referrer) in [("Japan", "Direct"), ("Japan", "https://t.co"), ("Peru", "Direct")] {
            let event = VisitEvent {
                date: Utc::now(),
                user_agent: chrome.into(),
                referrer: referrer.into(),
                country: country.into(),
            };
            db::increment_and_append_access(&state.db, "stats", &event).await.unwrap();
        }

        let app = crate::build_router(state);
        let (status, body) = send(&app, Method::GET, &format!("/links/{}/analytics", link.id), &token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalClicks"], 3);
        assert_eq!(body["topCountries"][0]["name"], "Japan");
        assert_eq!(body["topCountries"][0]["count"], 2);
        assert_eq!(body["topCountries"][0]["pct"], 66);
        assert_eq!(body["topReferrers"][0]["name"], "Direct");
        assert_eq!(body["topBrowsers"][0]["name"], "Chrome");
        assert_eq!(body["topBrowsers"][0]["count"], 3);
    }

    #[test]
    fn permanent_flag_forms() {
        let p = |permanent: Option<&str>, action: Option<&str>| DeleteParams {
            permanent: permanent.map(str::to_owned),
            action: action.map(str::to_owned),
        };
        assert!(p(Some(""), None).is_permanent());
        assert!(p(Some("true"), None).is_permanent());
        assert!(p(None, Some("permanent")).is_permanent());
        assert!(!p(Some("false"), None).is_permanent());
        assert!(!p(None, None).is_permanent());
    }

    #[test]
    fn failed_duplicate_count_defaults_to_one() {
        assert_eq!(best_effort_count(Ok(3)), 3);
        assert_eq!(best_effort_count(Err(sqlx::Error::PoolClosed)), 1);
    }

    #[test]
    fn breakdown_percentages() {
        let rows = with_pct(
            count_field(["a", "b", "a", "a"].into_iter().map(Some)),
            4,
        );
        assert_eq!(rows[0], Breakdown { name: "a".into(), count: 3, pct: 75 });
        assert_eq!(rows[1], Breakdown { name: "b".into(), count: 1, pct: 25 });
    }
}
