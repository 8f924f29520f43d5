//! Best-effort visit recording.
//!
//! Builds a [`VisitEvent`] from request metadata and hands it to the store.
//! Failures are logged and swallowed; they never reach the visitor.

use crate::{db, models::VisitEvent};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::net::SocketAddr;

pub const DEFAULT_USER_AGENT: &str = "Unknown";
pub const DEFAULT_REFERRER: &str = "Direct";

/// Raw visitor metadata pulled off an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

impl RequestMeta {
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        Self {
            ip: client_ip(headers, peer),
            user_agent: header_value(headers, "user-agent"),
            referrer: header_value(headers, "referer"),
        }
    }

    /// Assemble the event for a visit at `date`, applying the defaults for
    /// absent headers.
    pub fn into_event(self, country: String, date: DateTime<Utc>) -> VisitEvent {
        VisitEvent {
            date,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned()),
            referrer: self.referrer.unwrap_or_else(|| DEFAULT_REFERRER.to_owned()),
            country,
        }
    }
}

/// Count the visit and append its event. Errors are logged, not returned.
pub async fn record_visit(pool: &SqlitePool, short_code: &str, event: VisitEvent) {
    if let Err(e) = db::increment_and_append_access(pool, short_code, &event).await {
        tracing::error!("Failed to record visit for '{}': {}", short_code, e);
    }
}

/// Determine the real client IP, preferring common proxy headers.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    // X-Forwarded-For can be a comma-separated list; take the first entry.
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_owned());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return Some(real_ip.to_owned());
        }
    }

    peer.map(|addr| addr.ip().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}
