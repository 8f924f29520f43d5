use chrono::{DateTime, Utc};
use serde::Serialize;

/// Most recent visit events retained per link.
pub const MAX_RECENT_VISITS: usize = 100;

/// A short link with its lifecycle state and embedded access analytics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: i64,
    pub short_code: String,
    pub destination_url: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accesses: Accesses,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accesses {
    pub count: i64,
    /// Oldest first, at most [`MAX_RECENT_VISITS`] entries.
    pub last_accessed: Vec<VisitEvent>,
}

/// One recorded redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitEvent {
    pub date: DateTime<Utc>,
    pub user_agent: String,
    pub referrer: String,
    pub country: String,
}

/// The URL a visitor is sent to. Bare hosts get an `https://` prefix; the
/// stored value is left as is.
pub fn normalize_destination(url: &str) -> String {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        url.to_owned()
    } else {
        format!("https://{url}")
    }
}

// ── Storage rows ───────────────────────────────────────────────────────────

/// A row from the `links` table, before visit events are attached.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LinkRow {
    pub id: i64,
    pub short_code: String,
    pub destination_url: String,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row from the `link_visits` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VisitRow {
    pub link_id: i64,
    pub visited_at: DateTime<Utc>,
    pub user_agent: String,
    pub referrer: String,
    pub country: String,
}

impl LinkRow {
    pub fn into_link(self, last_accessed: Vec<VisitEvent>) -> Link {
        Link {
            id: self.id,
            short_code: self.short_code,
            destination_url: self.destination_url,
            is_active: self.is_active,
            is_deleted: self.deleted_at.is_some(),
            deleted_at: self.deleted_at,
            expiration_date: self.expiration_date,
            scheduled_date: self.scheduled_date,
            created_at: self.created_at,
            updated_at: self.updated_at,
            accesses: Accesses {
                count: self.access_count,
                last_accessed,
            },
        }
    }
}

impl From<VisitRow> for VisitEvent {
    fn from(row: VisitRow) -> Self {
        Self {
            date: row.visited_at,
            user_agent: row.user_agent,
            referrer: row.referrer,
            country: row.country,
        }
    }
}

// ── Write inputs ───────────────────────────────────────────────────────────

/// Fields for a brand new link.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub short_code: String,
    pub destination_url: String,
    pub is_active: bool,
    pub expiration_date: Option<DateTime<Utc>>,
    pub scheduled_date: Option<DateTime<Utc>>,
}

/// Partial update. `None` leaves a column untouched; for nullable columns
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct LinkUpdate {
    pub short_code: Option<String>,
    pub destination_url: Option<String>,
    pub is_active: Option<bool>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    pub expiration_date: Option<Option<DateTime<Utc>>>,
    pub scheduled_date: Option<Option<DateTime<Utc>>>,
}

// ── Listing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
pub enum SortOrder {
    #[serde(rename = "dateAsc")]
    DateAsc,
    #[default]
    #[serde(rename = "dateDesc")]
    DateDesc,
    #[serde(rename = "clicksAsc")]
    ClicksAsc,
    #[serde(rename = "clicksDesc")]
    ClicksDesc,
    /// Only links whose destination is shared with another record, fewest
    /// sharers first.
    #[serde(rename = "duplicateAsc")]
    DuplicateAsc,
}

impl SortOrder {
    pub fn order_by(self) -> &'static str {
        match self {
            SortOrder::DateAsc => "created_at ASC, id ASC",
            SortOrder::DateDesc => "created_at DESC, id DESC",
            SortOrder::ClicksAsc => "access_count ASC, id ASC",
            SortOrder::ClicksDesc => "access_count DESC, id DESC",
            SortOrder::DuplicateAsc => {
                "(SELECT COUNT(*) FROM links d WHERE d.destination_url = links.destination_url) ASC, \
                 created_at ASC, id ASC"
            }
        }
    }
}

/// Dashboard listing filter. `deleted: None` returns records in any state.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub deleted: Option<bool>,
    /// Case-insensitive substring of the short code or the destination.
    pub search: Option<String>,
    pub sort: SortOrder,
}

/// A link as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkListing {
    #[serde(flatten)]
    pub link: Link,
    pub short_url: String,
    /// Number of stored records (this one included) pointing at the same
    /// destination.
    pub duplicate_count: usize,
}

// ── Analytics ──────────────────────────────────────────────────────────────

/// One row of a breakdown table: value, hits, percentage of retained events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakdown {
    pub name: String,
    pub count: i64,
    pub pct: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub id: i64,
    pub short_code: String,
    pub short_url: String,
    pub total_clicks: i64,
    pub retained_events: usize,
    pub top_countries: Vec<Breakdown>,
    pub top_referrers: Vec<Breakdown>,
    pub top_browsers: Vec<Breakdown>,
    pub top_os: Vec<Breakdown>,
}
