use crate::{
    cache::LinkCache,
    error::AppError,
    models::{
        Link, LinkRow, LinkUpdate, ListFilter, NewLink, SortOrder, VisitEvent, VisitRow,
        MAX_RECENT_VISITS,
    },
};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqlitePool,
};
use std::{collections::HashMap, time::Duration};

const LINK_COLUMNS: &str = "id, short_code, destination_url, is_active, deleted_at, \
     expiration_date, scheduled_date, access_count, created_at, updated_at";

// ── Setup ──────────────────────────────────────────────────────────────────

/// Open the SQLite pool (creating the file if needed) and apply migrations.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        // Concurrent visit recording queues on the write lock instead of failing.
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Load every active link into the in-memory cache at startup.
pub async fn warm_cache(pool: &SqlitePool, cache: &LinkCache) -> anyhow::Result<()> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT short_code, destination_url FROM links WHERE is_active = 1")
            .fetch_all(pool)
            .await?;

    let count = rows.len();
    for (short_code, destination_url) in rows {
        cache.set(short_code, destination_url);
    }

    tracing::info!("Cache warmed with {} active link(s)", count);
    Ok(())
}

// ── Lookups ────────────────────────────────────────────────────────────────

/// Fetch a link by its short code, in any lifecycle state.
pub async fn find_by_short_code(
    pool: &SqlitePool,
    short_code: &str,
) -> Result<Option<Link>, sqlx::Error> {
    let row: Option<LinkRow> = sqlx::query_as(&format!(
        "SELECT {LINK_COLUMNS} FROM links WHERE short_code = ?1"
    ))
    .bind(short_code)
    .fetch_optional(pool)
    .await?;

    attach_single(pool, row).await
}

/// Fetch a link by its primary key, in any lifecycle state.
pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Link>, sqlx::Error> {
    let row: Option<LinkRow> =
        sqlx::query_as(&format!("SELECT {LINK_COLUMNS} FROM links WHERE id = ?1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;

    attach_single(pool, row).await
}

/// Correlated count of records sharing the outer row's destination.
const SHARED_DESTINATIONS: &str =
    "(SELECT COUNT(*) FROM links d WHERE d.destination_url = links.destination_url)";

/// Dashboard listing.
pub async fn list_links(pool: &SqlitePool, filter: &ListFilter) -> Result<Vec<Link>, sqlx::Error> {
    let mut query: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {LINK_COLUMNS} FROM links"));
    push_filter(&mut query, filter);
    query.push(" ORDER BY ").push(filter.sort.order_by());
    let rows: Vec<LinkRow> = query.build_query_as().fetch_all(pool).await?;

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT link_id, visited_at, user_agent, referrer, country
         FROM link_visits
         WHERE link_id IN (SELECT id FROM links",
    );
    push_filter(&mut query, filter);
    query.push(") ORDER BY link_id, id");
    let visits: Vec<VisitRow> = query.build_query_as().fetch_all(pool).await?;

    Ok(attach_visits(rows, visits))
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &ListFilter) {
    query.push(" WHERE 1 = 1");

    match filter.deleted {
        Some(true) => {
            query.push(" AND deleted_at IS NOT NULL");
        }
        Some(false) => {
            query.push(" AND deleted_at IS NULL");
        }
        None => {}
    }

    if let Some(term) = filter.search.as_deref().filter(|t| !t.is_empty()) {
        query
            .push(" AND (instr(lower(short_code), lower(")
            .push_bind(term.to_owned())
            .push(")) > 0 OR instr(lower(destination_url), lower(")
            .push_bind(term.to_owned())
            .push(")) > 0)");
    }

    if filter.sort == SortOrder::DuplicateAsc {
        query.push(format!(" AND {SHARED_DESTINATIONS} > 1"));
    }
}

/// The `limit` links with the most recent visit, newest visit first.
/// Links that were never visited are left out.
pub async fn recently_visited(pool: &SqlitePool, limit: u32) -> Result<Vec<Link>, sqlx::Error> {
    let rows: Vec<LinkRow> = sqlx::query_as(&format!(
        "SELECT {LINK_COLUMNS}
         FROM links l
         JOIN (SELECT link_id, MAX(visited_at) AS last_visit
               FROM link_visits GROUP BY link_id) v ON v.link_id = l.id
         ORDER BY v.last_visit DESC, l.id DESC
         LIMIT ?1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT link_id, visited_at, user_agent, referrer, country
         FROM link_visits WHERE link_id IN (",
    );
    let mut ids = query.separated(", ");
    for row in &rows {
        ids.push_bind(row.id);
    }
    ids.push_unseparated(") ORDER BY link_id, id");

    let visits: Vec<VisitRow> = query.build_query_as().fetch_all(pool).await?;
    Ok(attach_visits(rows, visits))
}

/// Number of stored links pointing at `destination_url`.
pub async fn count_by_destination(
    pool: &SqlitePool,
    destination_url: &str,
) -> Result<usize, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM links WHERE destination_url = ?1")
        .bind(destination_url)
        .fetch_one(pool)
        .await?;

    Ok(count as usize)
}

/// Destination URL -> number of stored links pointing at it.
pub async fn destination_counts(pool: &SqlitePool) -> Result<HashMap<String, usize>, sqlx::Error> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT destination_url, COUNT(*) FROM links GROUP BY destination_url")
            .fetch_all(pool)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(url, count)| (url, count as usize))
        .collect())
}

// ── Writes ─────────────────────────────────────────────────────────────────

/// Insert a new link. Fails with `DuplicateKey` if the short code is taken.
pub async fn create_link(pool: &SqlitePool, link: &NewLink) -> Result<Link, AppError> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO links
             (short_code, destination_url, is_active, expiration_date, scheduled_date,
              created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
    )
    .bind(&link.short_code)
    .bind(&link.destination_url)
    .bind(link.is_active)
    .bind(link.expiration_date)
    .bind(link.scheduled_date)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    find_by_id(pool, id).await?.ok_or(AppError::NotFound)
}

/// Apply a partial update and return the updated record.
pub async fn update_link(
    pool: &SqlitePool,
    id: i64,
    update: &LinkUpdate,
) -> Result<Link, AppError> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE links SET updated_at = ");
    query.push_bind(Utc::now());

    if let Some(short_code) = &update.short_code {
        query.push(", short_code = ").push_bind(short_code.clone());
    }
    if let Some(destination_url) = &update.destination_url {
        query
            .push(", destination_url = ")
            .push_bind(destination_url.clone());
    }
    if let Some(is_active) = update.is_active {
        query.push(", is_active = ").push_bind(is_active);
    }
    if let Some(deleted_at) = update.deleted_at {
        query.push(", deleted_at = ").push_bind(deleted_at);
    }
    if let Some(expiration_date) = update.expiration_date {
        query.push(", expiration_date = ").push_bind(expiration_date);
    }
    if let Some(scheduled_date) = update.scheduled_date {
        query.push(", scheduled_date = ").push_bind(scheduled_date);
    }

    query.push(" WHERE id = ").push_bind(id);

    let affected = query.build().execute(pool).await?.rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }

    find_by_id(pool, id).await?.ok_or(AppError::NotFound)
}

/// Permanently delete a link (cascades to its visit events via FK).
pub async fn delete_link(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let affected = sqlx::query("DELETE FROM links WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();

    Ok(affected > 0)
}

// ── Visits ─────────────────────────────────────────────────────────────────

/// Count one visit and append its event, keeping only the newest
/// [`MAX_RECENT_VISITS`] events. All three statements share one transaction
/// so concurrent visits to the same link serialize on SQLite's write lock.
pub async fn increment_and_append_access(
    pool: &SqlitePool,
    short_code: &str,
    event: &VisitEvent,
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    let link_id: Option<i64> = sqlx::query_scalar(
        "UPDATE links SET access_count = access_count + 1, updated_at = ?2
         WHERE short_code = ?1
         RETURNING id",
    )
    .bind(short_code)
    .bind(Utc::now())
    .fetch_optional(&mut *tx)
    .await?;

    // Dropping the transaction rolls it back.
    let Some(link_id) = link_id else {
        return Err(AppError::NotFound);
    };

    sqlx::query(
        "INSERT INTO link_visits (link_id, visited_at, user_agent, referrer, country)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(link_id)
    .bind(event.date)
    .bind(&event.user_agent)
    .bind(&event.referrer)
    .bind(&event.country)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "DELETE FROM link_visits
         WHERE link_id = ?1
           AND id NOT IN (SELECT id FROM link_visits
                          WHERE link_id = ?1
                          ORDER BY id DESC
                          LIMIT ?2)",
    )
    .bind(link_id)
    .bind(MAX_RECENT_VISITS as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────

async fn attach_single(
    pool: &SqlitePool,
    row: Option<LinkRow>,
) -> Result<Option<Link>, sqlx::Error> {
    let Some(row) = row else {
        return Ok(None);
    };

    let visits: Vec<VisitRow> = sqlx::query_as(
        "SELECT link_id, visited_at, user_agent, referrer, country
         FROM link_visits WHERE link_id = ?1 ORDER BY id",
    )
    .bind(row.id)
    .fetch_all(pool)
    .await?;

    let events = visits.into_iter().map(VisitEvent::from).collect();
    Ok(Some(row.into_link(events)))
}

/// Group visit rows (ordered by link, then insertion) onto their links,
/// preserving the order of `rows`.
fn attach_visits(rows: Vec<LinkRow>, visits: Vec<VisitRow>) -> Vec<Link> {
    let mut by_link: HashMap<i64, Vec<VisitEvent>> = HashMap::new();
    for visit in visits {
        by_link
            .entry(visit.link_id)
            .or_default()
            .push(VisitEvent::from(visit));
    }

    rows.into_iter()
        .map(|row| {
            let events = by_link.remove(&row.id).unwrap_or_default();
            row.into_link(events)
        })
        .collect()
}
