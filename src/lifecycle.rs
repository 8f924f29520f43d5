//! Create, edit, activation and the delete/restore state machine.
//!
//! `Active -> SoftDeleted -> PermanentlyDeleted`, with `SoftDeleted -> Active`
//! allowed for [`RECOVERY_WINDOW_MS`] after the soft delete. Permanent delete
//! is reachable from either live state.

use crate::{
    db,
    error::AppError,
    models::{Link, LinkUpdate, NewLink},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;

/// How long a soft-deleted link can still be restored.
pub const RECOVERY_WINDOW_MS: i64 = 60 * 60 * 1000;

const SHORT_CODE_FIELD: &str = "shortCode";

/// First path segments owned by the service itself.
const RESERVED_CODES: &[&str] = &["links", "health", "auth"];

/// Body of a create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLink {
    pub destination_url: String,
    #[serde(default)]
    pub short_code: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<Value>,
    #[serde(default)]
    pub scheduled_date: Option<Value>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Body of an edit request. Fields are kept as raw JSON so that a wrongly
/// typed `shortCode` is reported as missing rather than as a parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditLink {
    #[serde(default)]
    pub short_code: Option<Value>,
    #[serde(default)]
    pub expiration_date: Option<Value>,
    #[serde(default)]
    pub scheduled_date: Option<Value>,
}

/// Result of an edit: the stored record and the code it had before.
#[derive(Debug, Clone)]
pub struct Edited {
    pub link: Link,
    pub previous_short_code: String,
}

// ── Create / edit ──────────────────────────────────────────────────────────

pub async fn create(pool: &SqlitePool, req: CreateLink) -> Result<Link, AppError> {
    let destination_url = req.destination_url.trim().to_owned();
    if destination_url.is_empty() {
        return Err(AppError::InvalidField {
            field: "destinationUrl",
            reason: "must not be empty".into(),
        });
    }

    let short_code = match req.short_code.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(code) => {
            validate_short_code(code)?;
            if db::find_by_short_code(pool, code).await?.is_some() {
                return Err(AppError::DuplicateKey);
            }
            code.to_owned()
        }
        None => generate_unique_code(pool).await,
    };

    let link = NewLink {
        short_code,
        destination_url,
        is_active: req.is_active,
        expiration_date: parse_date("expirationDate", req.expiration_date.as_ref())?,
        scheduled_date: parse_date("scheduledDate", req.scheduled_date.as_ref())?,
    };

    // The UNIQUE index still guards the race between the check and the insert.
    db::create_link(pool, &link).await
}

/// Change a link's short code and its two optional dates.
pub async fn edit(pool: &SqlitePool, id: i64, req: EditLink) -> Result<Edited, AppError> {
    let short_code = match &req.short_code {
        Some(Value::String(code)) if !code.is_empty() => code.clone(),
        _ => return Err(AppError::MissingField(SHORT_CODE_FIELD)),
    };

    // Uniqueness spans every stored record, deleted or not.
    if let Some(owner) = db::find_by_short_code(pool, &short_code).await? {
        if owner.id != id {
            return Err(AppError::DuplicateKey);
        }
    }

    let update = LinkUpdate {
        short_code: Some(short_code),
        expiration_date: Some(parse_date("expirationDate", req.expiration_date.as_ref())?),
        scheduled_date: Some(parse_date("scheduledDate", req.scheduled_date.as_ref())?),
        ..Default::default()
    };

    let previous = db::find_by_id(pool, id).await?.ok_or(AppError::NotFound)?;
    let link = db::update_link(pool, id, &update).await?;

    if is_reserved(&link.short_code) {
        tracing::warn!(
            "Link {} renamed to reserved code '{}'; it cannot be reached by redirect",
            id,
            link.short_code
        );
    }

    Ok(Edited {
        link,
        previous_short_code: previous.short_code,
    })
}

pub async fn set_active(pool: &SqlitePool, id: i64, is_active: bool) -> Result<Link, AppError> {
    let update = LinkUpdate {
        is_active: Some(is_active),
        ..Default::default()
    };
    db::update_link(pool, id, &update).await
}

// ── Delete / restore ───────────────────────────────────────────────────────

pub async fn soft_delete(pool: &SqlitePool, id: i64) -> Result<Link, AppError> {
    soft_delete_at(pool, id, Utc::now()).await
}

pub async fn soft_delete_at(
    pool: &SqlitePool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Link, AppError> {
    let link = db::find_by_id(pool, id).await?.ok_or(AppError::NotFound)?;
    if link.is_deleted {
        return Err(AppError::AlreadyDeleted);
    }

    let update = LinkUpdate {
        deleted_at: Some(Some(now)),
        ..Default::default()
    };
    db::update_link(pool, id, &update).await
}

/// Remove the record outright, whatever its delete state. Returns the
/// record as it was just before removal.
pub async fn permanent_delete(pool: &SqlitePool, id: i64) -> Result<Link, AppError> {
    let link = db::find_by_id(pool, id).await?.ok_or(AppError::NotFound)?;

    tracing::info!("Permanent delete issued on link id {}", id);
    if !db::delete_link(pool, id).await? {
        return Err(AppError::NotFound);
    }
    Ok(link)
}

pub async fn restore(pool: &SqlitePool, id: i64) -> Result<Link, AppError> {
    restore_at(pool, id, Utc::now()).await
}

pub async fn restore_at(
    pool: &SqlitePool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Link, AppError> {
    let link = db::find_by_id(pool, id).await?.ok_or(AppError::NotFound)?;

    if !within_recovery_window(link.deleted_at, now) {
        return Err(AppError::RecoveryWindowExpired);
    }

    let update = LinkUpdate {
        deleted_at: Some(None),
        ..Default::default()
    };
    db::update_link(pool, id, &update).await
}

/// `false` when never deleted or deleted more than the window ago.
pub fn within_recovery_window(deleted_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match deleted_at {
        Some(at) => (now - at).num_milliseconds() <= RECOVERY_WINDOW_MS,
        None => false,
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM[:SS]` and `YYYY-MM-DD` (all UTC) or
/// epoch milliseconds. Absent, null and empty values clear the date.
pub fn parse_date(
    field: &'static str,
    value: Option<&Value>,
) -> Result<Option<DateTime<Utc>>, AppError> {
    let invalid = |reason: String| AppError::InvalidField { field, reason };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(dt.with_timezone(&Utc)));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(Some(Utc.from_utc_datetime(&naive)));
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Some(Utc.from_utc_datetime(&midnight)));
                }
            }
            Err(invalid(format!("unrecognised date '{s}'")))
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Some)
            .ok_or_else(|| invalid(format!("timestamp {n} out of range"))),
        Some(other) => Err(invalid(format!("expected a date string, got {other}"))),
    }
}

/// Codes that collide with service routes and so never reach the redirect handler.
fn is_reserved(code: &str) -> bool {
    RESERVED_CODES.contains(&code)
}

fn validate_short_code(code: &str) -> Result<(), AppError> {
    if is_reserved(code) {
        return Err(AppError::InvalidField {
            field: SHORT_CODE_FIELD,
            reason: format!("'{code}' is reserved"),
        });
    }
    if code
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(AppError::InvalidField {
            field: SHORT_CODE_FIELD,
            reason: "may only contain letters, numbers, hyphens and underscores".into(),
        })
    }
}

/// Generate a random 7-character alphanumeric short code that doesn't already
/// exist in the database. Tries up to 10 times before falling back to a
/// longer code (the UNIQUE constraint in the DB is the real guard).
async fn generate_unique_code(pool: &SqlitePool) -> String {
    for _ in 0..10 {
        let code = random_code(7);
        match db::find_by_short_code(pool, &code).await {
            Ok(None) => return code,
            _ => continue,
        }
    }
    random_code(9)
}

fn random_code(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
