use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::billing::TierResolver;
use crate::error::WebPulseError;
use crate::tiers::{self, ScanFrequency};

/// A URL a user tracks. At most one page per (owner, normalized url).
#[derive(Debug, Clone)]
pub struct MonitoredPage {
    pub page_id: i64,
    pub owner_id: i64,
    pub url: String,
    pub scan_frequency: ScanFrequency,
    pub latest_scan_id: Option<i64>,
    pub created_at: i64,
}

impl MonitoredPage {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let freq_str: String = row.get(3)?;
        Ok(MonitoredPage {
            page_id: row.get(0)?,
            owner_id: row.get(1)?,
            url: row.get(2)?,
            scan_frequency: freq_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    3,
                    "scan_frequency".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            latest_scan_id: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    const SELECT_COLS: &str =
        "page_id, owner_id, url, scan_frequency, latest_scan_id, created_at";

    /// Normalize a URL so that trivially-different spellings of the same
    /// page collapse onto one row: lowercase scheme and host, default to
    /// https, strip a trailing slash on the bare path.
    pub fn normalize_url(raw: &str) -> String {
        let trimmed = raw.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let (scheme, rest) = match with_scheme.split_once("://") {
            Some((s, r)) => (s.to_ascii_lowercase(), r),
            None => ("https".to_string(), with_scheme.as_str()),
        };

        let (host, path) = match rest.split_once('/') {
            Some((h, p)) => (h.to_ascii_lowercase(), format!("/{}", p)),
            None => (rest.to_ascii_lowercase(), String::new()),
        };

        let path = if path == "/" { String::new() } else { path };
        let path = path.strip_suffix('/').map(str::to_string).unwrap_or(path);

        format!("{}://{}{}", scheme, host, path)
    }

    /// Register a new monitored page.
    ///
    /// Enforces the owner's tier page quota (explicit policy rejection) and
    /// the per-owner URL uniqueness invariant (rejected as "already
    /// monitored" when the unique index fires).
    pub fn register(
        conn: &Connection,
        resolver: &dyn TierResolver,
        owner_id: i64,
        raw_url: &str,
        frequency: ScanFrequency,
        now: i64,
    ) -> Result<Self, WebPulseError> {
        let url = Self::normalize_url(raw_url);

        let tier = resolver
            .resolve(conn, &[owner_id], now)?
            .get(&owner_id)
            .copied()
            .ok_or_else(|| WebPulseError::Error(format!("Owner {} not found", owner_id)))?;

        let limit = tiers::page_limit(tier);
        let existing: usize = conn.query_row(
            "SELECT COUNT(*) FROM pages WHERE owner_id = ?",
            [owner_id],
            |row| row.get::<_, i64>(0),
        )? as usize;

        if existing >= limit {
            return Err(WebPulseError::Error(format!(
                "Page limit reached: {} tier allows {} page(s)",
                tier, limit
            )));
        }

        let result = conn.query_row(
            "INSERT INTO pages (owner_id, url, scan_frequency, latest_scan_id, created_at)
             VALUES (?, ?, ?, NULL, ?)
             RETURNING page_id",
            params![owner_id, url, frequency.as_ref(), now],
            |row| row.get::<_, i64>(0),
        );

        let page_id = match result {
            Ok(id) => id,
            Err(e) => {
                let err = WebPulseError::DatabaseError(e);
                if err.is_constraint_violation() {
                    return Err(WebPulseError::Error(format!(
                        "Page '{}' is already monitored",
                        url
                    )));
                }
                return Err(err);
            }
        };

        info!("Registered page {} ({}) for owner {}", page_id, url, owner_id);

        Ok(MonitoredPage {
            page_id,
            owner_id,
            url,
            scan_frequency: frequency,
            latest_scan_id: None,
            created_at: now,
        })
    }

    pub fn get_by_id(conn: &Connection, page_id: i64) -> Result<Option<Self>, WebPulseError> {
        let page = conn
            .query_row(
                &format!("SELECT {} FROM pages WHERE page_id = ?", Self::SELECT_COLS),
                [page_id],
                Self::from_row,
            )
            .optional()?;
        Ok(page)
    }

    pub fn list_for_owner(conn: &Connection, owner_id: i64) -> Result<Vec<Self>, WebPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pages WHERE owner_id = ? ORDER BY created_at ASC, page_id ASC",
            Self::SELECT_COLS
        ))?;
        let pages = stmt
            .query_map([owner_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    /// Point the page at its most recent completed scan.
    pub fn set_latest_scan(
        conn: &Connection,
        page_id: i64,
        scan_id: i64,
    ) -> Result<(), WebPulseError> {
        let rows = conn.execute(
            "UPDATE pages SET latest_scan_id = ? WHERE page_id = ?",
            params![scan_id, page_id],
        )?;
        if rows == 0 {
            return Err(WebPulseError::Error(format!("Page {} not found", page_id)));
        }
        Ok(())
    }

    /// Find the page a scan job belongs to, by owner and url.
    pub fn get_by_owner_url(
        conn: &Connection,
        owner_id: i64,
        url: &str,
    ) -> Result<Option<Self>, WebPulseError> {
        let page = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pages WHERE owner_id = ? AND url = ?",
                    Self::SELECT_COLS
                ),
                params![owner_id, url],
                Self::from_row,
            )
            .optional()?;
        Ok(page)
    }
}
