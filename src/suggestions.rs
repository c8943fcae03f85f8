use log::info;
use rusqlite::{params, Connection, Row};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::WebPulseError;

#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum SuggestionStatus {
    #[strum(serialize = "open")]
    Open,
    #[strum(serialize = "addressed")]
    Addressed,
    #[strum(serialize = "dismissed")]
    Dismissed,
}

#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum Impact {
    #[strum(serialize = "high")]
    High,
    #[strum(serialize = "medium")]
    Medium,
    #[strum(serialize = "low")]
    Low,
}

/// An improvement recommendation surfaced repeatedly across scans. The
/// analysis pipeline upserts these; only an explicit user action moves one
/// into a terminal status.
#[derive(Debug, Clone)]
pub struct TrackedSuggestion {
    pub suggestion_id: i64,
    pub page_id: i64,
    pub owner_id: i64,
    pub suggestion_key: String,
    pub title: String,
    pub impact: Impact,
    pub status: SuggestionStatus,
    pub times_seen: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

impl TrackedSuggestion {
    const SELECT_COLS: &str = "suggestion_id, page_id, owner_id, suggestion_key, title, impact,
         status, times_seen, first_seen_at, last_seen_at";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let impact_str: String = row.get(5)?;
        let status_str: String = row.get(6)?;
        Ok(TrackedSuggestion {
            suggestion_id: row.get(0)?,
            page_id: row.get(1)?,
            owner_id: row.get(2)?,
            suggestion_key: row.get(3)?,
            title: row.get(4)?,
            impact: impact_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    5,
                    "impact".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            status: status_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    6,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            times_seen: row.get(7)?,
            first_seen_at: row.get(8)?,
            last_seen_at: row.get(9)?,
        })
    }

    /// Record a suggestion observed by a scan. A repeat observation bumps
    /// the counter and freshness but never touches the status — an
    /// addressed or dismissed suggestion stays that way.
    pub fn upsert(
        conn: &Connection,
        page_id: i64,
        owner_id: i64,
        suggestion_key: &str,
        title: &str,
        impact: Impact,
        now: i64,
    ) -> Result<(), WebPulseError> {
        conn.execute(
            "INSERT INTO suggestions
                (page_id, owner_id, suggestion_key, title, impact, status,
                 times_seen, first_seen_at, last_seen_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(page_id, suggestion_key) DO UPDATE SET
                times_seen = times_seen + 1,
                last_seen_at = excluded.last_seen_at,
                title = excluded.title,
                impact = excluded.impact",
            params![
                page_id,
                owner_id,
                suggestion_key,
                title,
                impact.as_ref(),
                SuggestionStatus::Open.as_ref(),
                now,
                now
            ],
        )?;
        Ok(())
    }

    /// Explicit user action: mark a suggestion addressed or dismissed.
    pub fn set_status(
        conn: &Connection,
        suggestion_id: i64,
        status: SuggestionStatus,
    ) -> Result<(), WebPulseError> {
        let rows = conn.execute(
            "UPDATE suggestions SET status = ? WHERE suggestion_id = ?",
            params![status.as_ref(), suggestion_id],
        )?;
        if rows == 0 {
            return Err(WebPulseError::Error(format!(
                "Suggestion {} not found",
                suggestion_id
            )));
        }
        info!("Suggestion {} marked {}", suggestion_id, status);
        Ok(())
    }

    pub fn open_for_page(conn: &Connection, page_id: i64) -> Result<Vec<Self>, WebPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM suggestions
             WHERE page_id = ? AND status = ?
             ORDER BY last_seen_at DESC",
            Self::SELECT_COLS
        ))?;
        let suggestions = stmt
            .query_map(
                params![page_id, SuggestionStatus::Open.as_ref()],
                Self::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(suggestions)
    }
}
