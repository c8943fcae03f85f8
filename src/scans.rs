use chrono::{FixedOffset, TimeZone, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::WebPulseError;

/// What initiated a scan job.
#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum TriggerType {
    #[strum(serialize = "manual")]
    Manual,
    #[strum(serialize = "daily")]
    Daily,
    #[strum(serialize = "weekly")]
    Weekly,
    #[strum(serialize = "deploy")]
    Deploy,
}

impl TriggerType {
    /// Scheduled triggers carry a day_key and participate in the
    /// one-job-per-day idempotency constraint.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, TriggerType::Daily | TriggerType::Weekly)
    }
}

#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum ScanStatus {
    #[strum(serialize = "pending")]
    Pending,
    #[strum(serialize = "processing")]
    Processing,
    #[strum(serialize = "complete")]
    Complete,
    #[strum(serialize = "failed")]
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Complete | ScanStatus::Failed)
    }
}

/// One execution of the analysis pipeline against a page's URL.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub scan_id: i64,
    pub owner_id: Option<i64>,
    pub url: String,
    pub trigger_type: TriggerType,
    pub status: ScanStatus,
    pub parent_scan_id: Option<i64>,
    pub day_key: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// The calendar day `ts` falls on in the owner's timezone, as "YYYY-MM-DD".
/// This is the day component of the scan idempotency key.
pub fn day_key(ts: i64, tz_offset_minutes: i64) -> String {
    let offset = FixedOffset::east_opt((tz_offset_minutes * 60) as i32)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    let dt = Utc
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"))
        .with_timezone(&offset);
    dt.format("%Y-%m-%d").to_string()
}

impl ScanJob {
    const SELECT_COLS: &str = "scan_id, owner_id, url, trigger_type, status, parent_scan_id,
         day_key, error, created_at, completed_at";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let trigger_str: String = row.get(3)?;
        let status_str: String = row.get(4)?;
        Ok(ScanJob {
            scan_id: row.get(0)?,
            owner_id: row.get(1)?,
            url: row.get(2)?,
            trigger_type: trigger_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    3,
                    "trigger_type".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            status: status_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    4,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            parent_scan_id: row.get(5)?,
            day_key: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    /// Create a pending scan job, idempotently for scheduled triggers.
    ///
    /// For daily/weekly triggers the (owner, url, trigger, day) unique index
    /// is the idempotency key: a constraint violation on insert means the
    /// day's job already exists, which is the success path — `Ok(None)` is
    /// returned and nothing is enqueued twice. Manual/deploy jobs carry no
    /// day_key and always insert.
    pub fn create_pending(
        conn: &Connection,
        owner_id: Option<i64>,
        url: &str,
        trigger_type: TriggerType,
        parent_scan_id: Option<i64>,
        tz_offset_minutes: i64,
        now: i64,
    ) -> Result<Option<i64>, WebPulseError> {
        let day = trigger_type
            .is_scheduled()
            .then(|| day_key(now, tz_offset_minutes));

        let result = conn.query_row(
            "INSERT INTO scan_jobs
                (owner_id, url, trigger_type, status, parent_scan_id, day_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING scan_id",
            params![
                owner_id,
                url,
                trigger_type.as_ref(),
                ScanStatus::Pending.as_ref(),
                parent_scan_id,
                day,
                now
            ],
            |row| row.get::<_, i64>(0),
        );

        match result {
            Ok(scan_id) => {
                debug!("Created {} scan {} for {}", trigger_type, scan_id, url);
                Ok(Some(scan_id))
            }
            Err(e) => {
                let err = WebPulseError::DatabaseError(e);
                if err.is_constraint_violation() {
                    debug!(
                        "Scan for {} ({}, day {:?}) already exists, skipping",
                        url, trigger_type, day
                    );
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn get_by_id(conn: &Connection, scan_id: i64) -> Result<Option<Self>, WebPulseError> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM scan_jobs WHERE scan_id = ?", Self::SELECT_COLS),
                [scan_id],
                Self::from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Whether a scheduled job already exists for this idempotency key.
    pub fn exists_for_day(
        conn: &Connection,
        owner_id: i64,
        url: &str,
        trigger_type: TriggerType,
        day: &str,
    ) -> Result<bool, WebPulseError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM scan_jobs
                WHERE owner_id = ? AND url = ? AND trigger_type = ? AND day_key = ?
            )",
            params![owner_id, url, trigger_type.as_ref(), day],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Scheduled jobs stuck in pending: created within the lookback window
    /// but older than the staleness threshold. Jobs younger than the
    /// threshold are presumed to still be legitimately queued.
    pub fn stale_pending(
        conn: &Connection,
        now: i64,
        lookback_secs: i64,
        stale_after_secs: i64,
    ) -> Result<Vec<Self>, WebPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scan_jobs
             WHERE status = ?
               AND trigger_type IN (?, ?)
               AND created_at >= ?
               AND created_at <= ?
             ORDER BY created_at ASC",
            Self::SELECT_COLS
        ))?;

        let jobs = stmt
            .query_map(
                params![
                    ScanStatus::Pending.as_ref(),
                    TriggerType::Daily.as_ref(),
                    TriggerType::Weekly.as_ref(),
                    now - lookback_secs,
                    now - stale_after_secs
                ],
                Self::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Mark a pending job as picked up by the analysis pipeline.
    pub fn mark_processing(conn: &Connection, scan_id: i64) -> Result<(), WebPulseError> {
        let rows = conn.execute(
            "UPDATE scan_jobs SET status = ? WHERE scan_id = ? AND status = ?",
            params![
                ScanStatus::Processing.as_ref(),
                scan_id,
                ScanStatus::Pending.as_ref()
            ],
        )?;
        if rows == 0 {
            return Err(WebPulseError::Error(format!(
                "Scan {} is not pending",
                scan_id
            )));
        }
        Ok(())
    }

    /// Record a terminal outcome. Terminal states are never overwritten;
    /// a failed scan is not auto-retried, it falls out of the idempotency
    /// window at the next cadence instead.
    pub fn mark_finished(
        conn: &Connection,
        scan_id: i64,
        status: ScanStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<(), WebPulseError> {
        if !status.is_terminal() {
            return Err(WebPulseError::Error(format!(
                "Status '{}' is not terminal",
                status
            )));
        }

        let rows = conn.execute(
            "UPDATE scan_jobs SET status = ?, error = ?, completed_at = ?
             WHERE scan_id = ? AND status IN (?, ?)",
            params![
                status.as_ref(),
                error,
                now,
                scan_id,
                ScanStatus::Pending.as_ref(),
                ScanStatus::Processing.as_ref()
            ],
        )?;
        if rows == 0 {
            return Err(WebPulseError::Error(format!(
                "Scan {} not found or already finished",
                scan_id
            )));
        }

        info!("Scan {} finished with status {}", scan_id, status);
        Ok(())
    }
}
