use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::database::Database;
use crate::error::WebPulseError;

/// Lifecycle status of a detected change.
///
/// `watching` is the only non-terminal status. Resolved statuses never
/// move back to `watching`; `reverted` may be entered from any other
/// status when a later scan shows the change was undone.
#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChangeStatus {
    #[strum(serialize = "watching")]
    Watching,
    #[strum(serialize = "validated")]
    Validated,
    #[strum(serialize = "regressed")]
    Regressed,
    #[strum(serialize = "inconclusive")]
    Inconclusive,
    #[strum(serialize = "reverted")]
    Reverted,
}

impl ChangeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChangeStatus::Watching)
    }

    /// Whether the transition table permits `from -> to`.
    pub fn can_transition(from: ChangeStatus, to: ChangeStatus) -> bool {
        match from {
            ChangeStatus::Watching => to != ChangeStatus::Watching,
            // A later scan can show a resolved change was undone
            ChangeStatus::Reverted => false,
            _ => to == ChangeStatus::Reverted,
        }
    }
}

#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChangeScope {
    #[strum(serialize = "element")]
    Element,
    #[strum(serialize = "section")]
    Section,
    #[strum(serialize = "page")]
    Page,
}

/// Who performed a lifecycle transition.
#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum ActorType {
    #[strum(serialize = "system")]
    System,
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "llm")]
    Llm,
}

/// A single content difference discovered between a scan and its parent.
#[derive(Debug, Clone)]
pub struct DetectedChange {
    pub change_id: i64,
    pub page_id: i64,
    pub owner_id: i64,
    pub element: String,
    pub scope: ChangeScope,
    pub before_value: Option<String>,
    pub after_value: Option<String>,
    pub status: ChangeStatus,
    pub correlation_metrics: Option<serde_json::Value>,
    pub correlation_unlocked_at: Option<i64>,
    pub hypothesis: Option<String>,
    pub deploy_ref: Option<String>,
    pub first_detected_at: i64,
    pub first_detected_scan_id: i64,
}

/// Fields supplied by the analysis pipeline when it reports a difference.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub page_id: i64,
    pub owner_id: i64,
    pub element: String,
    pub scope: ChangeScope,
    pub before_value: Option<String>,
    pub after_value: Option<String>,
    pub hypothesis: Option<String>,
    pub deploy_ref: Option<String>,
    pub first_detected_at: i64,
    pub first_detected_scan_id: i64,
}

/// One audit record of a status transition. Append-only.
#[derive(Debug, Clone)]
pub struct ChangeLifecycleEvent {
    pub event_id: i64,
    pub change_id: i64,
    pub from_status: ChangeStatus,
    pub to_status: ChangeStatus,
    pub reason: String,
    pub actor_type: ActorType,
    pub checkpoint_id: Option<i64>,
    pub created_at: i64,
}

impl DetectedChange {
    const SELECT_COLS: &str = "change_id, page_id, owner_id, element, scope, before_value,
         after_value, status, correlation_metrics, correlation_unlocked_at,
         hypothesis, deploy_ref, first_detected_at, first_detected_scan_id";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let scope_str: String = row.get(4)?;
        let status_str: String = row.get(7)?;
        let metrics_json: Option<String> = row.get(8)?;
        Ok(DetectedChange {
            change_id: row.get(0)?,
            page_id: row.get(1)?,
            owner_id: row.get(2)?,
            element: row.get(3)?,
            scope: scope_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    4,
                    "scope".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            before_value: row.get(5)?,
            after_value: row.get(6)?,
            status: status_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    7,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            correlation_metrics: metrics_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .unwrap_or(None),
            correlation_unlocked_at: row.get(9)?,
            hypothesis: row.get(10)?,
            deploy_ref: row.get(11)?,
            first_detected_at: row.get(12)?,
            first_detected_scan_id: row.get(13)?,
        })
    }

    /// Record a newly detected difference. Initial status is always
    /// `watching`.
    pub fn create(conn: &Connection, new: NewChange) -> Result<Self, WebPulseError> {
        let change_id: i64 = conn.query_row(
            "INSERT INTO detected_changes
                (page_id, owner_id, element, scope, before_value, after_value, status,
                 hypothesis, deploy_ref, first_detected_at, first_detected_scan_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING change_id",
            params![
                new.page_id,
                new.owner_id,
                new.element,
                new.scope.as_ref(),
                new.before_value,
                new.after_value,
                ChangeStatus::Watching.as_ref(),
                new.hypothesis,
                new.deploy_ref,
                new.first_detected_at,
                new.first_detected_scan_id
            ],
            |row| row.get(0),
        )?;

        info!(
            "Detected change {} on page {} ({} '{}')",
            change_id, new.page_id, new.scope, new.element
        );

        Ok(DetectedChange {
            change_id,
            page_id: new.page_id,
            owner_id: new.owner_id,
            element: new.element,
            scope: new.scope,
            before_value: new.before_value,
            after_value: new.after_value,
            status: ChangeStatus::Watching,
            correlation_metrics: None,
            correlation_unlocked_at: None,
            hypothesis: new.hypothesis,
            deploy_ref: new.deploy_ref,
            first_detected_at: new.first_detected_at,
            first_detected_scan_id: new.first_detected_scan_id,
        })
    }

    pub fn get_by_id(conn: &Connection, change_id: i64) -> Result<Option<Self>, WebPulseError> {
        let change = conn
            .query_row(
                &format!(
                    "SELECT {} FROM detected_changes WHERE change_id = ?",
                    Self::SELECT_COLS
                ),
                [change_id],
                Self::from_row,
            )
            .optional()?;
        Ok(change)
    }

    /// Changes for a page, excluding reverted ones. Used by the attention
    /// prioritizer.
    pub fn open_for_page(conn: &Connection, page_id: i64) -> Result<Vec<Self>, WebPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detected_changes
             WHERE page_id = ? AND status != ?
             ORDER BY first_detected_at DESC",
            Self::SELECT_COLS
        ))?;
        let changes = stmt
            .query_map(
                params![page_id, ChangeStatus::Reverted.as_ref()],
                Self::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(changes)
    }

    /// Apply a status transition atomically with its audit event.
    ///
    /// Validates the transition against the lifecycle table, stamps
    /// `correlation_unlocked_at` exactly once on the first exit from
    /// `watching`, and appends a `ChangeLifecycleEvent` in the same
    /// transaction. If any write fails the whole transition rolls back.
    pub fn transition(
        conn: &Connection,
        change_id: i64,
        to_status: ChangeStatus,
        reason: &str,
        actor: ActorType,
        checkpoint_id: Option<i64>,
        now: i64,
    ) -> Result<(), WebPulseError> {
        Database::immediate_transaction(conn, |c| {
            let current: Option<(String, Option<i64>)> = c
                .query_row(
                    "SELECT status, correlation_unlocked_at FROM detected_changes
                     WHERE change_id = ?",
                    [change_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (status_str, unlocked_at) = current.ok_or_else(|| {
                WebPulseError::Error(format!("Change {} not found", change_id))
            })?;
            let from_status: ChangeStatus = status_str.parse().map_err(|_| {
                WebPulseError::Error(format!(
                    "Change {} has unknown status '{}'",
                    change_id, status_str
                ))
            })?;

            if !ChangeStatus::can_transition(from_status, to_status) {
                warn!(
                    "Rejected transition {} -> {} for change {}",
                    from_status, to_status, change_id
                );
                return Err(WebPulseError::Error(format!(
                    "Transition {} -> {} is not permitted",
                    from_status, to_status
                )));
            }

            // Set exactly once, on the first exit from watching
            let unlock = if from_status == ChangeStatus::Watching && unlocked_at.is_none() {
                Some(now)
            } else {
                unlocked_at
            };

            c.execute(
                "UPDATE detected_changes
                 SET status = ?, correlation_unlocked_at = ?
                 WHERE change_id = ? AND status = ?",
                params![to_status.as_ref(), unlock, change_id, from_status.as_ref()],
            )?;

            c.execute(
                "INSERT INTO change_events
                    (change_id, from_status, to_status, reason, actor_type,
                     checkpoint_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    change_id,
                    from_status.as_ref(),
                    to_status.as_ref(),
                    reason,
                    actor.as_ref(),
                    checkpoint_id,
                    now
                ],
            )?;

            info!(
                "Change {} transitioned {} -> {} ({})",
                change_id, from_status, to_status, reason
            );
            Ok(())
        })
    }

    /// Store the latest computed correlation metrics snapshot on the change.
    pub fn set_correlation_metrics(
        conn: &Connection,
        change_id: i64,
        metrics: &serde_json::Value,
    ) -> Result<(), WebPulseError> {
        conn.execute(
            "UPDATE detected_changes SET correlation_metrics = ? WHERE change_id = ?",
            params![metrics.to_string(), change_id],
        )?;
        Ok(())
    }
}

impl ChangeLifecycleEvent {
    /// Audit trail for one change, oldest first.
    pub fn list_for_change(
        conn: &Connection,
        change_id: i64,
    ) -> Result<Vec<Self>, WebPulseError> {
        let mut stmt = conn.prepare(
            "SELECT event_id, change_id, from_status, to_status, reason, actor_type,
                    checkpoint_id, created_at
             FROM change_events WHERE change_id = ?
             ORDER BY event_id ASC",
        )?;

        let events = stmt
            .query_map([change_id], |row| {
                let from_str: String = row.get(2)?;
                let to_str: String = row.get(3)?;
                let actor_str: String = row.get(5)?;
                Ok(ChangeLifecycleEvent {
                    event_id: row.get(0)?,
                    change_id: row.get(1)?,
                    from_status: from_str.parse().map_err(|_| {
                        rusqlite::Error::InvalidColumnType(
                            2,
                            "from_status".to_string(),
                            rusqlite::types::Type::Text,
                        )
                    })?,
                    to_status: to_str.parse().map_err(|_| {
                        rusqlite::Error::InvalidColumnType(
                            3,
                            "to_status".to_string(),
                            rusqlite::types::Type::Text,
                        )
                    })?,
                    reason: row.get(4)?,
                    actor_type: actor_str.parse().map_err(|_| {
                        rusqlite::Error::InvalidColumnType(
                            5,
                            "actor_type".to_string(),
                            rusqlite::types::Type::Text,
                        )
                    })?,
                    checkpoint_id: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}
