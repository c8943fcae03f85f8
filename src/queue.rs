use chrono::Utc;
use log::debug;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::WebPulseError;

/// Event emitted when a scan job is ready for the analysis pipeline.
pub const SCAN_REQUESTED: &str = "scan.requested";

/// Payload of a scan-requested event. Delivery is at-least-once; the
/// consumer checks job status before reprocessing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequested {
    pub scan_id: i64,
    pub url: String,
    pub parent_scan_id: Option<i64>,
}

/// The work queue the analysis pipeline consumes from. Injected into the
/// scheduler and backup runner so tests can substitute a failing or
/// recording fake.
pub trait WorkQueue {
    /// Idempotently (re-)attach the consumer-side binding. Safe to call on
    /// every tick; defends against a torn-down consumer registration.
    fn ensure_subscription(&self) -> Result<(), WebPulseError>;

    fn enqueue(&self, event_name: &str, payload: &ScanRequested) -> Result<(), WebPulseError>;
}

/// SQLite-backed outbox. Producers append rows; the external pipeline
/// drains them out-of-process.
pub struct OutboxQueue {
    db: Database,
}

impl OutboxQueue {
    pub fn new(db: Database) -> Self {
        OutboxQueue { db }
    }
}

impl WorkQueue for OutboxQueue {
    fn ensure_subscription(&self) -> Result<(), WebPulseError> {
        let conn = self.db.conn()?;
        Database::set_meta_value(
            &conn,
            "queue_subscribed_at",
            &Utc::now().timestamp().to_string(),
        )
    }

    fn enqueue(&self, event_name: &str, payload: &ScanRequested) -> Result<(), WebPulseError> {
        let conn = self.db.conn()?;
        let json = serde_json::to_string(payload)?;
        conn.execute(
            "INSERT INTO queue_outbox (event_name, payload, enqueued_at) VALUES (?, ?, ?)",
            params![event_name, json, Utc::now().timestamp()],
        )?;
        debug!("Enqueued {} for scan {}", event_name, payload.scan_id);
        Ok(())
    }
}
