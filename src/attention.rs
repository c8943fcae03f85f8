use rusqlite::Connection;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::changes::{ChangeStatus, DetectedChange};
use crate::checkpoints::{Assessment, ChangeCheckpoint};
use crate::error::WebPulseError;
use crate::pages::MonitoredPage;
use crate::scans::{ScanJob, ScanStatus};
use crate::suggestions::{Impact, TrackedSuggestion};

#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone, PartialOrd, Ord)]
pub enum Severity {
    #[strum(serialize = "stable")]
    Stable,
    #[strum(serialize = "low")]
    Low,
    #[strum(serialize = "medium")]
    Medium,
    #[strum(serialize = "high")]
    High,
}

/// The single ranked "needs attention" signal surfaced on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionStatus {
    pub severity: Severity,
    pub reason: String,
}

/// Reduce a page's latest scan, open changes, and open suggestions to one
/// attention signal. Rules are checked in priority order; the first match
/// wins.
pub fn evaluate_page(
    conn: &Connection,
    page: &MonitoredPage,
) -> Result<AttentionStatus, WebPulseError> {
    // 1. Last scan failed
    let latest_scan = match page.latest_scan_id {
        Some(scan_id) => ScanJob::get_by_id(conn, scan_id)?,
        None => None,
    };
    if let Some(scan) = &latest_scan {
        if scan.status == ScanStatus::Failed {
            return Ok(AttentionStatus {
                severity: Severity::High,
                reason: "last scan failed".to_string(),
            });
        }
    }

    // 2. Never scanned
    if latest_scan.is_none() {
        return Ok(AttentionStatus {
            severity: Severity::Low,
            reason: "no scan yet".to_string(),
        });
    }

    let changes = DetectedChange::open_for_page(conn, page.page_id)?;
    let suggestions = TrackedSuggestion::open_for_page(conn, page.page_id)?;

    // 3. A change regressed on its governing horizon
    for change in &changes {
        let checkpoints = ChangeCheckpoint::list_for_change(conn, change.change_id)?;
        if let Some(governing) = governing_checkpoint(change.status, &checkpoints) {
            if governing.assessment == Assessment::Regressed {
                return Ok(AttentionStatus {
                    severity: Severity::High,
                    reason: format!(
                        "change to '{}' regressed at the {}d mark",
                        change.element, governing.horizon_days
                    ),
                });
            }
        }
    }

    // 4. Changes still under watch with open suggestions piling up
    let any_watching = changes.iter().any(|c| c.status == ChangeStatus::Watching);
    if any_watching && !suggestions.is_empty() {
        return Ok(AttentionStatus {
            severity: Severity::Medium,
            reason: "changes under watch with open suggestions".to_string(),
        });
    }

    // 5. Open high-impact suggestion
    if suggestions.iter().any(|s| s.impact == Impact::High) {
        return Ok(AttentionStatus {
            severity: Severity::Medium,
            reason: "open high-impact suggestion".to_string(),
        });
    }

    Ok(AttentionStatus {
        severity: Severity::Stable,
        reason: "no attention needed".to_string(),
    })
}

/// The checkpoint that decided a resolved change's status: the one whose
/// assessment matches the status, else the largest-horizon checkpoint.
fn governing_checkpoint<'a>(
    status: ChangeStatus,
    checkpoints: &'a [ChangeCheckpoint],
) -> Option<&'a ChangeCheckpoint> {
    let wanted = match status {
        ChangeStatus::Validated => Some(Assessment::Improved),
        ChangeStatus::Regressed => Some(Assessment::Regressed),
        _ => None,
    };

    if let Some(wanted) = wanted {
        if let Some(cp) = checkpoints.iter().find(|cp| cp.assessment == wanted) {
            return Some(cp);
        }
    }

    // Fall back to the widest measurement available
    checkpoints.iter().max_by_key(|cp| cp.horizon_days)
}
