use log::{debug, info, Level};
use logging_timer::timer;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::analytics::{self, AnalyticsProvider, MetricPolarity, MetricWindow, MetricsResult};
use crate::changes::{ActorType, ChangeStatus, DetectedChange};
use crate::database::Database;
use crate::error::WebPulseError;

/// Measurement horizons, in days after a change's first detection.
pub const HORIZON_DAYS: [i64; 5] = [7, 14, 30, 60, 90];

const DAY_SECS: i64 = 86_400;

/// Outcome of one horizon evaluation.
#[derive(AsRefStr, Display, EnumIter, EnumString, Debug, PartialEq, Eq, Copy, Clone)]
pub enum Assessment {
    #[strum(serialize = "improved")]
    Improved,
    #[strum(serialize = "regressed")]
    Regressed,
    #[strum(serialize = "neutral")]
    Neutral,
    #[strum(serialize = "inconclusive")]
    Inconclusive,
}

/// Per-metric outcome stored in the checkpoint's metrics JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricAssessment {
    pub before: f64,
    pub after: f64,
    pub change_percent: f64,
    pub assessment: String,
}

/// One immutable horizon measurement of a detected change.
#[derive(Debug, Clone)]
pub struct ChangeCheckpoint {
    pub checkpoint_id: i64,
    pub change_id: i64,
    pub horizon_days: i64,
    pub before_window: MetricWindow,
    pub after_window: MetricWindow,
    pub metrics: serde_json::Value,
    pub assessment: Assessment,
    pub confidence: Option<f64>,
    pub provider: String,
    pub computed_at: i64,
}

impl ChangeCheckpoint {
    const SELECT_COLS: &str = "checkpoint_id, change_id, horizon_days, before_start, before_end,
         after_start, after_end, metrics, assessment, confidence, provider, computed_at";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let metrics_json: String = row.get(7)?;
        let assessment_str: String = row.get(8)?;
        Ok(ChangeCheckpoint {
            checkpoint_id: row.get(0)?,
            change_id: row.get(1)?,
            horizon_days: row.get(2)?,
            before_window: MetricWindow {
                start: row.get(3)?,
                end: row.get(4)?,
            },
            after_window: MetricWindow {
                start: row.get(5)?,
                end: row.get(6)?,
            },
            metrics: serde_json::from_str(&metrics_json).unwrap_or(serde_json::Value::Null),
            assessment: assessment_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    8,
                    "assessment".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            confidence: row.get(9)?,
            provider: row.get(10)?,
            computed_at: row.get(11)?,
        })
    }

    pub fn list_for_change(
        conn: &Connection,
        change_id: i64,
    ) -> Result<Vec<Self>, WebPulseError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM change_checkpoints WHERE change_id = ? ORDER BY horizon_days ASC",
            Self::SELECT_COLS
        ))?;
        let checkpoints = stmt
            .query_map([change_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(checkpoints)
    }

    /// Insert a checkpoint unless one already exists for (change, horizon).
    /// Checkpoints are append-only; re-running a horizon is a no-op and
    /// the existing row is never rewritten.
    #[allow(clippy::too_many_arguments)]
    fn insert_if_absent(
        conn: &Connection,
        change_id: i64,
        horizon_days: i64,
        before: &MetricWindow,
        after: &MetricWindow,
        metrics: &serde_json::Value,
        assessment: Assessment,
        confidence: Option<f64>,
        provider: &str,
        now: i64,
    ) -> Result<Option<i64>, WebPulseError> {
        let result = conn.query_row(
            "INSERT INTO change_checkpoints
                (change_id, horizon_days, before_start, before_end, after_start, after_end,
                 metrics, assessment, confidence, provider, computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING checkpoint_id",
            params![
                change_id,
                horizon_days,
                before.start,
                before.end,
                after.start,
                after.end,
                metrics.to_string(),
                assessment.as_ref(),
                confidence,
                provider,
                now
            ],
            |row| row.get::<_, i64>(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                let err = WebPulseError::DatabaseError(e);
                if err.is_constraint_violation() {
                    debug!(
                        "Checkpoint for change {} at {}d already exists, skipping",
                        change_id, horizon_days
                    );
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Classify one metric's movement. Returns None when the before value
/// cannot anchor a percentage (zero or non-finite) — the metric simply
/// drops out, it does not fail the evaluation.
pub fn classify_metric(
    key: &str,
    before: f64,
    after: f64,
    neutral_band_percent: f64,
) -> Option<MetricAssessment> {
    if before == 0.0 || !before.is_finite() || !after.is_finite() {
        return None;
    }

    let change_percent = (after - before) / before * 100.0;

    let assessment = if change_percent.abs() <= neutral_band_percent {
        Assessment::Neutral
    } else {
        let went_up = change_percent > 0.0;
        match analytics::polarity(key) {
            MetricPolarity::HigherIsBetter if went_up => Assessment::Improved,
            MetricPolarity::HigherIsBetter => Assessment::Regressed,
            MetricPolarity::LowerIsBetter if went_up => Assessment::Regressed,
            MetricPolarity::LowerIsBetter => Assessment::Improved,
        }
    };

    Some(MetricAssessment {
        before,
        after,
        change_percent,
        assessment: assessment.to_string(),
    })
}

/// Combine per-metric assessments: improved if anything improved and
/// nothing regressed, regressed if the reverse, neutral when metrics exist
/// but cancel out, inconclusive with no usable metrics at all.
pub fn overall_assessment(metrics: &[MetricAssessment]) -> Assessment {
    if metrics.is_empty() {
        return Assessment::Inconclusive;
    }
    let any_improved = metrics.iter().any(|m| m.assessment == "improved");
    let any_regressed = metrics.iter().any(|m| m.assessment == "regressed");
    match (any_improved, any_regressed) {
        (true, false) => Assessment::Improved,
        (false, true) => Assessment::Regressed,
        _ => Assessment::Neutral,
    }
}

/// Heuristic confidence in [0, 1]: larger movement backed by more traffic
/// scores higher. The curve is a tunable, only the 0.8/0.5 attribution
/// bands are load-bearing downstream.
pub fn confidence_score(max_abs_change_percent: f64, sample_size: f64) -> f64 {
    const FULL_MAGNITUDE_PERCENT: f64 = 30.0;
    const FULL_VOLUME_SAMPLES: f64 = 500.0;

    let magnitude = (max_abs_change_percent.abs() / FULL_MAGNITUDE_PERCENT).min(1.0);
    let volume = (sample_size.max(0.0) / FULL_VOLUME_SAMPLES).min(1.0);
    (magnitude * volume).clamp(0.0, 1.0)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub evaluated: usize,
    pub written: usize,
    pub transitions: usize,
}

/// Evaluates due (change, horizon) pairs against the analytics provider
/// and applies the resulting lifecycle transitions.
///
/// Each pair is an independent unit of work; checkpoint writes are
/// append-only, so concurrent engine runs at worst redundantly skip an
/// already-written row.
pub struct CheckpointEngine<'a> {
    db: &'a Database,
    provider: &'a dyn AnalyticsProvider,
    neutral_band_percent: f64,
}

impl<'a> CheckpointEngine<'a> {
    pub fn new(
        db: &'a Database,
        provider: &'a dyn AnalyticsProvider,
        neutral_band_percent: f64,
    ) -> Self {
        CheckpointEngine {
            db,
            provider,
            neutral_band_percent,
        }
    }

    /// One engine pass over every due (change, horizon) pair.
    pub fn run(&self, now: i64) -> Result<EngineStats, WebPulseError> {
        let _tmr = timer!(Level::Debug; "CheckpointEngine::run");

        let mut stats = EngineStats::default();

        for horizon in HORIZON_DAYS {
            let due = self.due_changes(horizon, now)?;
            for (change_id, page_id, first_detected_at) in due {
                stats.evaluated += 1;
                self.evaluate(
                    change_id,
                    page_id,
                    first_detected_at,
                    horizon,
                    now,
                    &mut stats,
                )?;
            }
        }

        info!(
            "Checkpoint run: {} evaluated, {} written, {} transitions",
            stats.evaluated, stats.written, stats.transitions
        );
        Ok(stats)
    }

    /// Changes whose horizon has elapsed and which lack a checkpoint for
    /// it. Resolved changes keep accruing later horizons; reverted changes
    /// do not — the page no longer carries the change being measured.
    fn due_changes(
        &self,
        horizon: i64,
        now: i64,
    ) -> Result<Vec<(i64, i64, i64)>, WebPulseError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.change_id, c.page_id, c.first_detected_at
             FROM detected_changes c
             WHERE c.status != ?
               AND c.first_detected_at <= ?
               AND NOT EXISTS (
                   SELECT 1 FROM change_checkpoints cp
                   WHERE cp.change_id = c.change_id AND cp.horizon_days = ?
               )
             ORDER BY c.change_id ASC",
        )?;

        let due = stmt
            .query_map(
                params![
                    ChangeStatus::Reverted.as_ref(),
                    now - horizon * DAY_SECS,
                    horizon
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(due)
    }

    fn evaluate(
        &self,
        change_id: i64,
        page_id: i64,
        first_detected_at: i64,
        horizon: i64,
        now: i64,
        stats: &mut EngineStats,
    ) -> Result<(), WebPulseError> {
        let conn = self.db.conn()?;

        let before = MetricWindow {
            start: first_detected_at - horizon * DAY_SECS,
            end: first_detected_at,
        };
        let after = MetricWindow {
            start: first_detected_at,
            end: first_detected_at + horizon * DAY_SECS,
        };

        let before_metrics = self.provider.get_metrics(page_id, &before)?;
        let after_metrics = self.provider.get_metrics(page_id, &after)?;
        let connected = before_metrics != MetricsResult::NotConnected
            && after_metrics != MetricsResult::NotConnected;

        let (assessments, sample_size) = match (&before_metrics, &after_metrics) {
            (MetricsResult::Metrics(b), MetricsResult::Metrics(a)) => {
                let mut assessments: Vec<(String, MetricAssessment)> = Vec::new();
                for (key, before_value) in b {
                    let Some(after_value) = a.get(key) else {
                        continue;
                    };
                    if let Some(ma) = classify_metric(
                        key,
                        *before_value,
                        *after_value,
                        self.neutral_band_percent,
                    ) {
                        assessments.push((key.clone(), ma));
                    }
                }

                // Traffic volume backing the comparison: visitors when
                // reported, else the largest before-window value
                let sample = b
                    .get("visitors")
                    .copied()
                    .or_else(|| b.values().cloned().fold(None, |acc: Option<f64>, v| {
                        Some(acc.map_or(v, |a| a.max(v)))
                    }))
                    .unwrap_or(0.0);
                (assessments, sample)
            }
            // No adapter connected: a valid, terminal-for-this-horizon
            // outcome, not an error
            _ => (Vec::new(), 0.0),
        };

        let metric_values: Vec<MetricAssessment> =
            assessments.iter().map(|(_, m)| m.clone()).collect();
        let assessment = overall_assessment(&metric_values);

        let confidence = if metric_values.is_empty() {
            None
        } else {
            let max_abs = metric_values
                .iter()
                .map(|m| m.change_percent.abs())
                .fold(0.0_f64, f64::max);
            Some(confidence_score(max_abs, sample_size))
        };

        let metrics_json = serde_json::Value::Object(
            assessments
                .iter()
                .map(|(key, m)| {
                    (
                        key.clone(),
                        serde_json::to_value(m).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect(),
        );

        let checkpoint_id = ChangeCheckpoint::insert_if_absent(
            &conn,
            change_id,
            horizon,
            &before,
            &after,
            &metrics_json,
            assessment,
            confidence,
            self.provider.name(),
            now,
        )?;

        let Some(checkpoint_id) = checkpoint_id else {
            // A concurrent run won the race for this horizon
            return Ok(());
        };
        stats.written += 1;

        if !metric_values.is_empty() {
            DetectedChange::set_correlation_metrics(&conn, change_id, &metrics_json)?;
        }

        let change = DetectedChange::get_by_id(&conn, change_id)?
            .ok_or_else(|| WebPulseError::Error(format!("Change {} not found", change_id)))?;
        if change.status != ChangeStatus::Watching {
            return Ok(());
        }

        let to_status = match assessment {
            Assessment::Improved => Some(ChangeStatus::Validated),
            Assessment::Regressed => Some(ChangeStatus::Regressed),
            // Neutral/inconclusive keep watching until a later horizon; at
            // the last horizon there is nothing left to wait for. With no
            // adapter connected the change stays watching: connecting one
            // later is the owner's call, not a verdict on the change.
            Assessment::Neutral | Assessment::Inconclusive => {
                if connected && horizon == HORIZON_DAYS[HORIZON_DAYS.len() - 1] {
                    Some(ChangeStatus::Inconclusive)
                } else {
                    None
                }
            }
        };

        if let Some(to_status) = to_status {
            let reason = format!("{}d checkpoint assessed {}", horizon, assessment);
            DetectedChange::transition(
                &conn,
                change_id,
                to_status,
                &reason,
                ActorType::System,
                Some(checkpoint_id),
                now,
            )?;
            stats.transitions += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::test_utils::FixedAnalytics;
    use crate::analytics::{NullAnalytics, StoredMetrics};
    use crate::changes::test_utils::insert_change;
    use crate::database::test_utils::test_db;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_classify_metric_polarity_and_band() {
        // Bounce rate falling is an improvement
        let m = classify_metric("bounce_rate", 50.0, 35.0, 3.0).unwrap();
        assert_eq!(m.assessment, "improved");
        assert_eq!(m.change_percent, -30.0);

        // Conversions falling is a regression
        let m = classify_metric("conversions", 100.0, 80.0, 3.0).unwrap();
        assert_eq!(m.assessment, "regressed");

        // Within the neutral band
        let m = classify_metric("conversions", 100.0, 102.0, 3.0).unwrap();
        assert_eq!(m.assessment, "neutral");

        // Exactly on the band edge is still neutral
        let m = classify_metric("conversions", 100.0, 103.0, 3.0).unwrap();
        assert_eq!(m.assessment, "neutral");

        // Zero baseline cannot anchor a percentage
        assert!(classify_metric("conversions", 0.0, 10.0, 3.0).is_none());
    }

    #[test]
    fn test_overall_assessment_combinations() {
        let improved = MetricAssessment {
            before: 1.0,
            after: 2.0,
            change_percent: 100.0,
            assessment: "improved".to_string(),
        };
        let regressed = MetricAssessment {
            assessment: "regressed".to_string(),
            ..improved.clone()
        };
        let neutral = MetricAssessment {
            assessment: "neutral".to_string(),
            ..improved.clone()
        };

        assert_eq!(overall_assessment(&[]), Assessment::Inconclusive);
        assert_eq!(
            overall_assessment(&[improved.clone(), neutral.clone()]),
            Assessment::Improved
        );
        assert_eq!(
            overall_assessment(&[regressed.clone(), neutral.clone()]),
            Assessment::Regressed
        );
        assert_eq!(
            overall_assessment(&[improved.clone(), regressed.clone()]),
            Assessment::Neutral
        );
        assert_eq!(overall_assessment(&[neutral]), Assessment::Neutral);
    }

    #[test]
    fn test_confidence_score_shape() {
        // Big move, big traffic
        assert!(confidence_score(30.0, 500.0) >= 0.8);
        // Big move, tiny traffic
        assert!(confidence_score(30.0, 10.0) < 0.5);
        // Tiny move, big traffic
        assert!(confidence_score(1.0, 10_000.0) < 0.5);
        // Clamped
        assert!(confidence_score(500.0, 1_000_000.0) <= 1.0);
        assert_eq!(confidence_score(0.0, 0.0), 0.0);
    }

    fn windowed(
        first_detected_at: i64,
        horizon: i64,
        before: &[(&str, f64)],
        after: &[(&str, f64)],
    ) -> FixedAnalytics {
        let mk = |vals: &[(&str, f64)]| {
            MetricsResult::Metrics(
                vals.iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect::<BTreeMap<_, _>>(),
            )
        };
        FixedAnalytics {
            windows: vec![
                (
                    MetricWindow {
                        start: first_detected_at - horizon * DAY_SECS,
                        end: first_detected_at,
                    },
                    mk(before),
                ),
                (
                    MetricWindow {
                        start: first_detected_at,
                        end: first_detected_at + horizon * DAY_SECS,
                    },
                    mk(after),
                ),
            ],
        }
    }

    #[test]
    fn test_improvement_validates_change_with_high_confidence() {
        let (_dir, db) = test_db();
        let detected = NOW - 14 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#hero-cta", detected);

        // Bounce rate 50 -> 35 with healthy traffic, at both 7d and 14d
        let mut windows = Vec::new();
        for horizon in [7, 14] {
            windows.extend(
                windowed(
                    detected,
                    horizon,
                    &[("bounce_rate", 50.0), ("visitors", 800.0)],
                    &[("bounce_rate", 35.0), ("visitors", 820.0)],
                )
                .windows,
            );
        }
        let provider = FixedAnalytics { windows };

        let engine = CheckpointEngine::new(&db, &provider, 3.0);
        let stats = engine.run(NOW).unwrap();

        // 7d and 14d horizons were both due
        assert_eq!(stats.written, 2);
        assert_eq!(stats.transitions, 1);

        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Validated);
        assert!(change.correlation_metrics.is_some());

        let checkpoints = ChangeCheckpoint::list_for_change(&conn, change_id).unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].horizon_days, 7);
        assert_eq!(checkpoints[0].assessment, Assessment::Improved);
        assert!(checkpoints[0].confidence.unwrap() >= 0.8);
    }

    #[test]
    fn test_not_connected_writes_inconclusive_and_keeps_watching() {
        let (_dir, db) = test_db();
        let detected = NOW - 7 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#hero-cta", detected);

        let engine = CheckpointEngine::new(&db, &NullAnalytics, 3.0);
        let stats = engine.run(NOW).unwrap();

        assert_eq!(stats.written, 1);
        assert_eq!(stats.transitions, 0);

        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Watching);

        let checkpoints = ChangeCheckpoint::list_for_change(&conn, change_id).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].assessment, Assessment::Inconclusive);
        assert_eq!(checkpoints[0].confidence, None);
    }

    #[test]
    fn test_rerun_does_not_duplicate_checkpoints() {
        let (_dir, db) = test_db();
        let detected = NOW - 7 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#hero-cta", detected);

        let engine = CheckpointEngine::new(&db, &NullAnalytics, 3.0);
        engine.run(NOW).unwrap();
        let second = engine.run(NOW).unwrap();

        assert_eq!(second.written, 0);

        let conn = db.conn().unwrap();
        let checkpoints = ChangeCheckpoint::list_for_change(&conn, change_id).unwrap();
        assert_eq!(checkpoints.len(), 1);
    }

    #[test]
    fn test_regression_transitions_to_regressed() {
        let (_dir, db) = test_db();
        let detected = NOW - 7 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#pricing-table", detected);

        let provider = windowed(
            detected,
            7,
            &[("conversions", 200.0), ("visitors", 1000.0)],
            &[("conversions", 120.0), ("visitors", 1000.0)],
        );
        let engine = CheckpointEngine::new(&db, &provider, 3.0);
        engine.run(NOW).unwrap();

        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Regressed);
    }

    #[test]
    fn test_resolved_change_accrues_later_checkpoints_without_reopening() {
        let (_dir, db) = test_db();
        let detected = NOW - 30 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#hero-cta", detected);

        // Improvement at 7/14d, regression at 30d
        let mut windows = Vec::new();
        for horizon in [7, 14] {
            windows.extend(
                windowed(
                    detected,
                    horizon,
                    &[("bounce_rate", 50.0), ("visitors", 800.0)],
                    &[("bounce_rate", 35.0), ("visitors", 820.0)],
                )
                .windows,
            );
        }
        windows.extend(
            windowed(
                detected,
                30,
                &[("bounce_rate", 50.0), ("visitors", 800.0)],
                &[("bounce_rate", 70.0), ("visitors", 790.0)],
            )
            .windows,
        );
        let provider = FixedAnalytics { windows };

        let engine = CheckpointEngine::new(&db, &provider, 3.0);
        engine.run(NOW).unwrap();

        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        // Resolved at the first improving horizon; the later regressing
        // checkpoint is recorded but does not reopen the status
        assert_eq!(change.status, ChangeStatus::Validated);

        let checkpoints = ChangeCheckpoint::list_for_change(&conn, change_id).unwrap();
        assert_eq!(checkpoints.len(), 3);
        assert_eq!(checkpoints[2].assessment, Assessment::Regressed);
    }

    #[test]
    fn test_final_horizon_without_signal_resolves_inconclusive() {
        let (_dir, db) = test_db();
        let detected = NOW - 90 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#footer", detected);

        // Connected provider with no usable metrics in any window
        let provider = FixedAnalytics { windows: Vec::new() };
        let engine = CheckpointEngine::new(&db, &provider, 3.0);
        engine.run(NOW).unwrap();

        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Inconclusive);

        let checkpoints = ChangeCheckpoint::list_for_change(&conn, change_id).unwrap();
        assert_eq!(checkpoints.len(), HORIZON_DAYS.len());
    }

    #[test]
    fn test_final_horizon_not_connected_keeps_watching() {
        let (_dir, db) = test_db();
        let detected = NOW - 90 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#footer", detected);

        // No adapter at all: every horizon records an inconclusive
        // checkpoint but the change is never force-resolved
        let engine = CheckpointEngine::new(&db, &NullAnalytics, 3.0);
        engine.run(NOW).unwrap();

        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Watching);

        let checkpoints = ChangeCheckpoint::list_for_change(&conn, change_id).unwrap();
        assert_eq!(checkpoints.len(), HORIZON_DAYS.len());
    }

    #[test]
    fn test_reverted_change_not_evaluated() {
        let (_dir, db) = test_db();
        let detected = NOW - 7 * DAY_SECS;
        let change_id = insert_change(&db, 1, 1, "#hero-cta", detected);
        {
            let conn = db.conn().unwrap();
            DetectedChange::transition(
                &conn,
                change_id,
                ChangeStatus::Reverted,
                "undone",
                ActorType::System,
                None,
                NOW - DAY_SECS,
            )
            .unwrap();
        }

        let engine = CheckpointEngine::new(&db, &NullAnalytics, 3.0);
        let stats = engine.run(NOW).unwrap();
        assert_eq!(stats.evaluated, 0);
        assert_eq!(stats.written, 0);
    }

    #[test]
    fn test_stored_provider_end_to_end() {
        let (_dir, db) = test_db();
        let detected = NOW - 7 * DAY_SECS;
        let change_id = insert_change(&db, 3, 1, "#cta", detected);

        {
            let conn = db.conn().unwrap();
            // Before window: high bounce, after window: low bounce
            StoredMetrics::record_sample(&conn, 3, "bounce_rate", detected - DAY_SECS, 60.0)
                .unwrap();
            StoredMetrics::record_sample(&conn, 3, "visitors", detected - DAY_SECS, 900.0)
                .unwrap();
            StoredMetrics::record_sample(&conn, 3, "bounce_rate", detected + DAY_SECS, 40.0)
                .unwrap();
            StoredMetrics::record_sample(&conn, 3, "visitors", detected + DAY_SECS, 950.0)
                .unwrap();
        }

        let provider = StoredMetrics::new(db.clone());
        let engine = CheckpointEngine::new(&db, &provider, 3.0);
        let stats = engine.run(NOW).unwrap();

        assert_eq!(stats.written, 1);
        let conn = db.conn().unwrap();
        let change = DetectedChange::get_by_id(&conn, change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Validated);
    }
}
