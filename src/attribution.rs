use std::collections::BTreeMap;

use crate::analytics;
use crate::changes::ChangeStatus;
use crate::checkpoints::{ChangeCheckpoint, MetricAssessment};

/// Which way a metric moved over the measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn word(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Confidence band boundaries (inclusive lower bound). Only these two
/// thresholds are contractual; the confidence curve itself is a tunable.
const DIRECT_CLAIM_MIN: f64 = 0.8;
const HEDGED_CLAIM_MIN: f64 = 0.5;

/// Render a confidence-banded summary of a checkpoint's outcome.
///
/// The copy asserts correlation only, never causation — "caused" and
/// "because of" must never appear. Returns None when any of metric,
/// direction, or change percent is absent; callers fall back to other
/// copy. A missing confidence is treated as zero.
pub fn format_outcome_text(
    status: ChangeStatus,
    confidence: Option<f64>,
    metric_key: Option<&str>,
    direction: Option<Direction>,
    change_percent: Option<f64>,
) -> Option<String> {
    let metric_key = metric_key?;
    let direction = direction?;
    let change_percent = change_percent?;

    let metric = analytics::display_name(metric_key);
    let pct = format!("{:.1}%", change_percent.abs());
    let confidence = confidence.unwrap_or(0.0);

    let text = if confidence >= DIRECT_CLAIM_MIN {
        let verdict = match status {
            ChangeStatus::Regressed => "Your change hurt",
            _ => "Your change helped",
        };
        format!(
            "{} — {} is {} {} since you made it.",
            verdict,
            metric,
            direction.word(),
            pct
        )
    } else if confidence >= HEDGED_CLAIM_MIN {
        format!(
            "Since your change, {} is {} {}. Likely connected.",
            metric,
            direction.word(),
            pct
        )
    } else {
        format!(
            "We're seeing {} movement, but can't tie it clearly to your change yet.",
            metric
        )
    };

    Some(text)
}

/// Summarize a checkpoint as user-facing copy, keyed off the metric with
/// the largest recorded movement. None when the checkpoint has no usable
/// metrics.
pub fn summarize_checkpoint(
    status: ChangeStatus,
    checkpoint: &ChangeCheckpoint,
) -> Option<String> {
    let metrics: BTreeMap<String, MetricAssessment> =
        serde_json::from_value(checkpoint.metrics.clone()).ok()?;
    let (key, m) = metrics.iter().max_by(|a, b| {
        a.1.change_percent
            .abs()
            .total_cmp(&b.1.change_percent.abs())
    })?;

    let direction = if m.change_percent > 0.0 {
        Direction::Up
    } else {
        Direction::Down
    };

    format_outcome_text(
        status,
        checkpoint.confidence,
        Some(key),
        Some(direction),
        Some(m.change_percent),
    )
}
