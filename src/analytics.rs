use std::collections::BTreeMap;

use rusqlite::{params, Connection};

use crate::database::Database;
use crate::error::WebPulseError;

/// Half-open time window `[start, end)` over which metrics are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricWindow {
    pub start: i64,
    pub end: i64,
}

/// Result of asking a provider for a window's metrics.
///
/// Partial or missing data surfaces as fewer metrics, never as an error;
/// `NotConnected` means the page has no analytics integration at all.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsResult {
    NotConnected,
    Metrics(BTreeMap<String, f64>),
}

/// One analytics integration. Implementations must not fail on partial
/// data.
pub trait AnalyticsProvider {
    fn name(&self) -> &str;

    fn get_metrics(
        &self,
        page_id: i64,
        window: &MetricWindow,
    ) -> Result<MetricsResult, WebPulseError>;
}

/// Whether a metric moving up is good news.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricPolarity {
    HigherIsBetter,
    LowerIsBetter,
}

/// How samples of a metric combine over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    /// Event counts: summed over the window (visitors, conversions).
    Count,
    /// Rates and durations: averaged over the window (bounce rate).
    Rate,
}

struct MetricInfo {
    polarity: MetricPolarity,
    kind: MetricKind,
    display: &'static str,
}

fn metric_info(key: &str) -> Option<MetricInfo> {
    let info = match key {
        "visitors" => MetricInfo {
            polarity: MetricPolarity::HigherIsBetter,
            kind: MetricKind::Count,
            display: "visitors",
        },
        "pageviews" => MetricInfo {
            polarity: MetricPolarity::HigherIsBetter,
            kind: MetricKind::Count,
            display: "pageviews",
        },
        "conversions" => MetricInfo {
            polarity: MetricPolarity::HigherIsBetter,
            kind: MetricKind::Count,
            display: "conversions",
        },
        "revenue" => MetricInfo {
            polarity: MetricPolarity::HigherIsBetter,
            kind: MetricKind::Count,
            display: "revenue",
        },
        "conversion_rate" => MetricInfo {
            polarity: MetricPolarity::HigherIsBetter,
            kind: MetricKind::Rate,
            display: "conversion rate",
        },
        "engagement_time" => MetricInfo {
            polarity: MetricPolarity::HigherIsBetter,
            kind: MetricKind::Rate,
            display: "engagement time",
        },
        "bounce_rate" => MetricInfo {
            polarity: MetricPolarity::LowerIsBetter,
            kind: MetricKind::Rate,
            display: "bounce rate",
        },
        "exit_rate" => MetricInfo {
            polarity: MetricPolarity::LowerIsBetter,
            kind: MetricKind::Rate,
            display: "exit rate",
        },
        "load_time" => MetricInfo {
            polarity: MetricPolarity::LowerIsBetter,
            kind: MetricKind::Rate,
            display: "load time",
        },
        _ => return None,
    };
    Some(info)
}

/// Polarity for a metric key. Unknown metrics default to higher-is-better.
pub fn polarity(key: &str) -> MetricPolarity {
    metric_info(key)
        .map(|i| i.polarity)
        .unwrap_or(MetricPolarity::HigherIsBetter)
}

/// Human-readable name for a metric key. Unknown keys fall back to the raw
/// key string.
pub fn display_name(key: &str) -> &str {
    match metric_info(key) {
        Some(info) => info.display,
        None => key,
    }
}

/// Provider for pages with no analytics integration.
pub struct NullAnalytics;

impl AnalyticsProvider for NullAnalytics {
    fn name(&self) -> &str {
        "none"
    }

    fn get_metrics(
        &self,
        _page_id: i64,
        _window: &MetricWindow,
    ) -> Result<MetricsResult, WebPulseError> {
        Ok(MetricsResult::NotConnected)
    }
}

/// Provider backed by the local page_metrics sample table. A page with no
/// samples at all is treated as not connected.
pub struct StoredMetrics {
    db: Database,
}

impl StoredMetrics {
    pub fn new(db: Database) -> Self {
        StoredMetrics { db }
    }

    /// Record one sample. Used by provider sync jobs and tests.
    pub fn record_sample(
        conn: &Connection,
        page_id: i64,
        metric: &str,
        sampled_at: i64,
        value: f64,
    ) -> Result<(), WebPulseError> {
        conn.execute(
            "INSERT INTO page_metrics (page_id, metric, sampled_at, value) VALUES (?, ?, ?, ?)",
            params![page_id, metric, sampled_at, value],
        )?;
        Ok(())
    }
}

impl AnalyticsProvider for StoredMetrics {
    fn name(&self) -> &str {
        "stored"
    }

    fn get_metrics(
        &self,
        page_id: i64,
        window: &MetricWindow,
    ) -> Result<MetricsResult, WebPulseError> {
        let conn = self.db.conn()?;

        let connected: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM page_metrics WHERE page_id = ?)",
            [page_id],
            |row| row.get(0),
        )?;
        if !connected {
            return Ok(MetricsResult::NotConnected);
        }

        let mut stmt = conn.prepare(
            "SELECT metric, SUM(value), AVG(value)
             FROM page_metrics
             WHERE page_id = ? AND sampled_at >= ? AND sampled_at < ?
             GROUP BY metric",
        )?;

        let mut metrics = BTreeMap::new();
        let mut rows = stmt.query(params![page_id, window.start, window.end])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let sum: f64 = row.get(1)?;
            let avg: f64 = row.get(2)?;

            let kind = metric_info(&key).map(|i| i.kind).unwrap_or(MetricKind::Count);
            let value = match kind {
                MetricKind::Count => sum,
                MetricKind::Rate => avg,
            };
            metrics.insert(key, value);
        }

        Ok(MetricsResult::Metrics(metrics))
    }
}
