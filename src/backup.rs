use log::{error, info, warn, Level};
use logging_timer::timer;

use crate::billing::TierResolver;
use crate::database::Database;
use crate::error::WebPulseError;
use crate::queue::{ScanRequested, WorkQueue, SCAN_REQUESTED};
use crate::scans::{day_key, ScanJob, TriggerType};
use crate::scheduler::due_candidates;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupStats {
    pub resynced: bool,
    pub backfilled: usize,
    pub recovered: usize,
    pub failures: usize,
}

/// Secondary periodic process that repairs the primary scheduler's
/// omissions. Runs after the scheduler, offset far enough for the primary
/// path to have completed under normal conditions.
///
/// Every operation here is "create if absent" or "re-announce an existing
/// row", so redundant invocations (a scheduled backup plus a later
/// watchdog) are safe.
pub struct BackupRunner<'a> {
    db: &'a Database,
    queue: &'a dyn WorkQueue,
    resolver: &'a dyn TierResolver,
    lookback_secs: i64,
    stale_after_secs: i64,
}

impl<'a> BackupRunner<'a> {
    pub fn new(
        db: &'a Database,
        queue: &'a dyn WorkQueue,
        resolver: &'a dyn TierResolver,
        lookback_secs: i64,
        stale_after_secs: i64,
    ) -> Self {
        BackupRunner {
            db,
            queue,
            resolver,
            lookback_secs,
            stale_after_secs,
        }
    }

    /// One backup pass: re-sync the queue binding, backfill missed jobs,
    /// recover stale pending jobs. All three run unconditionally.
    pub fn run(&self, now: i64) -> Result<BackupStats, WebPulseError> {
        let _tmr = timer!(Level::Debug; "BackupRunner::run");

        let mut stats = BackupStats::default();

        // 1. Re-sync: a stale deployment must never silently drop due
        //    events. Failure here is reported but does not block backfill.
        match self.queue.ensure_subscription() {
            Ok(()) => stats.resynced = true,
            Err(e) => {
                error!("Queue re-sync failed: {}", e);
                stats.failures += 1;
            }
        }

        // 2. Backfill: re-derive the due set and create whatever the
        //    primary run missed.
        for trigger in [TriggerType::Daily, TriggerType::Weekly] {
            self.backfill(trigger, now, &mut stats)?;
        }

        // 3. Recover jobs stuck in pending.
        self.recover_stale(now, &mut stats)?;

        info!(
            "Backup run: resynced={}, {} backfilled, {} recovered, {} failures",
            stats.resynced, stats.backfilled, stats.recovered, stats.failures
        );
        Ok(stats)
    }

    fn backfill(
        &self,
        trigger: TriggerType,
        now: i64,
        stats: &mut BackupStats,
    ) -> Result<(), WebPulseError> {
        let conn = self.db.conn()?;
        let candidates = due_candidates(&conn, self.resolver, trigger, now)?;

        for candidate in &candidates {
            let day = day_key(now, candidate.tz_offset_minutes);
            if ScanJob::exists_for_day(&conn, candidate.owner_id, &candidate.url, trigger, &day)? {
                continue;
            }

            // Same idempotency key as the primary path: a concurrent run's
            // just-created row surfaces as Ok(None) and counts as satisfied
            let created = ScanJob::create_pending(
                &conn,
                Some(candidate.owner_id),
                &candidate.url,
                trigger,
                candidate.latest_scan_id,
                candidate.tz_offset_minutes,
                now,
            )?;

            let scan_id = match created {
                Some(id) => id,
                None => continue,
            };

            warn!(
                "Backfilling missed {} scan {} for {}",
                trigger, scan_id, candidate.url
            );
            stats.backfilled += 1;

            let payload = ScanRequested {
                scan_id,
                url: candidate.url.clone(),
                parent_scan_id: candidate.latest_scan_id,
            };
            if let Err(e) = self.queue.enqueue(SCAN_REQUESTED, &payload) {
                error!("Failed to enqueue backfilled scan {}: {}", scan_id, e);
                stats.failures += 1;
            }
        }

        Ok(())
    }

    /// Re-announce scheduled jobs stuck in pending past the staleness
    /// threshold. No new rows are created; each re-emit failure is isolated
    /// to its job.
    fn recover_stale(&self, now: i64, stats: &mut BackupStats) -> Result<(), WebPulseError> {
        let conn = self.db.conn()?;
        let stale =
            ScanJob::stale_pending(&conn, now, self.lookback_secs, self.stale_after_secs)?;

        for job in &stale {
            let payload = ScanRequested {
                scan_id: job.scan_id,
                url: job.url.clone(),
                parent_scan_id: job.parent_scan_id,
            };
            match self.queue.enqueue(SCAN_REQUESTED, &payload) {
                Ok(()) => {
                    warn!(
                        "Re-announced stale pending scan {} for {} (created {})",
                        job.scan_id, job.url, job.created_at
                    );
                    stats.recovered += 1;
                }
                Err(e) => {
                    error!("Failed to re-announce scan {}: {}", job.scan_id, e);
                    stats.failures += 1;
                }
            }
        }

        Ok(())
    }
}
