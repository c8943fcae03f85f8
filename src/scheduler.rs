use std::collections::HashMap;

use chrono::{Datelike, FixedOffset, TimeZone, Utc};
use log::{error, info, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::billing::TierResolver;
use crate::database::Database;
use crate::error::WebPulseError;
use crate::queue::{ScanRequested, WorkQueue, SCAN_REQUESTED};
use crate::scans::{day_key, ScanJob, TriggerType};
use crate::tiers::{self, ScanFrequency};

/// A page due for scanning on the current run.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub page_id: i64,
    pub owner_id: i64,
    pub url: String,
    pub latest_scan_id: Option<i64>,
    pub created_at: i64,
    pub tz_offset_minutes: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub candidates: usize,
    pub created: usize,
    pub already_satisfied: usize,
    pub enqueue_failures: usize,
}

/// Decides which pages get a scan job on a scheduled run and creates the
/// jobs idempotently. Dependencies (store, queue, tier resolver) are
/// injected at construction.
pub struct ScanScheduler<'a> {
    db: &'a Database,
    queue: &'a dyn WorkQueue,
    resolver: &'a dyn TierResolver,
}

impl<'a> ScanScheduler<'a> {
    pub fn new(db: &'a Database, queue: &'a dyn WorkQueue, resolver: &'a dyn TierResolver) -> Self {
        ScanScheduler { db, queue, resolver }
    }

    /// One scheduled run for the given trigger (daily or weekly).
    ///
    /// An enqueue failure for one page never aborts the rest of the batch;
    /// the job row stays pending and the backup runner re-announces it.
    pub fn run(&self, trigger: TriggerType, now: i64) -> Result<SchedulerStats, WebPulseError> {
        let _tmr = timer!(Level::Debug; "ScanScheduler::run");

        if !trigger.is_scheduled() {
            return Err(WebPulseError::Error(format!(
                "Trigger '{}' is not a scheduled trigger",
                trigger
            )));
        }

        let conn = self.db.conn()?;
        let candidates = due_candidates(&conn, self.resolver, trigger, now)?;

        let mut stats = SchedulerStats {
            candidates: candidates.len(),
            ..SchedulerStats::default()
        };

        for candidate in &candidates {
            let day = day_key(now, candidate.tz_offset_minutes);
            if ScanJob::exists_for_day(&conn, candidate.owner_id, &candidate.url, trigger, &day)? {
                stats.already_satisfied += 1;
                continue;
            }

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
                None => {
                    // Lost a race with a concurrent run; the winner's row
                    // satisfies today's cadence
                    stats.already_satisfied += 1;
                    continue;
                }
            };
            stats.created += 1;

            let payload = ScanRequested {
                scan_id,
                url: candidate.url.clone(),
                parent_scan_id: candidate.latest_scan_id,
            };
            if let Err(e) = self.queue.enqueue(SCAN_REQUESTED, &payload) {
                // Left pending for the backup runner's stale-recovery pass
                error!(
                    "Failed to enqueue scan {} for {}: {}",
                    scan_id, candidate.url, e
                );
                stats.enqueue_failures += 1;
            }
        }

        info!(
            "{} run: {} candidates, {} created, {} already satisfied, {} enqueue failures",
            trigger, stats.candidates, stats.created, stats.already_satisfied, stats.enqueue_failures
        );
        Ok(stats)
    }
}

/// Re-derive the due set for a run: every page whose tier-capped cadence
/// matches the trigger, trimmed to each owner's page quota.
///
/// Shared by the scheduler and the backup runner so that backfill sees
/// exactly the same candidates as the primary path.
pub fn due_candidates(
    conn: &Connection,
    resolver: &dyn TierResolver,
    trigger: TriggerType,
    now: i64,
) -> Result<Vec<Candidate>, WebPulseError> {
    let mut stmt = conn.prepare(
        "SELECT p.page_id, p.owner_id, p.url, p.scan_frequency, p.latest_scan_id,
                p.created_at, o.timezone_offset_minutes
         FROM pages p
         JOIN owners o ON o.owner_id = p.owner_id
         WHERE p.scan_frequency != 'manual'
         ORDER BY p.owner_id ASC, p.created_at ASC, p.page_id ASC",
    )?;

    struct RawPage {
        candidate: Candidate,
        frequency: ScanFrequency,
    }

    let raw_pages = stmt
        .query_map([], |row| {
            let freq_str: String = row.get(3)?;
            Ok((
                Candidate {
                    page_id: row.get(0)?,
                    owner_id: row.get(1)?,
                    url: row.get(2)?,
                    latest_scan_id: row.get(4)?,
                    created_at: row.get(5)?,
                    tz_offset_minutes: row.get(6)?,
                },
                freq_str,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let raw_pages: Vec<RawPage> = raw_pages
        .into_iter()
        .filter_map(|(candidate, freq_str)| {
            freq_str
                .parse::<ScanFrequency>()
                .ok()
                .map(|frequency| RawPage { candidate, frequency })
        })
        .collect();

    let mut owner_ids: Vec<i64> = raw_pages.iter().map(|p| p.candidate.owner_id).collect();
    owner_ids.sort_unstable();
    owner_ids.dedup();

    let tiers_by_owner = resolver.resolve(conn, &owner_ids, now)?;

    let wanted = match trigger {
        TriggerType::Daily => ScanFrequency::Daily,
        TriggerType::Weekly => ScanFrequency::Weekly,
        _ => {
            return Err(WebPulseError::Error(format!(
                "Trigger '{}' has no candidate set",
                trigger
            )))
        }
    };

    // Rows are owner-grouped and creation-ordered, so the quota cut keeps
    // each owner's oldest candidate pages even if the limit shrank after
    // the pages were created
    let mut kept_per_owner: HashMap<i64, usize> = HashMap::new();
    let mut candidates = Vec::new();

    for page in raw_pages {
        let owner_id = page.candidate.owner_id;
        let tier = match tiers_by_owner.get(&owner_id) {
            Some(t) => *t,
            None => continue,
        };

        if tiers::effective_frequency(page.frequency, tier) != wanted {
            continue;
        }

        // Weekly pages run on their anchor weekday: the weekday the page
        // was registered, in the owner's timezone
        if wanted == ScanFrequency::Weekly
            && local_weekday(page.candidate.created_at, page.candidate.tz_offset_minutes)
                != local_weekday(now, page.candidate.tz_offset_minutes)
        {
            continue;
        }

        let kept = kept_per_owner.entry(owner_id).or_insert(0);
        if *kept >= tiers::page_limit(tier) {
            continue;
        }
        *kept += 1;

        candidates.push(page.candidate);
    }

    Ok(candidates)
}

fn local_weekday(ts: i64, tz_offset_minutes: i64) -> chrono::Weekday {
    let offset = FixedOffset::east_opt((tz_offset_minutes * 60) as i32)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"))
        .with_timezone(&offset)
        .weekday()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::test_utils::FixedTierResolver;
    use crate::billing::StoredTierResolver;
    use crate::database::test_utils::{insert_billing, insert_owner, test_db};
    use crate::pages::test_utils::insert_page;
    use crate::queue::test_utils::RecordingQueue;
    use crate::scans::ScanStatus;
    use crate::tiers::Tier;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_000;
    const WEEK: i64 = 7 * 86_400;

    fn count_jobs(db: &Database) -> i64 {
        let conn = db.conn().unwrap();
        conn.query_row("SELECT COUNT(*) FROM scan_jobs", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_daily_run_is_idempotent() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        insert_page(&db, 1, "example.com", ScanFrequency::Daily, NOW - WEEK);

        let queue = RecordingQueue::new();
        let resolver = FixedTierResolver(Tier::Pro);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        let first = scheduler.run(TriggerType::Daily, NOW).unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(queue.events.borrow().len(), 1);

        // Second run on the same day creates nothing
        let second = scheduler.run(TriggerType::Daily, NOW + 3600).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.already_satisfied, 1);
        assert_eq!(count_jobs(&db), 1);
        assert_eq!(queue.events.borrow().len(), 1);
    }

    #[test]
    fn test_quota_caps_jobs_per_owner() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        // 3 daily pages on a free-tier-equivalent limit of 1
        insert_page(&db, 1, "example.com/a", ScanFrequency::Weekly, NOW - 3 * WEEK);
        insert_page(&db, 1, "example.com/b", ScanFrequency::Weekly, NOW - 2 * WEEK);
        insert_page(&db, 1, "example.com/c", ScanFrequency::Weekly, NOW - WEEK);

        let queue = RecordingQueue::new();
        let resolver = FixedTierResolver(Tier::Free);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        // All three share the anchor weekday of `now`
        let stats = scheduler.run(TriggerType::Weekly, NOW).unwrap();

        // Only the oldest page survives the quota cut
        assert_eq!(stats.created, 1);
        let conn = db.conn().unwrap();
        let url: String = conn
            .query_row("SELECT url FROM scan_jobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(url, "https://example.com/a");
    }

    #[test]
    fn test_tier_downgrade_moves_page_to_weekly_run() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        insert_owner(&db, 2, "b@example.com", 0);
        insert_billing(&db, 1, "pro", "active", None);
        insert_billing(&db, 2, "pro", "past_due", None);
        insert_page(&db, 1, "example.com/paid", ScanFrequency::Daily, NOW - WEEK);
        insert_page(&db, 2, "example.com/lapsed", ScanFrequency::Daily, NOW - WEEK);

        let queue = RecordingQueue::new();
        let resolver = StoredTierResolver;
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        let stats = scheduler.run(TriggerType::Daily, NOW).unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(queue.events.borrow()[0].1.url, "https://example.com/paid");

        // The lapsed owner's page runs on the weekly cadence instead
        let stats = scheduler.run(TriggerType::Weekly, NOW).unwrap();
        assert_eq!(stats.created, 1);
    }

    #[test]
    fn test_weekly_anchor_day_filter() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        // Registered exactly N weeks ago: same weekday as `now`
        insert_page(&db, 1, "example.com/due", ScanFrequency::Weekly, NOW - 2 * WEEK);
        // Registered on a different weekday
        insert_page(&db, 1, "example.com/notyet", ScanFrequency::Weekly, NOW - WEEK - 86_400);

        let queue = RecordingQueue::new();
        let resolver = FixedTierResolver(Tier::Pro);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        let stats = scheduler.run(TriggerType::Weekly, NOW).unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(queue.events.borrow()[0].1.url, "https://example.com/due");
    }

    #[test]
    fn test_enqueue_failure_does_not_abort_batch() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        insert_page(&db, 1, "example.com/a", ScanFrequency::Daily, NOW - 3 * WEEK);
        insert_page(&db, 1, "example.com/b", ScanFrequency::Daily, NOW - 2 * WEEK);
        insert_page(&db, 1, "example.com/c", ScanFrequency::Daily, NOW - WEEK);

        let queue = RecordingQueue::failing_on(&["https://example.com/b"]);
        let resolver = FixedTierResolver(Tier::Pro);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        let stats = scheduler.run(TriggerType::Daily, NOW).unwrap();
        assert_eq!(stats.created, 3);
        assert_eq!(stats.enqueue_failures, 1);
        // The failed page's job row still exists, pending, for the backup
        // runner to re-announce
        assert_eq!(count_jobs(&db), 3);
        assert_eq!(queue.events.borrow().len(), 2);

        let conn = db.conn().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM scan_jobs WHERE url = 'https://example.com/b'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, ScanStatus::Pending.as_ref());
    }

    #[test]
    fn test_manual_pages_never_scheduled() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        insert_page(&db, 1, "example.com", ScanFrequency::Manual, NOW - WEEK);

        let queue = RecordingQueue::new();
        let resolver = FixedTierResolver(Tier::Pro);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        let daily = scheduler.run(TriggerType::Daily, NOW).unwrap();
        let weekly = scheduler.run(TriggerType::Weekly, NOW).unwrap();
        assert_eq!(daily.candidates, 0);
        assert_eq!(weekly.candidates, 0);
        assert_eq!(count_jobs(&db), 0);
    }

    #[test]
    fn test_run_rejects_unscheduled_trigger() {
        let (_dir, db) = test_db();
        let queue = RecordingQueue::new();
        let resolver = FixedTierResolver(Tier::Pro);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);

        assert!(scheduler.run(TriggerType::Manual, NOW).is_err());
        assert!(scheduler.run(TriggerType::Deploy, NOW).is_err());
    }

    #[test]
    fn test_parent_scan_pointer_carried_into_job() {
        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        let page_id = insert_page(&db, 1, "example.com", ScanFrequency::Daily, NOW - WEEK);
        {
            let conn = db.conn().unwrap();
            conn.execute(
                "UPDATE pages SET latest_scan_id = 41 WHERE page_id = ?",
                [page_id],
            )
            .unwrap();
        }

        let queue = RecordingQueue::new();
        let resolver = FixedTierResolver(Tier::Pro);
        let scheduler = ScanScheduler::new(&db, &queue, &resolver);
        scheduler.run(TriggerType::Daily, NOW).unwrap();

        let events = queue.events.borrow();
        assert_eq!(events[0].1.parent_scan_id, Some(41));

        let conn = db.conn().unwrap();
        let parent: Option<i64> = conn
            .query_row("SELECT parent_scan_id FROM scan_jobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(parent, Some(41));
    }
}
