use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use log::info;

use crate::analytics::StoredMetrics;
use crate::attention;
use crate::attribution;
use crate::backup::BackupRunner;
use crate::billing::StoredTierResolver;
use crate::changes::{
    ActorType, ChangeLifecycleEvent, ChangeScope, ChangeStatus, DetectedChange, NewChange,
};
use crate::checkpoints::{ChangeCheckpoint, CheckpointEngine};
use crate::config::CONFIG;
use crate::database::Database;
use crate::error::WebPulseError;
use crate::pages::MonitoredPage;
use crate::queue::{OutboxQueue, ScanRequested, WorkQueue, SCAN_REQUESTED};
use crate::scans::{ScanJob, ScanStatus, TriggerType};
use crate::scheduler::ScanScheduler;
use crate::suggestions::{Impact, SuggestionStatus, TrackedSuggestion};
use crate::tiers::ScanFrequency;

#[derive(Parser)]
#[command(name = "webpulse", version, about = "Web page change monitor and correlation engine")]
pub struct Cli {
    /// Database file directory
    #[arg(long = "dbpath", short = 'd', global = true, default_value = ".")]
    dbpath: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage owner identity/billing snapshots
    Owner {
        #[command(subcommand)]
        command: OwnerCommand,
    },

    /// Manage monitored pages
    Page {
        #[command(subcommand)]
        command: PageCommand,
    },

    /// Trigger or resolve scan jobs
    Scan {
        #[command(subcommand)]
        command: ScanCommand,
    },

    /// Run one periodic tick (normally invoked by cron)
    Tick {
        #[command(subcommand)]
        command: TickCommand,
    },

    /// Record or transition detected changes
    Change {
        #[command(subcommand)]
        command: ChangeCommand,
    },

    /// Record or resolve improvement suggestions
    Suggestion {
        #[command(subcommand)]
        command: SuggestionCommand,
    },

    /// Record analytics samples for the stored metrics provider
    Metric {
        #[command(subcommand)]
        command: MetricCommand,
    },

    /// Dashboard-style reports
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Subcommand)]
enum OwnerCommand {
    /// Add or update an owner's identity and billing snapshot
    Add(OwnerAddArgs),
}

#[derive(Args)]
struct OwnerAddArgs {
    #[arg(long)]
    email: String,

    /// Stored subscription tier (free|starter|pro)
    #[arg(long, default_value = "free")]
    tier: String,

    /// Subscription status (active|trialing|past_due|canceled)
    #[arg(long, default_value = "active")]
    status: String,

    /// Unix timestamp the trial ends at, if any
    #[arg(long = "trial-ends-at")]
    trial_ends_at: Option<i64>,

    /// Owner timezone as minutes east of UTC
    #[arg(long = "tz-offset", default_value_t = 0)]
    tz_offset: i64,
}

#[derive(Subcommand)]
enum PageCommand {
    /// Register a page for monitoring
    Add {
        #[arg(long)]
        owner: i64,

        #[arg(long)]
        url: String,

        /// Scan cadence (manual|weekly|daily)
        #[arg(long, default_value = "daily")]
        frequency: String,
    },

    /// List an owner's monitored pages
    List {
        #[arg(long)]
        owner: i64,
    },
}

#[derive(Subcommand)]
enum ScanCommand {
    /// Queue a manual scan for a page right now
    Now {
        #[arg(long)]
        page: i64,
    },

    /// Mark a scan as picked up by the analysis pipeline
    Start {
        #[arg(long)]
        scan: i64,
    },

    /// Record a scan as complete (analysis pipeline callback)
    Complete {
        #[arg(long)]
        scan: i64,
    },

    /// Record a scan as failed (analysis pipeline callback)
    Fail {
        #[arg(long)]
        scan: i64,

        #[arg(long)]
        error: Option<String>,
    },
}

#[derive(Subcommand)]
enum TickCommand {
    /// Primary scheduled run: create due scan jobs idempotently
    Scheduler,

    /// Self-healing pass: re-sync the queue, backfill missed jobs,
    /// recover stale pending jobs
    Backup,

    /// Evaluate due correlation checkpoints
    Checkpoints,
}

#[derive(Subcommand)]
enum ChangeCommand {
    /// Record a content difference reported by the analysis pipeline
    Record(ChangeRecordArgs),

    /// Mark a change as reverted (a later scan shows it was undone)
    Revert {
        #[arg(long)]
        change: i64,
    },
}

#[derive(Args)]
struct ChangeRecordArgs {
    #[arg(long)]
    page: i64,

    /// Selector or label of the changed element
    #[arg(long)]
    element: String,

    /// Scope of the difference (element|section|page)
    #[arg(long, default_value = "element")]
    scope: String,

    #[arg(long)]
    before: Option<String>,

    #[arg(long)]
    after: Option<String>,

    #[arg(long)]
    hypothesis: Option<String>,

    /// Deploy identifier when the change arrived with a deploy event
    #[arg(long = "deploy-ref")]
    deploy_ref: Option<String>,

    /// Scan that first detected the difference
    #[arg(long)]
    scan: i64,
}

#[derive(Subcommand)]
enum SuggestionCommand {
    /// Upsert a suggestion observed by a scan
    Record {
        #[arg(long)]
        page: i64,

        /// Stable key identifying the suggestion across scans
        #[arg(long)]
        key: String,

        #[arg(long)]
        title: String,

        /// Estimated impact (high|medium|low)
        #[arg(long, default_value = "medium")]
        impact: String,
    },

    /// Mark a suggestion as addressed
    Address {
        #[arg(long)]
        suggestion: i64,
    },

    /// Dismiss a suggestion
    Dismiss {
        #[arg(long)]
        suggestion: i64,
    },
}

#[derive(Subcommand)]
enum MetricCommand {
    /// Record one analytics sample for a page
    Record {
        #[arg(long)]
        page: i64,

        /// Metric key, e.g. visitors or bounce_rate
        #[arg(long)]
        metric: String,

        #[arg(long)]
        value: f64,

        /// Sample timestamp (default: now)
        #[arg(long)]
        at: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ReportCommand {
    /// Per-page attention status for an owner
    Attention {
        #[arg(long)]
        owner: i64,
    },

    /// One change's checkpoint history and outcome summary
    Change {
        #[arg(long)]
        change: i64,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), WebPulseError> {
        let cli = Cli::parse();
        let db = Database::open(&cli.dbpath)?;
        let now = Utc::now().timestamp();

        match cli.command {
            Command::Owner { command } => match command {
                OwnerCommand::Add(args) => owner_add(&db, &args, now),
            },

            Command::Page { command } => match command {
                PageCommand::Add { owner, url, frequency } => {
                    let frequency: ScanFrequency = frequency.parse().map_err(|_| {
                        WebPulseError::Error(format!("Invalid scan frequency: '{}'", frequency))
                    })?;
                    let conn = db.conn()?;
                    let page = MonitoredPage::register(
                        &conn,
                        &StoredTierResolver,
                        owner,
                        &url,
                        frequency,
                        now,
                    )?;
                    println!("Registered page {} ({})", page.page_id, page.url);
                    Ok(())
                }
                PageCommand::List { owner } => {
                    let conn = db.conn()?;
                    for page in MonitoredPage::list_for_owner(&conn, owner)? {
                        println!(
                            "{}\t{}\t{}\tlast scan: {}",
                            page.page_id,
                            page.url,
                            page.scan_frequency,
                            page.latest_scan_id
                                .map(|id| id.to_string())
                                .unwrap_or_else(|| "-".to_string())
                        );
                    }
                    Ok(())
                }
            },

            Command::Scan { command } => match command {
                ScanCommand::Now { page } => scan_now(&db, page, now),
                ScanCommand::Start { scan } => {
                    let conn = db.conn()?;
                    ScanJob::mark_processing(&conn, scan)?;
                    println!("Scan {} marked processing", scan);
                    Ok(())
                }
                ScanCommand::Complete { scan } => scan_finish(&db, scan, ScanStatus::Complete, None, now),
                ScanCommand::Fail { scan, error } => {
                    scan_finish(&db, scan, ScanStatus::Failed, error.as_deref(), now)
                }
            },

            Command::Tick { command } => match command {
                TickCommand::Scheduler => {
                    let queue = OutboxQueue::new(db.clone());
                    let scheduler = ScanScheduler::new(&db, &queue, &StoredTierResolver);
                    for trigger in [TriggerType::Daily, TriggerType::Weekly] {
                        let stats = scheduler.run(trigger, now)?;
                        println!(
                            "{}: {} created, {} already satisfied, {} enqueue failures",
                            trigger, stats.created, stats.already_satisfied, stats.enqueue_failures
                        );
                    }
                    Ok(())
                }
                TickCommand::Backup => {
                    let config = CONFIG
                        .get()
                        .ok_or_else(|| WebPulseError::Error("Configuration not initialized".to_string()))?;
                    let queue = OutboxQueue::new(db.clone());
                    let runner = BackupRunner::new(
                        &db,
                        &queue,
                        &StoredTierResolver,
                        config.scheduler.lookback_secs(),
                        config.scheduler.stale_after_secs(),
                    );
                    let stats = runner.run(now)?;
                    println!(
                        "backup: {} backfilled, {} recovered, {} failures",
                        stats.backfilled, stats.recovered, stats.failures
                    );
                    Ok(())
                }
                TickCommand::Checkpoints => {
                    let config = CONFIG
                        .get()
                        .ok_or_else(|| WebPulseError::Error("Configuration not initialized".to_string()))?;
                    let provider = StoredMetrics::new(db.clone());
                    let engine = CheckpointEngine::new(
                        &db,
                        &provider,
                        config.correlation.neutral_band_percent(),
                    );
                    let stats = engine.run(now)?;
                    println!(
                        "checkpoints: {} evaluated, {} written, {} transitions",
                        stats.evaluated, stats.written, stats.transitions
                    );
                    Ok(())
                }
            },

            Command::Change { command } => match command {
                ChangeCommand::Record(args) => {
                    let scope: ChangeScope = args.scope.parse().map_err(|_| {
                        WebPulseError::Error(format!("Invalid change scope: '{}'", args.scope))
                    })?;
                    let conn = db.conn()?;
                    let page = MonitoredPage::get_by_id(&conn, args.page)?.ok_or_else(|| {
                        WebPulseError::Error(format!("Page {} not found", args.page))
                    })?;
                    let change = DetectedChange::create(
                        &conn,
                        NewChange {
                            page_id: page.page_id,
                            owner_id: page.owner_id,
                            element: args.element,
                            scope,
                            before_value: args.before,
                            after_value: args.after,
                            hypothesis: args.hypothesis,
                            deploy_ref: args.deploy_ref,
                            first_detected_at: now,
                            first_detected_scan_id: args.scan,
                        },
                    )?;
                    println!("Recorded change {} ({})", change.change_id, change.element);
                    Ok(())
                }
                ChangeCommand::Revert { change } => {
                    let conn = db.conn()?;
                    DetectedChange::transition(
                        &conn,
                        change,
                        ChangeStatus::Reverted,
                        "marked reverted by user",
                        ActorType::User,
                        None,
                        now,
                    )?;
                    println!("Change {} marked reverted", change);
                    Ok(())
                }
            },

            Command::Suggestion { command } => match command {
                SuggestionCommand::Record {
                    page,
                    key,
                    title,
                    impact,
                } => {
                    let impact: Impact = impact.parse().map_err(|_| {
                        WebPulseError::Error(format!("Invalid impact: '{}'", impact))
                    })?;
                    let conn = db.conn()?;
                    let found = MonitoredPage::get_by_id(&conn, page)?.ok_or_else(|| {
                        WebPulseError::Error(format!("Page {} not found", page))
                    })?;
                    TrackedSuggestion::upsert(
                        &conn,
                        found.page_id,
                        found.owner_id,
                        &key,
                        &title,
                        impact,
                        now,
                    )?;
                    println!("Recorded suggestion '{}' for page {}", key, page);
                    Ok(())
                }
                SuggestionCommand::Address { suggestion } => {
                    let conn = db.conn()?;
                    TrackedSuggestion::set_status(&conn, suggestion, SuggestionStatus::Addressed)?;
                    println!("Suggestion {} marked addressed", suggestion);
                    Ok(())
                }
                SuggestionCommand::Dismiss { suggestion } => {
                    let conn = db.conn()?;
                    TrackedSuggestion::set_status(&conn, suggestion, SuggestionStatus::Dismissed)?;
                    println!("Suggestion {} dismissed", suggestion);
                    Ok(())
                }
            },

            Command::Metric { command } => match command {
                MetricCommand::Record {
                    page,
                    metric,
                    value,
                    at,
                } => {
                    let conn = db.conn()?;
                    StoredMetrics::record_sample(&conn, page, &metric, at.unwrap_or(now), value)?;
                    println!("Recorded {} = {} for page {}", metric, value, page);
                    Ok(())
                }
            },

            Command::Report { command } => match command {
                ReportCommand::Attention { owner } => {
                    let conn = db.conn()?;
                    for page in MonitoredPage::list_for_owner(&conn, owner)? {
                        let status = attention::evaluate_page(&conn, &page)?;
                        println!("{}\t{}\t{}", status.severity, page.url, status.reason);
                    }
                    Ok(())
                }
                ReportCommand::Change { change } => {
                    let conn = db.conn()?;
                    let detected = DetectedChange::get_by_id(&conn, change)?.ok_or_else(|| {
                        WebPulseError::Error(format!("Change {} not found", change))
                    })?;
                    println!(
                        "Change {} ({} '{}') on page {}: {}",
                        detected.change_id,
                        detected.scope,
                        detected.element,
                        detected.page_id,
                        detected.status
                    );

                    for cp in ChangeCheckpoint::list_for_change(&conn, change)? {
                        let summary = attribution::summarize_checkpoint(detected.status, &cp)
                            .unwrap_or_else(|| {
                                "No usable metrics for this window.".to_string()
                            });
                        println!("  {}d ({}): {}", cp.horizon_days, cp.assessment, summary);
                    }

                    for event in ChangeLifecycleEvent::list_for_change(&conn, change)? {
                        println!(
                            "  {} -> {} by {}: {}",
                            event.from_status, event.to_status, event.actor_type, event.reason
                        );
                    }
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_requires_a_command() {
        assert!(Cli::try_parse_from(["webpulse"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["webpulse", "frobnicate"]).is_err());
    }

    #[test]
    fn test_parses_tick_subcommands() {
        for sub in ["scheduler", "backup", "checkpoints"] {
            let cli = Cli::try_parse_from(["webpulse", "tick", sub]);
            assert!(cli.is_ok(), "tick {} should parse", sub);
            assert!(matches!(cli.unwrap().command, Command::Tick { .. }));
        }
    }

    #[test]
    fn test_global_dbpath_flag() {
        let cli = Cli::try_parse_from([
            "webpulse", "page", "list", "--owner", "1", "--dbpath", "/tmp/wp",
        ])
        .unwrap();
        assert_eq!(cli.dbpath, PathBuf::from("/tmp/wp"));
    }

    #[test]
    fn test_scan_fail_accepts_optional_error() {
        let cli = Cli::try_parse_from(["webpulse", "scan", "fail", "--scan", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Scan {
                command: ScanCommand::Fail { scan: 7, error: None }
            }
        ));
    }

    #[test]
    fn test_failed_scan_becomes_the_latest_scan() {
        use crate::attention::{evaluate_page, Severity};
        use crate::database::test_utils::{insert_owner, test_db};
        use crate::pages::test_utils::insert_page;
        use crate::tiers::ScanFrequency;

        const NOW: i64 = 1_700_000_000;
        const DAY: i64 = 86_400;

        let (_dir, db) = test_db();
        insert_owner(&db, 1, "a@example.com", 0);
        let page_id = insert_page(&db, 1, "example.com", ScanFrequency::Daily, NOW - 30 * DAY);
        let conn = db.conn().unwrap();

        // An earlier scan completed; its pointer is in place
        let first = ScanJob::create_pending(
            &conn,
            Some(1),
            "https://example.com",
            TriggerType::Daily,
            None,
            0,
            NOW - 2 * DAY,
        )
        .unwrap()
        .unwrap();
        scan_finish(&db, first, ScanStatus::Complete, None, NOW - 2 * DAY).unwrap();

        // The newest scan fails; the pointer must advance to it so the
        // failure is visible
        let second = ScanJob::create_pending(
            &conn,
            Some(1),
            "https://example.com",
            TriggerType::Daily,
            Some(first),
            0,
            NOW,
        )
        .unwrap()
        .unwrap();
        scan_finish(&db, second, ScanStatus::Failed, Some("fetch timed out"), NOW).unwrap();

        let page = MonitoredPage::get_by_id(&conn, page_id).unwrap().unwrap();
        assert_eq!(page.latest_scan_id, Some(second));

        let status = evaluate_page(&conn, &page).unwrap();
        assert_eq!(status.severity, Severity::High);
        assert_eq!(status.reason, "last scan failed");
    }
}

fn owner_add(db: &Database, args: &OwnerAddArgs, now: i64) -> Result<(), WebPulseError> {
    let conn = db.conn()?;
    Database::immediate_transaction(&conn, |c| {
        let owner_id: i64 = c.query_row(
            "INSERT INTO owners (email, timezone_offset_minutes, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET timezone_offset_minutes = excluded.timezone_offset_minutes
             RETURNING owner_id",
            rusqlite::params![args.email, args.tz_offset, now],
            |row| row.get(0),
        )?;

        c.execute(
            "INSERT INTO owner_billing (owner_id, tier, subscription_status, trial_ends_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET
                tier = excluded.tier,
                subscription_status = excluded.subscription_status,
                trial_ends_at = excluded.trial_ends_at",
            rusqlite::params![owner_id, args.tier, args.status, args.trial_ends_at],
        )?;

        println!("Owner {} ({})", owner_id, args.email);
        Ok(())
    })
}

fn scan_now(db: &Database, page_id: i64, now: i64) -> Result<(), WebPulseError> {
    let conn = db.conn()?;
    let page = MonitoredPage::get_by_id(&conn, page_id)?
        .ok_or_else(|| WebPulseError::Error(format!("Page {} not found", page_id)))?;

    let scan_id = ScanJob::create_pending(
        &conn,
        Some(page.owner_id),
        &page.url,
        TriggerType::Manual,
        page.latest_scan_id,
        0,
        now,
    )?
    .ok_or_else(|| WebPulseError::Error("Manual scan insert unexpectedly skipped".to_string()))?;

    let queue = OutboxQueue::new(db.clone());
    queue.enqueue(
        SCAN_REQUESTED,
        &ScanRequested {
            scan_id,
            url: page.url.clone(),
            parent_scan_id: page.latest_scan_id,
        },
    )?;

    println!("Queued manual scan {} for {}", scan_id, page.url);
    Ok(())
}

/// Analysis pipeline callback surface: record a terminal scan outcome and
/// advance the page's latest-scan pointer.
///
/// The pointer tracks the most recent scan regardless of outcome; a page
/// whose newest scan failed must surface that failure, not its last
/// success.
fn scan_finish(
    db: &Database,
    scan_id: i64,
    status: ScanStatus,
    error: Option<&str>,
    now: i64,
) -> Result<(), WebPulseError> {
    let conn = db.conn()?;
    Database::immediate_transaction(&conn, |c| {
        ScanJob::mark_finished(c, scan_id, status, error, now)?;

        let job = ScanJob::get_by_id(c, scan_id)?
            .ok_or_else(|| WebPulseError::Error(format!("Scan {} not found", scan_id)))?;

        if let Some(owner_id) = job.owner_id {
            if let Some(page) = MonitoredPage::get_by_owner_url(c, owner_id, &job.url)? {
                MonitoredPage::set_latest_scan(c, page.page_id, scan_id)?;
            }
        }
        Ok(())
    })?;

    info!("Recorded scan {} as {}", scan_id, status);
    println!("Scan {} marked {}", scan_id, status);
    Ok(())
}
