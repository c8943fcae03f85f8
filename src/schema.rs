/// Database schema for webpulse.
///
/// All timestamps are Unix seconds (UTC). Idempotency is enforced at the
/// storage layer through unique indexes:
/// - pages: one page per (owner, normalized url)
/// - scan_jobs: one scheduled job per (owner, url, trigger_type, day_key);
///   day_key is NULL for manual/deploy jobs, which SQLite treats as distinct
/// - change_checkpoints: one checkpoint per (change, horizon)
/// - suggestions: one tracked suggestion per (page, key)
pub const SCHEMA_VERSION: &str = "3";

pub const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Identity snapshot. Read-only from the core's perspective; populated by
-- the identity system (or the `owner add` CLI command in a local setup).
CREATE TABLE owners (
    owner_id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    timezone_offset_minutes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Billing snapshot consumed by the tier resolver.
CREATE TABLE owner_billing (
    owner_id INTEGER PRIMARY KEY REFERENCES owners(owner_id),
    tier TEXT NOT NULL,
    subscription_status TEXT NOT NULL,
    trial_ends_at INTEGER
);

CREATE TABLE pages (
    page_id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL REFERENCES owners(owner_id),
    url TEXT NOT NULL,
    scan_frequency TEXT NOT NULL,
    latest_scan_id INTEGER,
    created_at INTEGER NOT NULL,
    UNIQUE (owner_id, url)
);

CREATE TABLE scan_jobs (
    scan_id INTEGER PRIMARY KEY,
    owner_id INTEGER,
    url TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    status TEXT NOT NULL,
    parent_scan_id INTEGER,
    day_key TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    UNIQUE (owner_id, url, trigger_type, day_key)
);

CREATE INDEX idx_scan_jobs_status ON scan_jobs(status, trigger_type, created_at);

-- Reported by the analysis pipeline; page_id is not constrained so reports
-- survive page deletion.
CREATE TABLE detected_changes (
    change_id INTEGER PRIMARY KEY,
    page_id INTEGER NOT NULL,
    owner_id INTEGER NOT NULL,
    element TEXT NOT NULL,
    scope TEXT NOT NULL,
    before_value TEXT,
    after_value TEXT,
    status TEXT NOT NULL,
    correlation_metrics TEXT,
    correlation_unlocked_at INTEGER,
    hypothesis TEXT,
    deploy_ref TEXT,
    first_detected_at INTEGER NOT NULL,
    first_detected_scan_id INTEGER NOT NULL
);

CREATE INDEX idx_changes_page ON detected_changes(page_id, status);
CREATE INDEX idx_changes_status ON detected_changes(status, first_detected_at);

-- Append-only audit log of status transitions.
CREATE TABLE change_events (
    event_id INTEGER PRIMARY KEY,
    change_id INTEGER NOT NULL REFERENCES detected_changes(change_id),
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    reason TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    checkpoint_id INTEGER,
    created_at INTEGER NOT NULL
);

-- Immutable once written. One row per (change, horizon).
CREATE TABLE change_checkpoints (
    checkpoint_id INTEGER PRIMARY KEY,
    change_id INTEGER NOT NULL REFERENCES detected_changes(change_id),
    horizon_days INTEGER NOT NULL,
    before_start INTEGER NOT NULL,
    before_end INTEGER NOT NULL,
    after_start INTEGER NOT NULL,
    after_end INTEGER NOT NULL,
    metrics TEXT NOT NULL,
    assessment TEXT NOT NULL,
    confidence REAL,
    provider TEXT NOT NULL,
    computed_at INTEGER NOT NULL,
    UNIQUE (change_id, horizon_days)
);

CREATE TABLE suggestions (
    suggestion_id INTEGER PRIMARY KEY,
    page_id INTEGER NOT NULL,
    owner_id INTEGER NOT NULL,
    suggestion_key TEXT NOT NULL,
    title TEXT NOT NULL,
    impact TEXT NOT NULL,
    status TEXT NOT NULL,
    times_seen INTEGER NOT NULL DEFAULT 1,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    UNIQUE (page_id, suggestion_key)
);

-- Work-queue outbox. The external analysis pipeline drains this table;
-- delivery is at-least-once, so consumers check job status before work.
CREATE TABLE queue_outbox (
    entry_id INTEGER PRIMARY KEY,
    event_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0
);

-- Stored analytics samples backing the local analytics provider.
CREATE TABLE page_metrics (
    page_id INTEGER NOT NULL,
    metric TEXT NOT NULL,
    sampled_at INTEGER NOT NULL,
    value REAL NOT NULL
);

CREATE INDEX idx_page_metrics ON page_metrics(page_id, metric, sampled_at);
"#;
