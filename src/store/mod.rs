//! SQLite persistence.
//!
//! One connection behind an async mutex; every mutation that needs
//! at-most-once semantics (invocation locks, leases, trial transitions,
//! webhook claims) is a conditional `UPDATE ... WHERE <guard>` checked via
//! `changes()`, so the guard holds even with multiple processes on the same
//! database file.

mod audit;
mod companies;
mod diffs;
mod insights;
mod locks;
mod rate_limit;
mod snapshots;
mod users;
mod webhooks;

pub use audit::{AuditEvent, AuditOutcome, StoredAuditEvent};
pub use companies::{CrawlFinalization, CrawlNowOutcome, NewCompany};
pub use locks::{LockAcquisition, CRAWL_LOCK_KEY, DIGEST_LOCK_KEY};
pub use rate_limit::RateLimitDecision;
pub use users::UpsertUser;
pub use webhooks::WebhookClaim;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT,
                paid_plan_price_tag TEXT,
                has_paid_access INTEGER NOT NULL DEFAULT 0,
                trial_status TEXT NOT NULL DEFAULT 'not_started',
                trial_started_at INTEGER,
                trial_ends_at INTEGER,
                last_digest_sent_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS companies (
                company_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                homepage_url TEXT,
                primary_pricing_url TEXT,
                pricing_url_candidates TEXT NOT NULL DEFAULT '[]',
                next_crawl_at INTEGER,
                crawl_lease_until INTEGER,
                last_crawl_at INTEGER,
                last_crawl_status TEXT NOT NULL DEFAULT 'idle',
                last_crawl_error TEXT,
                latest_content_hash TEXT,
                latest_confidence REAL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_companies_user_kind_domain
             ON companies(user_id, kind, domain)",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_companies_one_self
             ON companies(user_id) WHERE kind = 'self'",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_companies_due
             ON companies(kind, next_crawl_at, updated_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                capture_method TEXT NOT NULL,
                confidence REAL NOT NULL,
                content_hash TEXT NOT NULL,
                payload TEXT NOT NULL,
                is_verified INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_company_captured
             ON snapshots(company_id, captured_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS diffs (
                diff_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                previous_snapshot_id TEXT,
                current_snapshot_id TEXT NOT NULL,
                normalized_diff TEXT NOT NULL,
                severity TEXT NOT NULL,
                verification_state TEXT NOT NULL,
                detected_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_diffs_user_detected
             ON diffs(user_id, detected_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_diffs_company_detected
             ON diffs(company_id, detected_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS insights (
                insight_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                diff_id TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost_usd REAL NOT NULL DEFAULT 0,
                recommendation TEXT NOT NULL,
                severity_gate TEXT NOT NULL,
                generated_at INTEGER NOT NULL,
                feedback TEXT NOT NULL DEFAULT 'none'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_insights_user_generated
             ON insights(user_id, generated_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_insights_diff ON insights(diff_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cron_locks (
                lock_key TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                lock_until INTEGER NOT NULL,
                locked_at INTEGER NOT NULL,
                last_released_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rate_limit_counters (
                counter_key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                window_started_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS webhook_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                lock_expires_at INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER,
                last_error TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_events (
                event_id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                user_id TEXT,
                company_id TEXT,
                event TEXT NOT NULL,
                outcome TEXT NOT NULL,
                metadata TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_ts ON audit_events(ts DESC)",
            [],
        )?;

        Ok(())
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn opt_to_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_millis)
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Error for a stored string that no longer parses into its closed sum.
pub(crate) fn column_parse_error(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{what}: {value}").into(),
    )
}
