//! Company persistence, including the lease claimer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::{Company, CompanyKind, CrawlStatus, PricingUrlCandidate};
use crate::store::{
    column_parse_error, from_millis, opt_from_millis, opt_to_millis, to_millis, Store,
};

/// Crawl errors stored on the company row are capped at this many chars.
const MAX_CRAWL_ERROR_LEN: usize = 400;

const COMPANY_COLUMNS: &str = "company_id, user_id, kind, name, domain, homepage_url, \
     primary_pricing_url, pricing_url_candidates, next_crawl_at, crawl_lease_until, \
     last_crawl_at, last_crawl_status, last_crawl_error, latest_content_hash, \
     latest_confidence, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewCompany {
    pub user_id: String,
    pub kind: CompanyKind,
    pub name: String,
    pub domain: String,
    pub homepage_url: Option<String>,
    pub primary_pricing_url: Option<String>,
    pub pricing_url_candidates: Vec<PricingUrlCandidate>,
    pub next_crawl_at: Option<DateTime<Utc>>,
}

/// Everything the per-item finalizer writes back in one statement.
#[derive(Debug, Clone, Default)]
pub struct CrawlFinalization {
    pub status: CrawlStatus,
    pub next_crawl_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub latest_content_hash: Option<String>,
    pub latest_confidence: Option<f64>,
    /// Full replacement candidate list, when discovery ran.
    pub merged_candidates: Option<Vec<PricingUrlCandidate>>,
    /// Applied only when the row has no primary yet.
    pub discovered_primary_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlNowOutcome {
    Scheduled,
    /// An unexpired lease exists; the request conflicts.
    LeaseActive { lease_until: DateTime<Utc> },
}

fn company_from_row(row: &Row<'_>) -> rusqlite::Result<Company> {
    let kind: String = row.get(2)?;
    let status: String = row.get(11)?;
    let candidates_json: String = row.get(7)?;
    let candidates: Vec<PricingUrlCandidate> =
        serde_json::from_str(&candidates_json).unwrap_or_default();

    Ok(Company {
        company_id: row.get(0)?,
        user_id: row.get(1)?,
        kind: CompanyKind::parse(&kind)
            .ok_or_else(|| column_parse_error("unknown company kind", &kind))?,
        name: row.get(3)?,
        domain: row.get(4)?,
        homepage_url: row.get(5)?,
        primary_pricing_url: row.get(6)?,
        pricing_url_candidates: candidates,
        next_crawl_at: opt_from_millis(row.get(8)?),
        crawl_lease_until: opt_from_millis(row.get(9)?),
        last_crawl_at: opt_from_millis(row.get(10)?),
        last_crawl_status: CrawlStatus::parse(&status)
            .ok_or_else(|| column_parse_error("unknown crawl status", &status))?,
        last_crawl_error: row.get(12)?,
        latest_content_hash: row.get(13)?,
        latest_confidence: row.get(14)?,
        created_at: from_millis(row.get(15)?),
        updated_at: from_millis(row.get(16)?),
    })
}

fn get_by_id(conn: &Connection, company_id: &str) -> Result<Option<Company>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COMPANY_COLUMNS} FROM companies WHERE company_id = ?1"
    ))?;
    Ok(stmt
        .query_row(params![company_id], company_from_row)
        .optional()?)
}

impl Store {
    pub async fn insert_company(&self, new: NewCompany, now: DateTime<Utc>) -> Result<Company> {
        let conn = self.lock().await;
        let company_id = Uuid::new_v4().to_string();
        let candidates = serde_json::to_string(&new.pricing_url_candidates)?;
        conn.execute(
            "INSERT INTO companies (company_id, user_id, kind, name, domain, homepage_url,
                primary_pricing_url, pricing_url_candidates, next_crawl_at,
                last_crawl_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'idle', ?10, ?10)",
            params![
                company_id,
                new.user_id,
                new.kind.as_str(),
                new.name,
                new.domain,
                new.homepage_url,
                new.primary_pricing_url,
                candidates,
                opt_to_millis(new.next_crawl_at),
                to_millis(now),
            ],
        )
        .context("insert company")?;

        get_by_id(&conn, &company_id)?.context("read back inserted company")
    }

    pub async fn get_company(&self, company_id: &str) -> Result<Option<Company>> {
        let conn = self.lock().await;
        get_by_id(&conn, company_id)
    }

    pub async fn list_companies_for_user(&self, user_id: &str) -> Result<Vec<Company>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![user_id], company_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn count_competitors(&self, user_id: &str) -> Result<u32> {
        let conn = self.lock().await;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM companies WHERE user_id = ?1 AND kind = 'competitor'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn find_company_by_domain(
        &self,
        user_id: &str,
        kind: CompanyKind,
        domain: &str,
    ) -> Result<Option<Company>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies
             WHERE user_id = ?1 AND kind = ?2 AND domain = ?3"
        ))?;
        Ok(stmt
            .query_row(params![user_id, kind.as_str(), domain], company_from_row)
            .optional()?)
    }

    pub async fn find_self_company(&self, user_id: &str) -> Result<Option<Company>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE user_id = ?1 AND kind = 'self'"
        ))?;
        Ok(stmt
            .query_row(params![user_id], company_from_row)
            .optional()?)
    }

    /// Atomically lease one due competitor, oldest `next_crawl_at` first,
    /// ties broken by least-recently-touched. The lease guard is re-checked
    /// in the UPDATE, so each company goes to at most one claimer even
    /// across processes.
    pub async fn claim_due_company(
        &self,
        lease_ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Company>> {
        let conn = self.lock().await;
        let now_ms = to_millis(now);
        let lease_until = now_ms + lease_ttl_ms;

        loop {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT company_id FROM companies
                     WHERE kind = 'competitor'
                       AND (next_crawl_at IS NULL OR next_crawl_at <= ?1)
                       AND (crawl_lease_until IS NULL OR crawl_lease_until <= ?1)
                     ORDER BY next_crawl_at ASC, updated_at ASC
                     LIMIT 1",
                    params![now_ms],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(company_id) = candidate else {
                return Ok(None);
            };

            let changed = conn.execute(
                "UPDATE companies
                 SET crawl_lease_until = ?2, updated_at = ?3
                 WHERE company_id = ?1
                   AND (crawl_lease_until IS NULL OR crawl_lease_until <= ?3)",
                params![company_id, lease_until, now_ms],
            )?;
            if changed == 1 {
                return get_by_id(&conn, &company_id);
            }
            // Lost the race to another claimer; the next SELECT will skip it.
        }
    }

    /// Per-item finalizer: always clears the lease and schedules the next
    /// crawl, regardless of how the item ended.
    pub async fn finalize_crawl(
        &self,
        company_id: &str,
        finalization: CrawlFinalization,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        let error = finalization
            .error
            .map(|e| e.chars().take(MAX_CRAWL_ERROR_LEN).collect::<String>());
        let candidates = match &finalization.merged_candidates {
            Some(list) => Some(serde_json::to_string(list)?),
            None => None,
        };

        conn.execute(
            "UPDATE companies SET
                last_crawl_at = ?2,
                last_crawl_status = ?3,
                next_crawl_at = ?4,
                crawl_lease_until = NULL,
                last_crawl_error = ?5,
                latest_content_hash = COALESCE(?6, latest_content_hash),
                latest_confidence = COALESCE(?7, latest_confidence),
                pricing_url_candidates = COALESCE(?8, pricing_url_candidates),
                primary_pricing_url = CASE
                    WHEN primary_pricing_url IS NULL THEN ?9
                    ELSE primary_pricing_url
                END,
                updated_at = ?2
             WHERE company_id = ?1",
            params![
                company_id,
                to_millis(now),
                finalization.status.as_str(),
                opt_to_millis(finalization.next_crawl_at),
                error,
                finalization.latest_content_hash,
                finalization.latest_confidence,
                candidates,
                finalization.discovered_primary_url,
            ],
        )
        .context("finalize crawl")?;
        Ok(())
    }

    /// Replace the candidate list (and optionally set a primary when none is
    /// set) outside the crawl path, e.g. from the discovery endpoint.
    pub async fn update_candidates(
        &self,
        company_id: &str,
        candidates: &[PricingUrlCandidate],
        discovered_primary_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE companies SET
                pricing_url_candidates = ?2,
                primary_pricing_url = CASE
                    WHEN primary_pricing_url IS NULL THEN ?3
                    ELSE primary_pricing_url
                END,
                updated_at = ?4
             WHERE company_id = ?1",
            params![
                company_id,
                serde_json::to_string(candidates)?,
                discovered_primary_url,
                to_millis(now),
            ],
        )?;
        Ok(())
    }

    /// Explicit user choice of the primary pricing URL.
    pub async fn set_primary_pricing_url(
        &self,
        company_id: &str,
        url: &str,
        candidates: &[PricingUrlCandidate],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE companies SET
                primary_pricing_url = ?2,
                pricing_url_candidates = ?3,
                updated_at = ?4
             WHERE company_id = ?1",
            params![
                company_id,
                url,
                serde_json::to_string(candidates)?,
                to_millis(now),
            ],
        )?;
        Ok(())
    }

    /// User-initiated immediate crawl. An active lease wins: the row is left
    /// untouched and the caller reports a conflict. A stale lease is cleared
    /// in the same guarded update that marks the company due.
    pub async fn request_crawl_now(
        &self,
        company_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CrawlNowOutcome> {
        let conn = self.lock().await;
        let now_ms = to_millis(now);

        let changed = conn.execute(
            "UPDATE companies SET
                next_crawl_at = ?2,
                crawl_lease_until = NULL,
                updated_at = ?2
             WHERE company_id = ?1
               AND (crawl_lease_until IS NULL OR crawl_lease_until <= ?2)",
            params![company_id, now_ms],
        )?;
        if changed == 1 {
            return Ok(CrawlNowOutcome::Scheduled);
        }

        let lease_until: Option<i64> = conn
            .query_row(
                "SELECT crawl_lease_until FROM companies WHERE company_id = ?1",
                params![company_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        match lease_until {
            Some(ms) => Ok(CrawlNowOutcome::LeaseActive {
                lease_until: from_millis(ms),
            }),
            None => Ok(CrawlNowOutcome::Scheduled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_company(user_id: &str, domain: &str) -> NewCompany {
        NewCompany {
            user_id: user_id.to_string(),
            kind: CompanyKind::Competitor,
            name: domain.to_string(),
            domain: domain.to_string(),
            homepage_url: Some(format!("https://{domain}/")),
            primary_pricing_url: None,
            pricing_url_candidates: Vec::new(),
            next_crawl_at: None,
        }
    }

    #[tokio::test]
    async fn test_claim_leases_at_most_once() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_company(new_company("u-1", "acme.example"), now)
            .await
            .unwrap();

        let first = store.claim_due_company(360_000, now).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_due_company(360_000, now).await.unwrap();
        assert!(second.is_none(), "leased company must not be claimable");

        // After the lease expires it becomes due again.
        let later = now + Duration::milliseconds(360_001);
        let third = store.claim_due_company(360_000, later).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_claim_orders_by_next_crawl_then_updated() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        let mut older = new_company("u-1", "older.example");
        older.next_crawl_at = Some(now - Duration::hours(2));
        let mut newer = new_company("u-1", "newer.example");
        newer.next_crawl_at = Some(now - Duration::hours(1));

        // Insert newer first to rule out insertion-order luck.
        store.insert_company(newer, now).await.unwrap();
        let older_row = store.insert_company(older, now).await.unwrap();

        let claimed = store.claim_due_company(360_000, now).await.unwrap().unwrap();
        assert_eq!(claimed.company_id, older_row.company_id);
    }

    #[tokio::test]
    async fn test_claim_skips_self_and_not_due() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        let mut own = new_company("u-1", "self.example");
        own.kind = CompanyKind::Own;
        store.insert_company(own, now).await.unwrap();

        let mut future = new_company("u-1", "future.example");
        future.next_crawl_at = Some(now + Duration::hours(1));
        store.insert_company(future, now).await.unwrap();

        assert!(store.claim_due_company(360_000, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalize_clears_lease_and_truncates_error() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_company(new_company("u-1", "acme.example"), now)
            .await
            .unwrap();
        let claimed = store.claim_due_company(360_000, now).await.unwrap().unwrap();

        let next = now + Duration::hours(6);
        store
            .finalize_crawl(
                &claimed.company_id,
                CrawlFinalization {
                    status: CrawlStatus::Error,
                    next_crawl_at: Some(next),
                    error: Some("x".repeat(1000)),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        let company = store
            .get_company(&claimed.company_id)
            .await
            .unwrap()
            .unwrap();
        assert!(company.crawl_lease_until.is_none());
        assert_eq!(company.last_crawl_status, CrawlStatus::Error);
        assert_eq!(company.last_crawl_error.unwrap().len(), 400);
        assert_eq!(
            company.next_crawl_at.unwrap().timestamp_millis(),
            next.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_finalize_keeps_existing_primary() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut input = new_company("u-1", "acme.example");
        input.primary_pricing_url = Some("https://acme.example/pricing".to_string());
        let company = store.insert_company(input, now).await.unwrap();

        store
            .finalize_crawl(
                &company.company_id,
                CrawlFinalization {
                    status: CrawlStatus::Ok,
                    next_crawl_at: Some(now),
                    discovered_primary_url: Some("https://acme.example/other".to_string()),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        let reloaded = store.get_company(&company.company_id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.primary_pricing_url.as_deref(),
            Some("https://acme.example/pricing")
        );
    }

    #[tokio::test]
    async fn test_crawl_now_conflicts_with_active_lease() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let company = store
            .insert_company(new_company("u-1", "acme.example"), now)
            .await
            .unwrap();

        assert_eq!(
            store.request_crawl_now(&company.company_id, now).await.unwrap(),
            CrawlNowOutcome::Scheduled
        );

        store.claim_due_company(360_000, now).await.unwrap().unwrap();
        match store.request_crawl_now(&company.company_id, now).await.unwrap() {
            CrawlNowOutcome::LeaseActive { lease_until } => assert!(lease_until > now),
            CrawlNowOutcome::Scheduled => panic!("active lease must conflict"),
        }
    }

    #[tokio::test]
    async fn test_unique_constraints() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_company(new_company("u-1", "acme.example"), now)
            .await
            .unwrap();
        assert!(store
            .insert_company(new_company("u-1", "acme.example"), now)
            .await
            .is_err());

        let mut own_a = new_company("u-1", "one.example");
        own_a.kind = CompanyKind::Own;
        store.insert_company(own_a, now).await.unwrap();
        let mut own_b = new_company("u-1", "two.example");
        own_b.kind = CompanyKind::Own;
        assert!(store.insert_company(own_b, now).await.is_err());
    }
}
