//! Batch crawl runner.
//!
//! Claims up to `limit` due competitors one lease at a time and walks each
//! through resolve, entitlement check, fetch, hash gate, snapshot, diff, and
//! insight. Every item finalizes exactly once, whatever happened before:
//! the finalizer clears the lease, schedules the next crawl, and records the
//! terminal status. Item failures never cross items.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crawler::diff::compute_diff;
use crate::crawler::discovery::{discover, merge_candidates, DiscoverySettings};
use crate::crawler::extract::{extract_pricing_page, PricingExtraction};
use crate::crawler::fetch::PageFetcher;
use crate::crawler::insight::{decide_insight, InsightDecision};
use crate::entitlements::refresh_and_resolve;
use crate::models::{
    CaptureMethod, Company, Config, CrawlStatus, Diff, PricingUrlCandidate, Severity, Snapshot,
    VerificationState,
};
use crate::store::{AuditEvent, AuditOutcome, CrawlFinalization, Store};

pub struct CrawlRunner {
    store: Store,
    fetcher: Arc<dyn PageFetcher>,
    config: Arc<Config>,
}

/// Aggregate result of one batch invocation.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub snapshots_created: usize,
    pub diffs_created: usize,
    pub insights_created: usize,
    pub unchanged: usize,
    pub failures: usize,
    pub items: Vec<ItemReport>,
}

#[derive(Debug, Serialize)]
pub struct ItemReport {
    pub company_id: String,
    pub domain: String,
    pub status: CrawlStatus,
    pub outcome: String,
    pub diff_severity: Option<Severity>,
    pub insight_created: bool,
}

/// What one item produced, before finalization.
struct ItemOutcome {
    status: CrawlStatus,
    outcome: &'static str,
    error: Option<String>,
    latest_content_hash: Option<String>,
    latest_confidence: Option<f64>,
    merged_candidates: Option<Vec<PricingUrlCandidate>>,
    discovered_primary_url: Option<String>,
    snapshot_created: bool,
    unchanged: bool,
    diff_severity: Option<Severity>,
    insight_created: bool,
}

impl ItemOutcome {
    fn terminal(status: CrawlStatus, outcome: &'static str, error: Option<String>) -> Self {
        Self {
            status,
            outcome,
            error,
            latest_content_hash: None,
            latest_confidence: None,
            merged_candidates: None,
            discovered_primary_url: None,
            snapshot_created: false,
            unchanged: false,
            diff_severity: None,
            insight_created: false,
        }
    }
}

impl CrawlRunner {
    pub fn new(store: Store, fetcher: Arc<dyn PageFetcher>, config: Arc<Config>) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// Run one batch: claim-and-process until `limit` items or nothing is
    /// due. Claim failures are store faults and propagate; item failures are
    /// contained by the per-item finalizer.
    pub async fn run_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        while report.claimed < limit {
            let Some(company) = self
                .store
                .claim_due_company(self.config.crawl_lease_ms, now)
                .await?
            else {
                break;
            };
            report.claimed += 1;

            let item = self.process_item(company, now).await;
            if item.insight_created {
                report.insights_created += 1;
            }
            match item.status {
                CrawlStatus::Ok | CrawlStatus::Idle => {}
                _ => report.failures += 1,
            }
            if item.outcome == "unchanged" {
                report.unchanged += 1;
            }
            if item.outcome == "snapshot" {
                report.snapshots_created += 1;
            }
            if item.diff_severity.is_some() {
                report.diffs_created += 1;
            }
            report.items.push(item);
        }

        info!(
            claimed = report.claimed,
            snapshots = report.snapshots_created,
            diffs = report.diffs_created,
            insights = report.insights_created,
            unchanged = report.unchanged,
            failures = report.failures,
            "Crawl batch complete"
        );
        Ok(report)
    }

    /// Process one claimed company. Never fails: internal errors become
    /// `status = error`, and the finalizer runs on every path.
    async fn process_item(&self, company: Company, now: DateTime<Utc>) -> ItemReport {
        let outcome = match self.run_item(&company, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    company_id = %company.company_id,
                    domain = %company.domain,
                    error = %format!("{e:#}"),
                    "Crawl item failed"
                );
                ItemOutcome::terminal(CrawlStatus::Error, "error", Some(format!("{e:#}")))
            }
        };

        self.finalize_item(&company, &outcome, now).await;

        ItemReport {
            company_id: company.company_id,
            domain: company.domain,
            status: outcome.status,
            outcome: outcome.outcome.to_string(),
            diff_severity: outcome.diff_severity,
            insight_created: outcome.insight_created,
        }
    }

    async fn run_item(&self, company: &Company, now: DateTime<Utc>) -> Result<ItemOutcome> {
        // Resolve the pricing URL, discovering one when only a homepage is known.
        let mut merged_candidates = None;
        let mut discovered_primary_url = None;
        let pricing_url = match &company.primary_pricing_url {
            Some(url) => Some(url.clone()),
            None => match &company.homepage_url {
                Some(homepage) => {
                    let discovery = discover(
                        self.fetcher.as_ref(),
                        homepage,
                        &company.domain,
                        DiscoverySettings {
                            primary_min_confidence: self.config.discovery_primary_min_confidence,
                            primary_min_gap: self.config.discovery_primary_min_gap,
                        },
                    )
                    .await;
                    if !discovery.candidates.is_empty() {
                        merged_candidates = Some(merge_candidates(
                            &company.pricing_url_candidates,
                            &discovery.candidates,
                        ));
                    }
                    discovered_primary_url = discovery.recommended_primary_url.clone();
                    discovery.recommended_primary_url
                }
                None => None,
            },
        };

        let Some(pricing_url) = pricing_url else {
            let mut outcome = ItemOutcome::terminal(
                CrawlStatus::ManualNeeded,
                "no_url",
                Some("No pricing URL configured and discovery found no clear candidate".to_string()),
            );
            outcome.merged_candidates = merged_candidates;
            return Ok(outcome);
        };

        // Entitlement gate before spending a fetch.
        let Some(user) = self.store.get_user(&company.user_id).await? else {
            return Ok(ItemOutcome::terminal(
                CrawlStatus::Idle,
                "not_entitled",
                Some("Owning user not found".to_string()),
            ));
        };
        let (_, entitlements) =
            refresh_and_resolve(&self.store, &user, &self.config.plan_rules, now).await?;
        if !entitlements.has_access {
            let mut outcome = ItemOutcome::terminal(CrawlStatus::Idle, "not_entitled", None);
            outcome.merged_candidates = merged_candidates;
            outcome.discovered_primary_url = discovered_primary_url;
            return Ok(outcome);
        }

        // Fetch and extract.
        let page = match extract_pricing_page(self.fetcher.as_ref(), &pricing_url).await {
            PricingExtraction::Ok(page) => page,
            PricingExtraction::Failed { status, error } => {
                let mut outcome = ItemOutcome::terminal(status, status.as_str(), Some(error));
                outcome.latest_confidence = Some(0.0);
                outcome.merged_candidates = merged_candidates;
                outcome.discovered_primary_url = discovered_primary_url;
                return Ok(outcome);
            }
        };

        let mut outcome = ItemOutcome {
            status: CrawlStatus::Ok,
            outcome: "snapshot",
            error: None,
            latest_content_hash: Some(page.content_hash.clone()),
            latest_confidence: Some(page.confidence),
            merged_candidates,
            discovered_primary_url,
            snapshot_created: false,
            unchanged: false,
            diff_severity: None,
            insight_created: false,
        };

        // Hash gate: identical normalized text means no downstream work.
        if company.latest_content_hash.as_deref() == Some(page.content_hash.as_str()) {
            outcome.outcome = "unchanged";
            outcome.unchanged = true;
            return Ok(outcome);
        }

        // The immediately-previous snapshot is loaded before the new write;
        // the lease guarantees no concurrent writer for this company.
        let previous = self.store.latest_snapshot(&company.company_id).await?;

        let snapshot = Snapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            user_id: company.user_id.clone(),
            company_id: company.company_id.clone(),
            captured_at: now,
            capture_method: CaptureMethod::Static,
            confidence: page.confidence,
            content_hash: page.content_hash.clone(),
            payload: page.payload.clone(),
            is_verified: page.is_verified,
        };
        self.store.insert_snapshot(&snapshot).await?;
        outcome.snapshot_created = true;

        let Some(previous) = previous else {
            return Ok(outcome);
        };

        let Some((normalized, severity)) = compute_diff(&previous.payload, &snapshot.payload, now)
        else {
            return Ok(outcome);
        };

        let diff = Diff {
            diff_id: Uuid::new_v4().to_string(),
            user_id: company.user_id.clone(),
            company_id: company.company_id.clone(),
            previous_snapshot_id: Some(previous.snapshot_id.clone()),
            current_snapshot_id: snapshot.snapshot_id.clone(),
            normalized_diff: normalized,
            severity,
            verification_state: if snapshot.is_verified {
                VerificationState::Verified
            } else {
                VerificationState::Unverified
            },
            detected_at: now,
        };
        self.store.insert_diff(&diff).await?;
        outcome.diff_severity = Some(severity);
        info!(
            company_id = %company.company_id,
            domain = %company.domain,
            severity = severity.as_str(),
            "Pricing diff detected"
        );

        match decide_insight(&entitlements, &diff, now) {
            InsightDecision::Create(insight) => {
                self.store.insert_insight(&insight).await?;
                outcome.insight_created = true;
            }
            InsightDecision::Skip { reason } => {
                info!(
                    company_id = %company.company_id,
                    severity = severity.as_str(),
                    reason,
                    "Insight skipped"
                );
            }
        }

        Ok(outcome)
    }

    /// The always-runs tail of the per-item state machine.
    async fn finalize_item(&self, company: &Company, outcome: &ItemOutcome, now: DateTime<Utc>) {
        let next_crawl_at = now + Duration::milliseconds(self.backoff_ms(outcome.status));
        let finalization = CrawlFinalization {
            status: outcome.status,
            next_crawl_at: Some(next_crawl_at),
            error: outcome.error.clone(),
            latest_content_hash: outcome.latest_content_hash.clone(),
            latest_confidence: outcome.latest_confidence,
            merged_candidates: outcome.merged_candidates.clone(),
            discovered_primary_url: outcome.discovered_primary_url.clone(),
        };

        if let Err(e) = self
            .store
            .finalize_crawl(&company.company_id, finalization, now)
            .await
        {
            error!(
                company_id = %company.company_id,
                error = %format!("{e:#}"),
                "Failed to finalize crawl item"
            );
            return;
        }

        let audit_event = match outcome.status {
            CrawlStatus::Blocked => Some("crawl_blocked"),
            CrawlStatus::ManualNeeded => Some("crawl_manual_needed"),
            CrawlStatus::Error => Some("crawl_error"),
            CrawlStatus::Ok | CrawlStatus::Idle => None,
        };
        if let Some(event) = audit_event {
            let audit = AuditEvent::new(event, AuditOutcome::Failure)
                .user(&company.user_id)
                .company(&company.company_id)
                .metadata(serde_json::json!({
                    "error": outcome.error.clone(),
                    "domain": company.domain.clone(),
                }));
            if let Err(e) = self.store.record_audit(audit, now).await {
                warn!(error = %format!("{e:#}"), "Failed to record crawl audit event");
            }
        }
    }

    /// Backoff table: next-due delay per terminal status.
    fn backoff_ms(&self, status: CrawlStatus) -> i64 {
        match status {
            CrawlStatus::Ok | CrawlStatus::Idle => self.config.crawl_success_delay_ms,
            CrawlStatus::Error => self.config.crawl_error_backoff_ms,
            CrawlStatus::Blocked => self.config.crawl_blocked_backoff_ms,
            CrawlStatus::ManualNeeded => self.config.crawl_manual_backoff_ms,
        }
    }
}
