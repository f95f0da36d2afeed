//! Weekly digest job.
//!
//! Runs under the `cron:digest` invocation lock. For each user with an email
//! and digest eligibility, collects the verified diffs from the lookback
//! window, composes one message, dispatches it through the email
//! collaborator, and stamps `last_digest_sent_at` only after a successful
//! send.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::email::{EmailMessage, EmailSender};
use crate::entitlements::refresh_and_resolve;
use crate::models::{Config, Diff, Severity, User};
use crate::store::Store;

pub struct DigestRunner {
    store: Store,
    email: Arc<dyn EmailSender>,
    config: Arc<Config>,
}

#[derive(Debug, Default, Serialize)]
pub struct DigestReport {
    pub considered: usize,
    pub sent: usize,
    pub skipped_no_email: usize,
    pub skipped_not_eligible: usize,
    pub skipped_recently_sent: usize,
    pub skipped_no_diffs: usize,
    pub failures: usize,
}

impl DigestRunner {
    pub fn new(store: Store, email: Arc<dyn EmailSender>, config: Arc<Config>) -> Self {
        Self {
            store,
            email,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<DigestReport> {
        let mut report = DigestReport::default();
        let lookback = Duration::days(self.config.digest_lookback_days);
        let since = now - lookback;

        for user in self.store.list_users().await? {
            report.considered += 1;

            let Some(email) = user.email.clone() else {
                report.skipped_no_email += 1;
                continue;
            };

            let (user, entitlements) =
                refresh_and_resolve(&self.store, &user, &self.config.plan_rules, now).await?;
            if !entitlements.can_receive_weekly_digest {
                report.skipped_not_eligible += 1;
                continue;
            }

            if let Some(last_sent) = user.last_digest_sent_at {
                if last_sent > since {
                    report.skipped_recently_sent += 1;
                    continue;
                }
            }

            let diffs = self
                .store
                .list_verified_diffs_since(&user.user_id, since, self.config.digest_max_diffs)
                .await?;
            if diffs.is_empty() {
                report.skipped_no_diffs += 1;
                continue;
            }

            let names = self.company_names(&user.user_id).await?;
            let message = compose_digest(&email, &user, &diffs, &names);

            match self.email.send(&message).await {
                Ok(()) => {
                    self.store
                        .set_last_digest_sent_at(&user.user_id, now)
                        .await?;
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(
                        user_id = %user.user_id,
                        error = %format!("{e:#}"),
                        "Digest send failed"
                    );
                    report.failures += 1;
                }
            }
        }

        info!(
            considered = report.considered,
            sent = report.sent,
            failures = report.failures,
            "Digest run complete"
        );
        Ok(report)
    }

    async fn company_names(&self, user_id: &str) -> Result<HashMap<String, String>> {
        let companies = self.store.list_companies_for_user(user_id).await?;
        Ok(companies
            .into_iter()
            .map(|c| (c.company_id, c.name))
            .collect())
    }
}

/// Subject plus text and HTML bodies: per-severity counts up top, one line
/// per diff below.
pub fn compose_digest(
    email: &str,
    user: &User,
    diffs: &[Diff],
    company_names: &HashMap<String, String>,
) -> EmailMessage {
    let high = diffs.iter().filter(|d| d.severity == Severity::High).count();
    let medium = diffs
        .iter()
        .filter(|d| d.severity == Severity::Medium)
        .count();
    let low = diffs.iter().filter(|d| d.severity == Severity::Low).count();

    let subject = format!(
        "Weekly pricing digest: {high} high, {medium} medium, {low} low severity changes"
    );

    let mut text_lines = vec![format!(
        "Competitor pricing changes in the last week for {}:",
        user.user_id
    )];
    let mut html_lines = vec![format!(
        "<p>Competitor pricing changes in the last week:</p><ul>"
    )];
    for diff in diffs {
        let name = company_names
            .get(&diff.company_id)
            .cloned()
            .unwrap_or_else(|| diff.company_id.clone());
        let changes = diff
            .normalized_diff
            .buckets
            .iter()
            .map(|b| b.added.len() + b.removed.len() + b.updated.len())
            .sum::<usize>();
        let line = format!(
            "{name}: {} severity, {changes} price change(s) on {}",
            diff.severity.as_str(),
            diff.detected_at.format("%Y-%m-%d")
        );
        text_lines.push(format!("- {line}"));
        html_lines.push(format!("<li>{line}</li>"));
    }
    html_lines.push("</ul>".to_string());

    EmailMessage {
        to: email.to_string(),
        subject,
        text_body: text_lines.join("\n"),
        html_body: html_lines.join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::LogEmailSender;
    use crate::models::{NormalizedDiff, TrialStatus, VerificationState};
    use crate::store::UpsertUser;

    fn verified_diff(user_id: &str, company_id: &str, detected_at: DateTime<Utc>) -> Diff {
        Diff {
            diff_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            previous_snapshot_id: None,
            current_snapshot_id: "s-1".to_string(),
            normalized_diff: NormalizedDiff {
                buckets: Vec::new(),
                added_hints: vec!["contact sales".to_string()],
                removed_hints: Vec::new(),
                previous_price_count: 1,
                current_price_count: 1,
                previous_plan_count: 0,
                current_plan_count: 0,
                changed_at: detected_at,
            },
            severity: Severity::High,
            verification_state: VerificationState::Verified,
            detected_at,
        }
    }

    async fn paid_user(store: &Store, user_id: &str, email: Option<&str>, now: DateTime<Utc>) {
        store
            .upsert_user(
                UpsertUser {
                    user_id: user_id.to_string(),
                    email: email.map(|e| e.to_string()),
                    has_paid_access: true,
                    paid_plan_price_tag: Some("price_pro_monthly".to_string()),
                    trial_status: TrialStatus::NotStarted,
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_digest_sends_and_stamps() {
        let store = Store::open_in_memory().unwrap();
        let sender = Arc::new(LogEmailSender::new());
        let config = Arc::new(Config::default());
        let now = Utc::now();

        paid_user(&store, "u-1", Some("u-1@example.com"), now).await;
        store
            .insert_diff(&verified_diff("u-1", "c-1", now - Duration::days(1)))
            .await
            .unwrap();

        let runner = DigestRunner::new(store.clone(), sender.clone(), config);
        let report = runner.run(now).await.unwrap();
        assert_eq!(report.sent, 1);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("1 high"));
        assert!(store
            .get_user("u-1")
            .await
            .unwrap()
            .unwrap()
            .last_digest_sent_at
            .is_some());

        // A second run inside the lookback window skips the user.
        let report = runner.run(now + Duration::hours(1)).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped_recently_sent, 1);
    }

    #[tokio::test]
    async fn test_digest_skips_no_email_and_trial_users() {
        let store = Store::open_in_memory().unwrap();
        let sender = Arc::new(LogEmailSender::new());
        let config = Arc::new(Config::default());
        let now = Utc::now();

        paid_user(&store, "u-1", None, now).await;
        store
            .upsert_user(
                UpsertUser {
                    user_id: "u-2".to_string(),
                    email: Some("u-2@example.com".to_string()),
                    trial_status: TrialStatus::Active,
                    trial_started_at: Some(now),
                    trial_ends_at: Some(now + Duration::days(14)),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        store
            .insert_diff(&verified_diff("u-2", "c-1", now - Duration::days(1)))
            .await
            .unwrap();

        let runner = DigestRunner::new(store.clone(), sender.clone(), config);
        let report = runner.run(now).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped_no_email, 1);
        assert_eq!(report.skipped_not_eligible, 1);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_digest_skips_users_without_recent_diffs() {
        let store = Store::open_in_memory().unwrap();
        let sender = Arc::new(LogEmailSender::new());
        let config = Arc::new(Config::default());
        let now = Utc::now();

        paid_user(&store, "u-1", Some("u-1@example.com"), now).await;
        store
            .insert_diff(&verified_diff("u-1", "c-1", now - Duration::days(20)))
            .await
            .unwrap();

        let runner = DigestRunner::new(store.clone(), sender, config);
        let report = runner.run(now).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped_no_diffs, 1);
    }
}
