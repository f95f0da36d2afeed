//! Entitlement resolution.
//!
//! [`resolve_entitlements`] is a pure function of `(user, now)` plus the
//! configured plan rule table. Trial lifecycle transitions are observed here
//! and persisted by [`refresh_and_resolve`] before anything downstream uses
//! the result.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::{
    AccessSource, Entitlements, PlanRules, PlanTier, TrialStatus, User,
};
use crate::store::Store;

/// Plan tier for a paid user. Unknown tags fall back to Starter rather than
/// failing closed; a mapping gap must not lock out a paying customer.
pub fn resolve_tier(price_tag: Option<&str>, rules: &PlanRules) -> PlanTier {
    match price_tag {
        Some(tag) if rules.pro_price_tags.iter().any(|t| t == tag) => PlanTier::Pro,
        _ => PlanTier::Starter,
    }
}

/// Trial transition the refresher should persist, if any. Idempotent: only
/// an `active` trial ever transitions.
pub fn pending_trial_transition(user: &User, now: DateTime<Utc>) -> Option<TrialStatus> {
    if user.trial_status != TrialStatus::Active {
        return None;
    }
    if user.has_paid_access {
        return Some(TrialStatus::Converted);
    }
    match user.trial_ends_at {
        Some(ends_at) if ends_at > now => None,
        // An active trial without an end date violates the invariant;
        // treat it as ended.
        _ => Some(TrialStatus::Expired),
    }
}

/// Pure resolver: user state to access, competitor cap, severity gate, and
/// digest eligibility.
pub fn resolve_entitlements(user: &User, rules: &PlanRules, now: DateTime<Utc>) -> Entitlements {
    if user.has_paid_access {
        let tier = resolve_tier(user.paid_plan_price_tag.as_deref(), rules);
        let rule = match tier {
            PlanTier::Starter => &rules.starter,
            PlanTier::Pro => &rules.pro,
        };
        return Entitlements {
            has_access: true,
            access_source: AccessSource::Paid,
            plan_tier: Some(tier),
            competitor_limit: rule.competitor_limit,
            insight_severity_gate: Some(rule.insight_severity_gate),
            can_receive_weekly_digest: rule.can_receive_weekly_digest,
        };
    }

    let trial_live = user.trial_status == TrialStatus::Active
        && user.trial_ends_at.map(|ends| ends > now).unwrap_or(false);
    if trial_live {
        return Entitlements {
            has_access: true,
            access_source: AccessSource::Trial,
            plan_tier: Some(PlanTier::Starter),
            competitor_limit: rules.starter.competitor_limit,
            insight_severity_gate: Some(rules.starter.insight_severity_gate),
            // Trials never receive the weekly digest.
            can_receive_weekly_digest: false,
        };
    }

    Entitlements::none()
}

/// Persist any pending trial transition, then resolve against the refreshed
/// user. Returns the user actually resolved against.
pub async fn refresh_and_resolve(
    store: &Store,
    user: &User,
    rules: &PlanRules,
    now: DateTime<Utc>,
) -> Result<(User, Entitlements)> {
    let mut current = user.clone();
    if let Some(to) = pending_trial_transition(&current, now) {
        if store
            .apply_trial_transition(&current.user_id, to, now)
            .await?
        {
            info!(
                user_id = %current.user_id,
                to = to.as_str(),
                "Trial status transitioned"
            );
        }
        if let Some(refreshed) = store.get_user(&current.user_id).await? {
            current = refreshed;
        }
    }
    let entitlements = resolve_entitlements(&current, rules, now);
    Ok((current, entitlements))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeverityGate;
    use crate::store::UpsertUser;
    use chrono::Duration;

    fn user(has_paid: bool, trial: TrialStatus, ends_in_hours: Option<i64>) -> User {
        let now = Utc::now();
        User {
            user_id: "u-1".to_string(),
            email: Some("u-1@example.com".to_string()),
            paid_plan_price_tag: None,
            has_paid_access: has_paid,
            trial_status: trial,
            trial_started_at: None,
            trial_ends_at: ends_in_hours.map(|h| now + Duration::hours(h)),
            last_digest_sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_paid_user_resolves_tier_from_tag() {
        let rules = PlanRules::default();
        let mut paid = user(true, TrialStatus::NotStarted, None);

        paid.paid_plan_price_tag = Some("price_pro_monthly".to_string());
        let ents = resolve_entitlements(&paid, &rules, Utc::now());
        assert_eq!(ents.plan_tier, Some(PlanTier::Pro));
        assert_eq!(ents.competitor_limit, 10);
        assert_eq!(ents.insight_severity_gate, Some(SeverityGate::HighAndMedium));
        assert!(ents.can_receive_weekly_digest);

        // Unknown tag falls back to Starter.
        paid.paid_plan_price_tag = Some("price_mystery".to_string());
        let ents = resolve_entitlements(&paid, &rules, Utc::now());
        assert_eq!(ents.plan_tier, Some(PlanTier::Starter));
        assert_eq!(ents.competitor_limit, 3);
        assert_eq!(ents.insight_severity_gate, Some(SeverityGate::HighOnly));
    }

    #[test]
    fn test_trial_user_is_starter_without_digest() {
        let rules = PlanRules::default();
        let trial = user(false, TrialStatus::Active, Some(24));
        let ents = resolve_entitlements(&trial, &rules, Utc::now());
        assert!(ents.has_access);
        assert_eq!(ents.access_source, AccessSource::Trial);
        assert_eq!(ents.plan_tier, Some(PlanTier::Starter));
        assert!(!ents.can_receive_weekly_digest);
    }

    #[test]
    fn test_expired_trial_has_no_access() {
        let rules = PlanRules::default();
        let expired = user(false, TrialStatus::Active, Some(-1));
        let ents = resolve_entitlements(&expired, &rules, Utc::now());
        assert!(!ents.has_access);
        assert_eq!(ents.competitor_limit, 0);
        assert!(ents.insight_severity_gate.is_none());
    }

    #[test]
    fn test_pending_transitions() {
        let now = Utc::now();
        assert_eq!(
            pending_trial_transition(&user(true, TrialStatus::Active, Some(24)), now),
            Some(TrialStatus::Converted)
        );
        assert_eq!(
            pending_trial_transition(&user(false, TrialStatus::Active, Some(-1)), now),
            Some(TrialStatus::Expired)
        );
        assert_eq!(
            pending_trial_transition(&user(false, TrialStatus::Active, Some(24)), now),
            None
        );
        assert_eq!(
            pending_trial_transition(&user(false, TrialStatus::Expired, None), now),
            None
        );
    }

    #[tokio::test]
    async fn test_refresh_persists_expiry() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let rules = PlanRules::default();

        store
            .upsert_user(
                UpsertUser {
                    user_id: "u-1".to_string(),
                    trial_status: TrialStatus::Active,
                    trial_started_at: Some(now - Duration::days(15)),
                    trial_ends_at: Some(now - Duration::days(1)),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        let user = store.get_user("u-1").await.unwrap().unwrap();
        let (refreshed, ents) = refresh_and_resolve(&store, &user, &rules, now).await.unwrap();
        assert_eq!(refreshed.trial_status, TrialStatus::Expired);
        assert!(!ents.has_access);

        // Idempotent on a second pass.
        let (again, _) = refresh_and_resolve(&store, &refreshed, &rules, now).await.unwrap();
        assert_eq!(again.trial_status, TrialStatus::Expired);
    }
}
