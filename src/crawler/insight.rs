//! Rules-based insight generation.
//!
//! Deterministic `rules-v1` generator: no tokens, no cost. The token and
//! cost fields on [`Insight`] are carried for a future LLM generator that
//! returns the same shape.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Diff, Entitlements, Insight, InsightFeedback, NormalizedDiff, PriceChangeSummary,
    Recommendation, Severity, VerificationState,
};

pub const INSIGHT_MODEL: &str = "rules-v1";

/// Whether an insight should be written for a diff, and why not when not.
#[derive(Debug)]
pub enum InsightDecision {
    Create(Box<Insight>),
    Skip { reason: &'static str },
}

/// Gate check shared by the runner and the builder.
pub fn can_generate_insight(entitlements: &Entitlements, severity: Severity) -> bool {
    entitlements.has_access
        && entitlements
            .insight_severity_gate
            .map(|gate| gate.allows(severity))
            .unwrap_or(false)
}

/// Decide whether to emit an insight for `diff` under `entitlements`.
pub fn decide_insight(
    entitlements: &Entitlements,
    diff: &Diff,
    now: DateTime<Utc>,
) -> InsightDecision {
    if !entitlements.has_access {
        return InsightDecision::Skip { reason: "no_access" };
    }
    let Some(gate) = entitlements.insight_severity_gate else {
        return InsightDecision::Skip { reason: "no_gate" };
    };
    if !gate.allows(diff.severity) {
        return InsightDecision::Skip {
            reason: "severity_below_gate",
        };
    }

    let recommendation = build_recommendation(diff);
    InsightDecision::Create(Box::new(Insight {
        insight_id: Uuid::new_v4().to_string(),
        user_id: diff.user_id.clone(),
        company_id: diff.company_id.clone(),
        diff_id: diff.diff_id.clone(),
        model: INSIGHT_MODEL.to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        total_cost_usd: 0.0,
        recommendation,
        severity_gate: gate,
        generated_at: now,
        feedback: InsightFeedback::None,
    }))
}

fn build_recommendation(diff: &Diff) -> Recommendation {
    let summary = price_change_summary(&diff.normalized_diff);
    let severity_word = match diff.severity {
        Severity::High => "High",
        Severity::Medium => "Medium",
        Severity::Low => "Low",
    };

    let mut prose = format!(
        "Competitor pricing changed: {} updated, {} added, {} removed across {} bucket(s).",
        summary.updated,
        summary.added,
        summary.removed,
        diff.normalized_diff.buckets.len()
    );
    if !diff.normalized_diff.added_hints.is_empty() {
        prose.push_str(&format!(
            " New custom-pricing signals: {}.",
            diff.normalized_diff.added_hints.join(", ")
        ));
    }
    if !diff.normalized_diff.removed_hints.is_empty() {
        prose.push_str(&format!(
            " Dropped custom-pricing signals: {}.",
            diff.normalized_diff.removed_hints.join(", ")
        ));
    }

    Recommendation {
        headline: format!("{severity_word}-severity pricing change detected"),
        summary: prose,
        risk_label: diff.severity.as_str().to_string(),
        severity: diff.severity,
        verification_state: diff.verification_state,
        action_items: action_items(diff.severity, diff.verification_state),
        price_changes: summary,
        bucket_lines: bucket_lines(&diff.normalized_diff),
    }
}

fn price_change_summary(normalized: &NormalizedDiff) -> PriceChangeSummary {
    let mut summary = PriceChangeSummary::default();
    for bucket in &normalized.buckets {
        summary.added += bucket.added.len();
        summary.removed += bucket.removed.len();
        summary.updated += bucket.updated.len();
    }
    summary
}

fn action_items(severity: Severity, verification: VerificationState) -> Vec<String> {
    let mut items = Vec::new();
    match severity {
        Severity::High => {
            items.push(
                "Review competitor positioning and update your pricing strategy within 24 hours."
                    .to_string(),
            );
        }
        Severity::Medium => {
            items.push("Schedule a pricing review with your team this week.".to_string());
        }
        Severity::Low => {
            items.push("Note the change and watch the next crawl for follow-up moves.".to_string());
        }
    }
    if verification == VerificationState::Unverified {
        items.push(
            "Manually verify the competitor pricing page before acting on this change."
                .to_string(),
        );
    }
    items
}

fn bucket_lines(normalized: &NormalizedDiff) -> Vec<String> {
    let mut lines = Vec::new();
    for bucket in &normalized.buckets {
        let mut parts = Vec::new();
        for update in &bucket.updated {
            parts.push(format!(
                "{:.2} -> {:.2} ({:+.1}%)",
                update.previous,
                update.current,
                if update.current >= update.previous {
                    update.pct_delta
                } else {
                    -update.pct_delta
                }
            ));
        }
        if !bucket.added.is_empty() {
            parts.push(format!(
                "added {}",
                bucket
                    .added
                    .iter()
                    .map(|a| format!("{a:.2}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if !bucket.removed.is_empty() {
            parts.push(format!(
                "removed {}",
                bucket
                    .removed
                    .iter()
                    .map(|a| format!("{a:.2}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        lines.push(format!(
            "{} {}: {}",
            bucket.currency,
            bucket.period.as_str(),
            parts.join("; ")
        ));
    }
    for hint in &normalized.added_hints {
        lines.push(format!("new hint: {hint}"));
    }
    for hint in &normalized.removed_hints {
        lines.push(format!("dropped hint: {hint}"));
    }
    lines
}
