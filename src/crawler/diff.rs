//! Snapshot-to-snapshot diffing.
//!
//! Amounts are bucketed by `(currency, period)` and paired positionally
//! (lowest previous against lowest current). Sub-50-cent or sub-1% moves are
//! dropped so rounding churn never produces a diff; severity is derived only
//! from changes that survive the gate.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::crawler::canonical::round2;
use crate::models::{
    BucketChange, NormalizedDiff, PricePeriod, PricingPayload, Severity, UpdatedPrice,
};

/// Paired amounts must move by at least this much, absolutely...
pub const MIN_ABS_DELTA: f64 = 0.50;
/// ...and by at least this percentage, to count as `updated`.
pub const MIN_PCT_DELTA: f64 = 1.0;

const HIGH_PCT_THRESHOLD: f64 = 20.0;
const MEDIUM_PCT_THRESHOLD: f64 = 10.0;

/// Compute the bucketed delta between two canonical payloads.
///
/// Returns `None` when nothing survives the noise gate; a `Diff` record is
/// only ever written for a non-empty delta.
pub fn compute_diff(
    previous: &PricingPayload,
    current: &PricingPayload,
    changed_at: DateTime<Utc>,
) -> Option<(NormalizedDiff, Severity)> {
    let mut keys: BTreeSet<(String, PricePeriod)> = BTreeSet::new();
    let prev_buckets = bucket_amounts(previous);
    let curr_buckets = bucket_amounts(current);
    keys.extend(prev_buckets.keys().cloned());
    keys.extend(curr_buckets.keys().cloned());

    let mut buckets = Vec::new();
    let mut max_pct_delta: f64 = 0.0;
    let mut total_added = 0usize;
    let mut total_removed = 0usize;
    let mut total_updated = 0usize;

    for key in keys {
        let empty = Vec::new();
        let prev = prev_buckets.get(&key).unwrap_or(&empty);
        let curr = curr_buckets.get(&key).unwrap_or(&empty);

        let mut change = BucketChange {
            currency: key.0.clone(),
            period: key.1,
            ..Default::default()
        };

        for i in 0..prev.len().max(curr.len()) {
            match (prev.get(i), curr.get(i)) {
                (Some(&p), Some(&c)) => {
                    let abs_delta = (c - p).abs();
                    // A previously-zero pairing rates as a full move.
                    let pct_delta = if p == 0.0 { 100.0 } else { abs_delta / p * 100.0 };
                    if abs_delta >= MIN_ABS_DELTA && pct_delta >= MIN_PCT_DELTA {
                        max_pct_delta = max_pct_delta.max(pct_delta);
                        change.updated.push(UpdatedPrice {
                            previous: p,
                            current: c,
                            abs_delta: round2(abs_delta),
                            pct_delta: round2(pct_delta),
                        });
                    }
                }
                (Some(&p), None) => change.removed.push(p),
                (None, Some(&c)) => change.added.push(c),
                (None, None) => {}
            }
        }

        if change.added.is_empty() && change.removed.is_empty() && change.updated.is_empty() {
            continue;
        }
        total_added += change.added.len();
        total_removed += change.removed.len();
        total_updated += change.updated.len();
        buckets.push(change);
    }

    let added_hints = set_difference(&current.custom_pricing_hints, &previous.custom_pricing_hints);
    let removed_hints =
        set_difference(&previous.custom_pricing_hints, &current.custom_pricing_hints);

    if buckets.is_empty() && added_hints.is_empty() && removed_hints.is_empty() {
        return None;
    }

    let hints_changed = !added_hints.is_empty() || !removed_hints.is_empty();
    let severity = assign_severity(
        max_pct_delta,
        total_added,
        total_removed,
        total_updated,
        hints_changed,
    );

    let normalized = NormalizedDiff {
        buckets,
        added_hints,
        removed_hints,
        previous_price_count: previous.price_mentions.len(),
        current_price_count: current.price_mentions.len(),
        previous_plan_count: previous.plan_names.len(),
        current_plan_count: current.plan_names.len(),
        changed_at,
    };

    Some((normalized, severity))
}

fn bucket_amounts(payload: &PricingPayload) -> BTreeMap<(String, PricePeriod), Vec<f64>> {
    let mut buckets: BTreeMap<(String, PricePeriod), Vec<f64>> = BTreeMap::new();
    for mention in &payload.price_mentions {
        buckets
            .entry((mention.currency.clone(), mention.period))
            .or_default()
            .push(mention.amount);
    }
    for amounts in buckets.values_mut() {
        amounts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    }
    buckets
}

fn set_difference(a: &[String], b: &[String]) -> Vec<String> {
    let b: BTreeSet<&String> = b.iter().collect();
    a.iter().filter(|x| !b.contains(x)).cloned().collect()
}

fn assign_severity(
    max_pct_delta: f64,
    added: usize,
    removed: usize,
    updated: usize,
    hints_changed: bool,
) -> Severity {
    if max_pct_delta >= HIGH_PCT_THRESHOLD || (added >= 2 && removed >= 2) {
        Severity::High
    } else if max_pct_delta >= MEDIUM_PCT_THRESHOLD
        || added + removed + updated >= 2
        || hints_changed
    {
        Severity::Medium
    } else {
        Severity::Low
    }
}
