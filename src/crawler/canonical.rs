//! Canonical form for pricing payloads.
//!
//! Everything downstream (hash gate aside, which hashes page text) compares
//! payloads structurally, so the same page content must always canonicalize
//! to the same value. Idempotent: canonicalizing twice is a no-op.

use std::collections::BTreeSet;

use crate::models::{PriceMention, PricingPayload};

/// Round to 2 decimal places.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Integer cents for de-duplication keys; avoids float-equality churn.
fn cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Produce the canonical payload: trimmed title/description, lowercased +
/// de-duplicated + sorted plan names and hints, uppercased currencies,
/// 2-dp amounts, mentions unique by `(currency, period, amount)` and sorted
/// by `(currency, period, amount)`.
pub fn canonicalize(payload: PricingPayload) -> PricingPayload {
    let page_title = payload
        .page_title
        .map(|t| collapse(&t))
        .filter(|t| !t.is_empty());
    let page_description = payload
        .page_description
        .map(|d| collapse(&d))
        .filter(|d| !d.is_empty());

    let plan_names = normalize_string_set(payload.plan_names);
    let custom_pricing_hints = normalize_string_set(payload.custom_pricing_hints);

    let mut seen = BTreeSet::new();
    let mut price_mentions: Vec<PriceMention> = Vec::new();
    for mention in payload.price_mentions {
        let amount = round2(mention.amount);
        let currency = mention.currency.trim().to_uppercase();
        let key = (currency.clone(), mention.period, cents(amount));
        if seen.insert(key) {
            price_mentions.push(PriceMention {
                amount,
                currency,
                period: mention.period,
            });
        }
    }
    price_mentions.sort_by(|a, b| {
        a.currency
            .cmp(&b.currency)
            .then(a.period.cmp(&b.period))
            .then(cents(a.amount).cmp(&cents(b.amount)))
    });

    PricingPayload {
        source_url: payload.source_url.trim().to_string(),
        page_title,
        page_description,
        plan_names,
        price_mentions,
        custom_pricing_hints,
    }
}

fn normalize_string_set(values: Vec<String>) -> Vec<String> {
    let set: BTreeSet<String> = values
        .into_iter()
        .map(|v| collapse(&v).to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    set.into_iter().collect()
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PricePeriod;

    fn mention(amount: f64, currency: &str, period: PricePeriod) -> PriceMention {
        PriceMention {
            amount,
            currency: currency.to_string(),
            period,
        }
    }

    #[test]
    fn test_canonicalize_sorts_and_dedupes_mentions() {
        let payload = PricingPayload {
            source_url: " https://acme.example/pricing ".to_string(),
            plan_names: vec!["Pro".to_string(), "  pro ".to_string(), "Starter".to_string()],
            price_mentions: vec![
                mention(49.0, "usd", PricePeriod::Month),
                mention(19.004, "USD", PricePeriod::Month),
                mention(49.001, "USD", PricePeriod::Month),
                mention(19.0, "USD", PricePeriod::Year),
            ],
            custom_pricing_hints: vec!["Contact Sales".to_string(), "contact sales".to_string()],
            ..Default::default()
        };

        let canonical = canonicalize(payload);
        assert_eq!(canonical.source_url, "https://acme.example/pricing");
        assert_eq!(canonical.plan_names, vec!["pro", "starter"]);
        assert_eq!(canonical.custom_pricing_hints, vec!["contact sales"]);

        let amounts: Vec<(String, PricePeriod, f64)> = canonical
            .price_mentions
            .iter()
            .map(|m| (m.currency.clone(), m.period, m.amount))
            .collect();
        assert_eq!(
            amounts,
            vec![
                ("USD".to_string(), PricePeriod::Month, 19.0),
                ("USD".to_string(), PricePeriod::Month, 49.0),
                ("USD".to_string(), PricePeriod::Year, 19.0),
            ]
        );
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let payload = PricingPayload {
            source_url: "https://acme.example/pricing".to_string(),
            page_title: Some("  Pricing   page ".to_string()),
            plan_names: vec!["Enterprise".to_string(), "Starter".to_string()],
            price_mentions: vec![
                mention(99.999, "eur", PricePeriod::Year),
                mention(10.0, "USD", PricePeriod::Month),
            ],
            custom_pricing_hints: vec!["book a demo".to_string()],
            ..Default::default()
        };

        let once = canonicalize(payload);
        let twice = canonicalize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(19.004), 19.0);
        assert_eq!(round2(19.006), 19.01);
        assert_eq!(round2(0.1 + 0.2), 0.3);
        assert_eq!(round2(100.0), 100.0);
    }
}
