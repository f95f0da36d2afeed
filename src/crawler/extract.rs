//! Static pricing-page extraction.
//!
//! Turns fetched HTML into a canonical [`PricingPayload`] plus a confidence
//! score, or a classified failure. All parsing is plain text scanning so the
//! whole module is testable without network access.

use crate::crawler::canonical::{canonicalize, round2};
use crate::crawler::fetch::{FetchFailure, PageFetcher};
use crate::crawler::html::{
    content_hash, extract_headings, extract_meta_description, extract_title,
    normalize_html_for_hash, strip_html_to_text,
};
use crate::crawler::url::normalize_url;
use crate::models::{CaptureMethod, CrawlStatus, PriceMention, PricePeriod, PricingPayload};

/// Snapshots at or above this confidence with at least one price mention
/// count as verified.
pub const VERIFIED_CONFIDENCE_THRESHOLD: f64 = 0.75;

/// Markers that identify a bot-protection interstitial rather than content.
const BOT_BLOCK_MARKERS: [&str; 7] = [
    "captcha",
    "cloudflare",
    "access denied",
    "attention required",
    "verify you are human",
    "bot detection",
    "temporarily blocked",
];

const PRICING_SIGNALS: [&str; 8] = [
    "pricing",
    "plans",
    "per month",
    "monthly",
    "yearly",
    "annual",
    "billed",
    "free trial",
];

const CUSTOM_PRICING_SIGNALS: [&str; 6] = [
    "contact sales",
    "custom pricing",
    "talk to sales",
    "enterprise pricing",
    "request a quote",
    "book a demo",
];

/// A heading is a plan-name candidate when it mentions one of these.
const PLAN_NAME_MARKERS: [&str; 6] = ["plan", "pricing", "starter", "pro", "business", "enterprise"];

const MAX_PLAN_NAME_LEN: usize = 80;

/// Result of one extraction attempt against a pricing URL.
#[derive(Debug, Clone)]
pub enum PricingExtraction {
    Ok(ExtractedPage),
    /// `status` is one of `blocked`, `manual_needed`, `error`.
    Failed { status: CrawlStatus, error: String },
}

#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Hash of the normalized page text, not the raw HTML.
    pub content_hash: String,
    pub payload: PricingPayload,
    pub confidence: f64,
    pub is_verified: bool,
    pub capture_method: CaptureMethod,
}

impl PricingExtraction {
    fn failed(status: CrawlStatus, error: impl Into<String>) -> Self {
        PricingExtraction::Failed {
            status,
            error: error.into(),
        }
    }
}

/// Fetch and extract one pricing URL.
pub async fn extract_pricing_page(fetcher: &dyn PageFetcher, url: &str) -> PricingExtraction {
    let Some(normalized) = normalize_url(url) else {
        return PricingExtraction::failed(
            CrawlStatus::ManualNeeded,
            format!("Invalid pricing URL: {url}"),
        );
    };

    match fetcher.fetch(&normalized).await {
        Ok(html) => extract_from_html(&normalized, &html),
        Err(FetchFailure::Blocked(message)) => {
            PricingExtraction::failed(CrawlStatus::Blocked, message)
        }
        Err(FetchFailure::ManualNeeded(message)) => {
            PricingExtraction::failed(CrawlStatus::ManualNeeded, message)
        }
        Err(FetchFailure::Error(message)) => PricingExtraction::failed(CrawlStatus::Error, message),
    }
}

/// Pure extraction over already-fetched HTML.
pub fn extract_from_html(url: &str, html: &str) -> PricingExtraction {
    let text = strip_html_to_text(html);
    let lower = text.to_lowercase();

    if let Some(marker) = BOT_BLOCK_MARKERS.iter().find(|m| lower.contains(**m)) {
        return PricingExtraction::failed(
            CrawlStatus::Blocked,
            format!("Bot protection detected ({marker})"),
        );
    }

    let price_mentions = scan_price_mentions(&text);
    let has_pricing_signal = PRICING_SIGNALS.iter().any(|s| lower.contains(s));
    let custom_pricing_hints: Vec<String> = CUSTOM_PRICING_SIGNALS
        .iter()
        .filter(|s| lower.contains(**s))
        .map(|s| s.to_string())
        .collect();

    let confidence = confidence_for(
        price_mentions.len(),
        has_pricing_signal,
        !custom_pricing_hints.is_empty(),
    );
    if confidence <= 0.0 {
        return PricingExtraction::failed(
            CrawlStatus::ManualNeeded,
            "No pricing signals found on page",
        );
    }

    let payload = canonicalize(PricingPayload {
        source_url: url.to_string(),
        page_title: extract_title(html),
        page_description: extract_meta_description(html),
        plan_names: plan_name_candidates(html),
        price_mentions,
        custom_pricing_hints,
    });

    let is_verified =
        confidence >= VERIFIED_CONFIDENCE_THRESHOLD && !payload.price_mentions.is_empty();

    PricingExtraction::Ok(ExtractedPage {
        content_hash: content_hash(&normalize_html_for_hash(html)),
        payload,
        confidence,
        is_verified,
        capture_method: CaptureMethod::Static,
    })
}

/// Confidence ladder over extraction evidence.
pub fn confidence_for(price_count: usize, has_pricing_signal: bool, has_custom_signal: bool) -> f64 {
    if price_count >= 3 {
        0.90
    } else if price_count >= 1 {
        if has_pricing_signal {
            0.78
        } else {
            0.72
        }
    } else if has_custom_signal {
        0.45
    } else if has_pricing_signal {
        0.40
    } else {
        0.0
    }
}

/// Heading texts that look like plan names, length-bounded.
fn plan_name_candidates(html: &str) -> Vec<String> {
    extract_headings(html)
        .into_iter()
        .filter(|h| {
            let lower = h.to_lowercase();
            PLAN_NAME_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|h| truncate_chars(h.trim(), MAX_PLAN_NAME_LEN))
        .filter(|h| !h.is_empty())
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

const ISO_CODES: [&str; 6] = ["USD", "EUR", "GBP", "CAD", "AUD", "JPY"];

fn symbol_currency(c: char) -> Option<&'static str> {
    match c {
        '$' => Some("USD"),
        '€' => Some("EUR"),
        '£' => Some("GBP"),
        '¥' => Some("JPY"),
        _ => None,
    }
}

/// Scan page text for price mentions: an optional uppercase ISO code, an
/// optional currency symbol (at least one of the two is required), an amount
/// with thousands separators and up to two decimals, and an optional trailing
/// period token. Non-positive amounts are discarded.
pub fn scan_price_mentions(text: &str) -> Vec<PriceMention> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match parse_mention_at(&chars, i) {
            Some((Some(mention), next)) => {
                out.push(mention);
                i = next;
            }
            // Parsed a price-shaped token that was discarded (amount <= 0).
            Some((None, next)) => i = next,
            None => i += 1,
        }
    }
    out
}

type ParsedMention = (Option<PriceMention>, usize);

fn parse_mention_at(chars: &[char], start: usize) -> Option<ParsedMention> {
    let mut i = start;
    let mut currency: Option<&'static str> = None;

    // Optional leading ISO code with word boundaries on both sides.
    if let Some(code) = iso_code_at(chars, i) {
        currency = Some(code);
        i += 3;
        i = skip_spaces(chars, i);
    }

    // Optional leading symbol; wins only when no ISO code was present.
    if i < chars.len() {
        if let Some(code) = symbol_currency(chars[i]) {
            currency.get_or_insert(code);
            i += 1;
            i = skip_spaces(chars, i);
        }
    }

    // Bare numbers are not prices.
    let currency = currency?;

    let (amount, after_amount) = parse_amount(chars, i)?;
    let (period, next) = parse_period(chars, after_amount);

    if amount <= 0.0 {
        return Some((None, after_amount));
    }

    Some((
        Some(PriceMention {
            amount: round2(amount),
            currency: currency.to_string(),
            period,
        }),
        next,
    ))
}

fn iso_code_at(chars: &[char], i: usize) -> Option<&'static str> {
    if i + 3 > chars.len() {
        return None;
    }
    let left_boundary = i == 0 || !chars[i - 1].is_alphanumeric();
    let right_boundary = i + 3 == chars.len() || !chars[i + 3].is_alphanumeric();
    if !left_boundary || !right_boundary {
        return None;
    }
    let token: String = chars[i..i + 3].iter().collect();
    ISO_CODES.iter().find(|c| **c == token).copied()
}

fn skip_spaces(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i] == ' ' {
        i += 1;
    }
    i
}

/// Parse `1,299.99`-style amounts. A comma only counts as a thousands
/// separator when followed by exactly three digits; a dot only counts as a
/// decimal point when followed by one or two digits.
fn parse_amount(chars: &[char], start: usize) -> Option<(f64, usize)> {
    let mut i = start;
    if i >= chars.len() || !chars[i].is_ascii_digit() {
        return None;
    }

    let mut digits = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            digits.push(c);
            i += 1;
        } else if c == ',' && group_of_three_at(chars, i + 1) {
            i += 1;
        } else {
            break;
        }
    }

    if i < chars.len() && chars[i] == '.' {
        let decimals = count_digits(chars, i + 1);
        if (1..=2).contains(&decimals) {
            digits.push('.');
            for offset in 0..decimals {
                digits.push(chars[i + 1 + offset]);
            }
            i += 1 + decimals;
        }
    }

    digits.parse::<f64>().ok().map(|amount| (amount, i))
}

fn group_of_three_at(chars: &[char], i: usize) -> bool {
    count_digits(chars, i) == 3
}

fn count_digits(chars: &[char], start: usize) -> usize {
    chars[start.min(chars.len())..]
        .iter()
        .take_while(|c| c.is_ascii_digit())
        .count()
}

/// Map the token following an amount to a billing period. Consumes the token
/// only on a match; unknown text is left for the outer scan.
fn parse_period(chars: &[char], after_amount: usize) -> (PricePeriod, usize) {
    let mut i = skip_spaces(chars, after_amount);

    if i < chars.len() && chars[i] == '/' {
        i = skip_spaces(chars, i + 1);
        let (word, end) = read_word(chars, i);
        if let Some(period) = slash_period(&word) {
            return (period, end);
        }
        return (PricePeriod::Unknown, after_amount);
    }

    let (word, end) = read_word(chars, i);
    match word.as_str() {
        "per" | "a" | "an" => {
            let j = skip_spaces(chars, end);
            let (unit, unit_end) = read_word(chars, j);
            if let Some(period) = slash_period(&unit) {
                return (period, unit_end);
            }
            (PricePeriod::Unknown, after_amount)
        }
        "mo" | "monthly" => (PricePeriod::Month, end),
        "yearly" | "annually" => (PricePeriod::Year, end),
        "weekly" => (PricePeriod::Week, end),
        "daily" => (PricePeriod::Day, end),
        "once" | "lifetime" => (PricePeriod::OneTime, end),
        "one" => {
            // `one-time` / `one time`
            let mut j = end;
            if j < chars.len() && (chars[j] == '-' || chars[j] == ' ') {
                j += 1;
                let (unit, unit_end) = read_word(chars, j);
                if unit == "time" {
                    return (PricePeriod::OneTime, unit_end);
                }
            }
            (PricePeriod::Unknown, after_amount)
        }
        _ => (PricePeriod::Unknown, after_amount),
    }
}

fn slash_period(word: &str) -> Option<PricePeriod> {
    match word {
        "day" | "days" => Some(PricePeriod::Day),
        "week" | "weeks" | "wk" => Some(PricePeriod::Week),
        "month" | "months" | "mo" | "m" => Some(PricePeriod::Month),
        "year" | "years" | "yr" | "annum" => Some(PricePeriod::Year),
        _ => None,
    }
}

fn read_word(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    let mut word = String::new();
    while i < chars.len() && chars[i].is_alphabetic() {
        word.push(chars[i].to_ascii_lowercase());
        i += 1;
    }
    (word, i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mentions(text: &str) -> Vec<(f64, String, PricePeriod)> {
        scan_price_mentions(text)
            .into_iter()
            .map(|m| (m.amount, m.currency, m.period))
            .collect()
    }

    #[test]
    fn test_scan_symbol_and_period_variants() {
        assert_eq!(
            mentions("Starter $19 / month Pro $49 per month"),
            vec![
                (19.0, "USD".to_string(), PricePeriod::Month),
                (49.0, "USD".to_string(), PricePeriod::Month),
            ]
        );
        assert_eq!(
            mentions("€99/yr and £5 weekly and ¥800 once"),
            vec![
                (99.0, "EUR".to_string(), PricePeriod::Year),
                (5.0, "GBP".to_string(), PricePeriod::Week),
                (800.0, "JPY".to_string(), PricePeriod::OneTime),
            ]
        );
    }

    #[test]
    fn test_scan_iso_codes() {
        assert_eq!(
            mentions("USD 1,299.50 per year or CAD 20 monthly"),
            vec![
                (1299.5, "USD".to_string(), PricePeriod::Year),
                (20.0, "CAD".to_string(), PricePeriod::Month),
            ]
        );
        // ISO code plus symbol is a single mention.
        assert_eq!(
            mentions("AUD $29/mo"),
            vec![(29.0, "AUD".to_string(), PricePeriod::Month)]
        );
    }

    #[test]
    fn test_scan_requires_currency_marker() {
        assert_eq!(mentions("49 per month with 20 users"), vec![]);
    }

    #[test]
    fn test_scan_discards_non_positive_amounts() {
        assert_eq!(mentions("$0 forever"), vec![]);
        assert_eq!(
            mentions("$0 free then $12/mo"),
            vec![(12.0, "USD".to_string(), PricePeriod::Month)]
        );
    }

    #[test]
    fn test_scan_thousands_and_decimals() {
        assert_eq!(
            mentions("$1,299 once, $14.99 a month"),
            vec![
                (1299.0, "USD".to_string(), PricePeriod::OneTime),
                (14.99, "USD".to_string(), PricePeriod::Month),
            ]
        );
        // Comma not followed by a group of three stops the amount.
        assert_eq!(
            mentions("$12,34 and friends"),
            vec![(12.0, "USD".to_string(), PricePeriod::Unknown)]
        );
    }

    #[test]
    fn test_scan_unknown_period_left_unconsumed() {
        assert_eq!(
            mentions("$19 Starter plan"),
            vec![(19.0, "USD".to_string(), PricePeriod::Unknown)]
        );
    }

    #[test]
    fn test_confidence_ladder() {
        assert_eq!(confidence_for(3, false, false), 0.90);
        assert_eq!(confidence_for(1, true, false), 0.78);
        assert_eq!(confidence_for(1, false, false), 0.72);
        assert_eq!(confidence_for(0, false, true), 0.45);
        assert_eq!(confidence_for(0, true, false), 0.40);
        assert_eq!(confidence_for(0, false, false), 0.0);
    }

    #[test]
    fn test_extract_verified_pricing_page() {
        let html = r#"<html><head><title>Acme Pricing</title></head><body>
            <h2>Starter plan</h2><p>$19 / month</p>
            <h2>Pro plan</h2><p>$49 per month</p>
            <p>Free trial included. $490 yearly.</p>
            </body></html>"#;

        match extract_from_html("https://acme.example/pricing", html) {
            PricingExtraction::Ok(page) => {
                assert_eq!(page.confidence, 0.90);
                assert!(page.is_verified);
                assert_eq!(page.capture_method, CaptureMethod::Static);
                assert_eq!(page.payload.price_mentions.len(), 3);
                assert_eq!(page.payload.plan_names, vec!["pro plan", "starter plan"]);
            }
            other => panic!("expected ok extraction, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_bot_blocked_page() {
        let html = "<html><body><h1>Attention Required! | Cloudflare</h1></body></html>";
        match extract_from_html("https://acme.example/pricing", html) {
            PricingExtraction::Failed { status, .. } => assert_eq!(status, CrawlStatus::Blocked),
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_no_signals_is_manual_needed() {
        let html = "<html><body><p>Welcome to our homepage.</p></body></html>";
        match extract_from_html("https://acme.example/", html) {
            PricingExtraction::Failed { status, .. } => {
                assert_eq!(status, CrawlStatus::ManualNeeded);
            }
            other => panic!("expected manual_needed, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_custom_pricing_only() {
        let html = "<html><body><h1>Enterprise</h1><p>Contact sales for a quote.</p></body></html>";
        match extract_from_html("https://acme.example/pricing", html) {
            PricingExtraction::Ok(page) => {
                assert_eq!(page.confidence, 0.45);
                assert!(!page.is_verified);
                assert_eq!(page.payload.custom_pricing_hints, vec!["contact sales"]);
                assert!(page.payload.price_mentions.is_empty());
            }
            other => panic!("expected ok extraction, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_name_candidates_filter_and_bound() {
        let long = format!("<h2>{} plan</h2>", "x".repeat(100));
        let html = format!("<h1>Pricing</h1><h2>About us</h2><h3>Business</h3>{long}");
        let names = plan_name_candidates(&html);
        assert!(names.contains(&"Pricing".to_string()));
        assert!(names.contains(&"Business".to_string()));
        assert!(!names.iter().any(|n| n.contains("About")));
        assert!(names.iter().all(|n| n.chars().count() <= 80));
    }
}
