//! Pricing-URL discovery.
//!
//! Scores a homepage's internal links as pricing-page candidates. A primary
//! URL is only recommended when the winner is both confident and clearly
//! ahead of the runner-up; ambiguous homepages stay unresolved for the user
//! to pick from the candidate list.

use tracing::{debug, warn};

use crate::crawler::fetch::PageFetcher;
use crate::crawler::html::extract_anchors;
use crate::crawler::url::{matches_domain, normalize_url, resolve_href};
use crate::models::PricingUrlCandidate;

/// Candidates scoring under this are dropped outright.
const MIN_CANDIDATE_CONFIDENCE: f64 = 0.35;
/// At most this many candidates are kept per discovery run.
const MAX_CANDIDATES: usize = 8;
/// Awarded when both a path pattern and an anchor-text pattern hit.
const BOTH_HIT_BONUS: f64 = 0.07;

/// Anchor-text patterns, best match wins.
const TEXT_SCORES: [(&str, f64); 4] = [
    ("pricing", 0.35),
    ("plans", 0.30),
    ("plan", 0.25),
    ("free trial", 0.20),
];

const NEGATIVE_PATHS: [&str; 6] = ["/blog", "/docs", "/legal", "/login", "/signup", "/careers"];
const NEGATIVE_TEXTS: [&str; 3] = ["blog", "docs", "login"];
const ASSET_EXTENSIONS: [&str; 10] = [
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".css", ".js", ".pdf", ".ico",
];

/// Threshold knobs for the primary-URL recommendation; empirically chosen
/// defaults live in `Config`, not here.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverySettings {
    pub primary_min_confidence: f64,
    pub primary_min_gap: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub candidates: Vec<PricingUrlCandidate>,
    pub recommended_primary_url: Option<String>,
}

/// Fetch a homepage and score its internal anchors as pricing candidates.
/// Fetch failures yield an empty outcome; discovery is best-effort.
pub async fn discover(
    fetcher: &dyn PageFetcher,
    homepage_url: &str,
    allowed_domain: &str,
    settings: DiscoverySettings,
) -> DiscoveryOutcome {
    let Some(homepage) = normalize_url(homepage_url) else {
        warn!(homepage_url, "Discovery skipped: invalid homepage URL");
        return DiscoveryOutcome::default();
    };

    let html = match fetcher.fetch(&homepage).await {
        Ok(html) => html,
        Err(failure) => {
            warn!(homepage = %homepage, ?failure, "Discovery fetch failed");
            return DiscoveryOutcome::default();
        }
    };

    let candidates = score_anchors(&homepage, allowed_domain, &extract_anchors(&html));
    let recommended_primary_url = recommend_primary(&candidates, settings);
    debug!(
        homepage = %homepage,
        candidates = candidates.len(),
        recommended = recommended_primary_url.is_some(),
        "Discovery complete"
    );

    DiscoveryOutcome {
        candidates,
        recommended_primary_url,
    }
}

/// Score raw `(href, text)` anchor pairs against `allowed_domain`.
pub fn score_anchors(
    base_url: &str,
    allowed_domain: &str,
    anchors: &[(String, String)],
) -> Vec<PricingUrlCandidate> {
    let mut scored: Vec<PricingUrlCandidate> = Vec::new();

    for (href, text) in anchors {
        let href = href.trim();
        let lower_href = href.to_ascii_lowercase();
        if href.is_empty()
            || lower_href.starts_with("mailto:")
            || lower_href.starts_with("tel:")
            || lower_href.starts_with("javascript:")
            || href.starts_with('#')
        {
            continue;
        }
        let Some(url) = resolve_href(base_url, href) else {
            continue;
        };
        if !matches_domain(&url, allowed_domain) {
            continue;
        }

        let confidence = score_candidate(&url, text);
        if confidence < MIN_CANDIDATE_CONFIDENCE {
            continue;
        }

        // Union by URL, keeping the best score seen.
        match scored.iter_mut().find(|c| c.url == url) {
            Some(existing) => existing.confidence = existing.confidence.max(confidence),
            None => scored.push(PricingUrlCandidate {
                url,
                confidence,
                selected_by_user: false,
            }),
        }
    }

    sort_candidates(&mut scored);
    scored.truncate(MAX_CANDIDATES);
    scored
}

/// Weighted path + anchor-text score, clamped to [0, 1], 2 dp.
fn score_candidate(url: &str, anchor_text: &str) -> f64 {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    let text = anchor_text.to_lowercase();

    if ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return 0.0;
    }

    // Slash-anchored patterns match as path prefixes; the bare token catches
    // things like `/product/pricing-and-plans`.
    let path_hits = [
        (path.starts_with("/pricing"), 0.85),
        (path.starts_with("/plans"), 0.80),
        (path.starts_with("/plan"), 0.75),
        (path.contains("pricing"), 0.55),
    ];
    let path_score = path_hits
        .iter()
        .filter(|(hit, _)| *hit)
        .map(|(_, score)| *score)
        .fold(0.0f64, f64::max);
    let text_score = TEXT_SCORES
        .iter()
        .filter(|(pattern, _)| text.contains(pattern))
        .map(|(_, score)| *score)
        .fold(0.0f64, f64::max);

    let mut score = path_score + text_score;
    if path_score > 0.0 && text_score > 0.0 {
        score += BOTH_HIT_BONUS;
    }
    if NEGATIVE_PATHS.iter().any(|p| path.contains(p)) {
        score -= 0.80;
    }
    if NEGATIVE_TEXTS.iter().any(|t| text.contains(t)) {
        score -= 0.40;
    }

    (score.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

/// Recommend the top candidate only when it is confident and unambiguous.
fn recommend_primary(
    candidates: &[PricingUrlCandidate],
    settings: DiscoverySettings,
) -> Option<String> {
    let top = candidates.first()?;
    if top.confidence < settings.primary_min_confidence {
        return None;
    }
    if let Some(runner_up) = candidates.get(1) {
        if top.confidence - runner_up.confidence < settings.primary_min_gap {
            return None;
        }
    }
    Some(top.url.clone())
}

/// Candidate ordering used everywhere: confidence desc, url asc.
pub fn sort_candidates(candidates: &mut [PricingUrlCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.url.cmp(&b.url))
    });
}

/// Merge candidate lists: union by normalized URL, maximum confidence wins,
/// `selected_by_user` is OR-reduced. Commutative.
pub fn merge_candidates(
    existing: &[PricingUrlCandidate],
    incoming: &[PricingUrlCandidate],
) -> Vec<PricingUrlCandidate> {
    let mut merged: Vec<PricingUrlCandidate> = Vec::new();
    for candidate in existing.iter().chain(incoming.iter()) {
        let Some(url) = normalize_url(&candidate.url) else {
            continue;
        };
        match merged.iter_mut().find(|c| c.url == url) {
            Some(slot) => {
                slot.confidence = slot.confidence.max(candidate.confidence);
                slot.selected_by_user = slot.selected_by_user || candidate.selected_by_user;
            }
            None => merged.push(PricingUrlCandidate {
                url,
                confidence: candidate.confidence,
                selected_by_user: candidate.selected_by_user,
            }),
        }
    }
    sort_candidates(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            primary_min_confidence: 0.86,
            primary_min_gap: 0.08,
        }
    }

    fn anchor(href: &str, text: &str) -> (String, String) {
        (href.to_string(), text.to_string())
    }

    #[test]
    fn test_pricing_anchor_scores_to_one() {
        let candidates = score_anchors(
            "https://acme.example/",
            "acme.example",
            &[anchor("/pricing", "Pricing")],
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://acme.example/pricing");
        assert_eq!(candidates[0].confidence, 1.0);
    }

    #[test]
    fn test_offsite_and_scheme_anchors_dropped() {
        let candidates = score_anchors(
            "https://acme.example/",
            "acme.example",
            &[
                anchor("https://other.example/pricing", "Pricing"),
                anchor("mailto:sales@acme.example", "Pricing"),
                anchor("javascript:void(0)", "Pricing"),
                anchor("#pricing", "Pricing"),
                anchor("tel:+15555550100", "Pricing"),
            ],
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_subdomain_anchors_kept() {
        let candidates = score_anchors(
            "https://acme.example/",
            "acme.example",
            &[anchor("https://app.acme.example/plans", "Plans")],
        );
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_negative_paths_and_assets_dropped() {
        let candidates = score_anchors(
            "https://acme.example/",
            "acme.example",
            &[
                anchor("/blog/pricing-update", "Pricing changes"),
                anchor("/pricing.pdf", "Pricing"),
                anchor("/docs/pricing", "Pricing docs"),
            ],
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_recommend_requires_confidence_and_gap() {
        let clear = vec![
            PricingUrlCandidate {
                url: "https://acme.example/pricing".to_string(),
                confidence: 0.95,
                selected_by_user: false,
            },
            PricingUrlCandidate {
                url: "https://acme.example/plans".to_string(),
                confidence: 0.60,
                selected_by_user: false,
            },
        ];
        assert_eq!(
            recommend_primary(&clear, settings()),
            Some("https://acme.example/pricing".to_string())
        );

        let ambiguous = vec![
            PricingUrlCandidate {
                url: "https://acme.example/pricing".to_string(),
                confidence: 0.90,
                selected_by_user: false,
            },
            PricingUrlCandidate {
                url: "https://acme.example/plans".to_string(),
                confidence: 0.87,
                selected_by_user: false,
            },
        ];
        assert_eq!(recommend_primary(&ambiguous, settings()), None);

        let weak = vec![PricingUrlCandidate {
            url: "https://acme.example/maybe".to_string(),
            confidence: 0.50,
            selected_by_user: false,
        }];
        assert_eq!(recommend_primary(&weak, settings()), None);
        assert_eq!(recommend_primary(&[], settings()), None);
    }

    #[test]
    fn test_merge_is_commutative_and_keeps_max() {
        let a = vec![PricingUrlCandidate {
            url: "https://acme.example/pricing".to_string(),
            confidence: 0.70,
            selected_by_user: true,
        }];
        let b = vec![
            PricingUrlCandidate {
                url: "https://www.acme.example/pricing".to_string(),
                confidence: 0.90,
                selected_by_user: false,
            },
            PricingUrlCandidate {
                url: "https://acme.example/plans".to_string(),
                confidence: 0.55,
                selected_by_user: false,
            },
        ];

        let ab = merge_candidates(&a, &b);
        let ba = merge_candidates(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 2);
        assert_eq!(ab[0].url, "https://acme.example/pricing");
        assert_eq!(ab[0].confidence, 0.90);
        assert!(ab[0].selected_by_user);
    }

    #[tokio::test]
    async fn test_discover_scores_homepage_anchors() {
        use crate::crawler::fetch::ScriptedFetcher;

        let html = r#"<nav>
            <a href="/pricing">Pricing</a>
            <a href="/blog">Blog</a>
            <a href="/about">About</a>
        </nav>"#;
        let fetcher = ScriptedFetcher::new().with_html("https://acme.example/", html);

        let outcome = discover(&fetcher, "https://acme.example", "acme.example", settings()).await;
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(
            outcome.recommended_primary_url,
            Some("https://acme.example/pricing".to_string())
        );
    }

    #[tokio::test]
    async fn test_discover_fetch_failure_is_empty() {
        use crate::crawler::fetch::{FetchFailure, ScriptedFetcher};

        let fetcher = ScriptedFetcher::new().with_failure(
            "https://acme.example/",
            FetchFailure::Error("HTTP 502".to_string()),
        );
        let outcome = discover(&fetcher, "https://acme.example", "acme.example", settings()).await;
        assert!(outcome.candidates.is_empty());
        assert!(outcome.recommended_primary_url.is_none());
    }
}
