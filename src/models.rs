//! Domain model for the pricing intelligence core.
//!
//! Entities are linked by ids only; payloads and candidate lists are stored
//! as JSON columns and round-trip through these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Company record kind. At most one `self` company exists per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyKind {
    #[serde(rename = "self")]
    Own,
    Competitor,
}

impl CompanyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyKind::Own => "self",
            CompanyKind::Competitor => "competitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "self" => Some(CompanyKind::Own),
            "competitor" => Some(CompanyKind::Competitor),
            _ => None,
        }
    }
}

/// Outcome of the most recent crawl of a company.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    #[default]
    Idle,
    Ok,
    Blocked,
    ManualNeeded,
    Error,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Idle => "idle",
            CrawlStatus::Ok => "ok",
            CrawlStatus::Blocked => "blocked",
            CrawlStatus::ManualNeeded => "manual_needed",
            CrawlStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(CrawlStatus::Idle),
            "ok" => Some(CrawlStatus::Ok),
            "blocked" => Some(CrawlStatus::Blocked),
            "manual_needed" => Some(CrawlStatus::ManualNeeded),
            "error" => Some(CrawlStatus::Error),
            _ => None,
        }
    }
}

/// How a snapshot was captured. Only `static` is produced today; the other
/// variants exist so stored rows stay readable when richer capture backends
/// land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    Static,
    Playwright,
    Llm,
    Manual,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Static => "static",
            CaptureMethod::Playwright => "playwright",
            CaptureMethod::Llm => "llm",
            CaptureMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(CaptureMethod::Static),
            "playwright" => Some(CaptureMethod::Playwright),
            "llm" => Some(CaptureMethod::Llm),
            "manual" => Some(CaptureMethod::Manual),
            _ => None,
        }
    }
}

/// Billing period attached to a price mention. Ordering is part of the
/// canonical form: buckets sort by `(currency, period, amount)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PricePeriod {
    Day,
    Week,
    Month,
    Year,
    OneTime,
    #[default]
    Unknown,
}

impl PricePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricePeriod::Day => "day",
            PricePeriod::Week => "week",
            PricePeriod::Month => "month",
            PricePeriod::Year => "year",
            PricePeriod::OneTime => "one_time",
            PricePeriod::Unknown => "unknown",
        }
    }
}

/// One extracted price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceMention {
    /// Rounded to 2 decimal places by the canonicalizer.
    pub amount: f64,
    /// Uppercase ISO-ish code (`USD`, `EUR`, ...).
    pub currency: String,
    pub period: PricePeriod,
}

/// Canonical pricing observation stored inside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingPayload {
    pub source_url: String,
    pub page_title: Option<String>,
    pub page_description: Option<String>,
    /// Lowercased, de-duplicated, sorted.
    pub plan_names: Vec<String>,
    /// De-duplicated by `(currency, period, amount)`, sorted.
    pub price_mentions: Vec<PriceMention>,
    /// Sorted unique lowercase tokens, e.g. `contact sales`.
    pub custom_pricing_hints: Vec<String>,
}

/// Immutable observation of a pricing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub user_id: String,
    pub company_id: String,
    pub captured_at: DateTime<Utc>,
    pub capture_method: CaptureMethod,
    pub confidence: f64,
    pub content_hash: String,
    pub payload: PricingPayload,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Verified,
    Unverified,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Verified => "verified",
            VerificationState::Unverified => "unverified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "verified" => Some(VerificationState::Verified),
            "unverified" => Some(VerificationState::Unverified),
            _ => None,
        }
    }
}

/// One price that moved between two paired snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedPrice {
    pub previous: f64,
    pub current: f64,
    pub abs_delta: f64,
    pub pct_delta: f64,
}

/// Delta for one `(currency, period)` bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketChange {
    pub currency: String,
    pub period: PricePeriod,
    pub added: Vec<f64>,
    pub removed: Vec<f64>,
    pub updated: Vec<UpdatedPrice>,
}

/// The low-noise structured diff stored on a [`Diff`] record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDiff {
    /// Only buckets with at least one change; sorted by `(currency, period)`.
    pub buckets: Vec<BucketChange>,
    pub added_hints: Vec<String>,
    pub removed_hints: Vec<String>,
    pub previous_price_count: usize,
    pub current_price_count: usize,
    pub previous_plan_count: usize,
    pub current_plan_count: usize,
    pub changed_at: DateTime<Utc>,
}

/// Snapshot-to-snapshot delta. Only written when the delta is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diff {
    pub diff_id: String,
    pub user_id: String,
    pub company_id: String,
    pub previous_snapshot_id: Option<String>,
    pub current_snapshot_id: String,
    pub normalized_diff: NormalizedDiff,
    pub severity: Severity,
    pub verification_state: VerificationState,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityGate {
    HighOnly,
    HighAndMedium,
}

impl SeverityGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityGate::HighOnly => "high_only",
            SeverityGate::HighAndMedium => "high_and_medium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high_only" => Some(SeverityGate::HighOnly),
            "high_and_medium" => Some(SeverityGate::HighAndMedium),
            _ => None,
        }
    }

    pub fn allows(&self, severity: Severity) -> bool {
        match self {
            SeverityGate::HighOnly => severity == Severity::High,
            SeverityGate::HighAndMedium => {
                severity == Severity::High || severity == Severity::Medium
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightFeedback {
    None,
    Helpful,
    NotHelpful,
}

impl InsightFeedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightFeedback::None => "none",
            InsightFeedback::Helpful => "helpful",
            InsightFeedback::NotHelpful => "not_helpful",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(InsightFeedback::None),
            "helpful" => Some(InsightFeedback::Helpful),
            "not_helpful" => Some(InsightFeedback::NotHelpful),
            _ => None,
        }
    }
}

/// Counts of price changes across all buckets of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

/// Structured recommendation emitted by the insight builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub headline: String,
    pub summary: String,
    pub risk_label: String,
    pub severity: Severity,
    pub verification_state: VerificationState,
    pub action_items: Vec<String>,
    pub price_changes: PriceChangeSummary,
    pub bucket_lines: Vec<String>,
}

/// Decision recommendation derived from a diff, gated by entitlements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: String,
    pub user_id: String,
    pub company_id: String,
    pub diff_id: String,
    /// Generator label, `rules-v1` for the deterministic builder.
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_cost_usd: f64,
    pub recommendation: Recommendation,
    pub severity_gate: SeverityGate,
    pub generated_at: DateTime<Utc>,
    pub feedback: InsightFeedback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    NotStarted,
    Active,
    Expired,
    Converted,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::NotStarted => "not_started",
            TrialStatus::Active => "active",
            TrialStatus::Expired => "expired",
            TrialStatus::Converted => "converted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(TrialStatus::NotStarted),
            "active" => Some(TrialStatus::Active),
            "expired" => Some(TrialStatus::Expired),
            "converted" => Some(TrialStatus::Converted),
            _ => None,
        }
    }
}

/// Identity plus subscription/trial state. Owned by the external
/// auth/billing collaborator; the crawl core only reads, except for the
/// idempotent trial transitions in the entitlements refresher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: Option<String>,
    pub paid_plan_price_tag: Option<String>,
    pub has_paid_access: bool,
    pub trial_status: TrialStatus,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub last_digest_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One scored pricing-URL candidate on a company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingUrlCandidate {
    pub url: String,
    /// Clamped to [0, 1], rounded to 2 decimal places.
    pub confidence: f64,
    #[serde(default)]
    pub selected_by_user: bool,
}

/// A crawl target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub company_id: String,
    pub user_id: String,
    pub kind: CompanyKind,
    pub name: String,
    /// Canonical registrable domain, e.g. `acme.example`.
    pub domain: String,
    pub homepage_url: Option<String>,
    pub primary_pricing_url: Option<String>,
    /// Sorted by `(confidence desc, url asc)`, unique URLs.
    pub pricing_url_candidates: Vec<PricingUrlCandidate>,
    pub next_crawl_at: Option<DateTime<Utc>>,
    pub crawl_lease_until: Option<DateTime<Utc>>,
    pub last_crawl_at: Option<DateTime<Utc>>,
    pub last_crawl_status: CrawlStatus,
    pub last_crawl_error: Option<String>,
    pub latest_content_hash: Option<String>,
    pub latest_confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Paid,
    Trial,
    None,
}

/// Resolved access for one user at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlements {
    pub has_access: bool,
    pub access_source: AccessSource,
    pub plan_tier: Option<PlanTier>,
    pub competitor_limit: u32,
    pub insight_severity_gate: Option<SeverityGate>,
    pub can_receive_weekly_digest: bool,
}

impl Entitlements {
    pub fn none() -> Self {
        Self {
            has_access: false,
            access_source: AccessSource::None,
            plan_tier: None,
            competitor_limit: 0,
            insight_severity_gate: None,
            can_receive_weekly_digest: false,
        }
    }
}

/// Hard cap on `?limit=` for the crawl entrypoint.
pub const MAX_CRAWL_BATCH_LIMIT: usize = 20;

/// Per-tier rule row, tuned by configuration rather than hard-coded logic.
#[derive(Debug, Clone)]
pub struct PlanRule {
    pub competitor_limit: u32,
    pub insight_severity_gate: SeverityGate,
    pub can_receive_weekly_digest: bool,
}

#[derive(Debug, Clone)]
pub struct PlanRules {
    pub starter: PlanRule,
    pub pro: PlanRule,
    /// Paid price tags that resolve to the Pro tier; anything else falls
    /// back to Starter.
    pub pro_price_tags: Vec<String>,
}

impl Default for PlanRules {
    fn default() -> Self {
        Self {
            starter: PlanRule {
                competitor_limit: 3,
                insight_severity_gate: SeverityGate::HighOnly,
                can_receive_weekly_digest: true,
            },
            pro: PlanRule {
                competitor_limit: 10,
                insight_severity_gate: SeverityGate::HighAndMedium,
                can_receive_weekly_digest: true,
            },
            pro_price_tags: vec![
                "price_pro_monthly".to_string(),
                "price_pro_yearly".to_string(),
            ],
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub cron_secret: Option<String>,
    pub crawl_batch_limit: usize,
    pub crawl_lease_ms: i64,
    pub crawl_success_delay_ms: i64,
    pub crawl_error_backoff_ms: i64,
    pub crawl_blocked_backoff_ms: i64,
    pub crawl_manual_backoff_ms: i64,
    pub crawl_fetch_timeout_ms: u64,
    pub crawl_max_html_length: usize,
    pub crawl_lock_ttl_ms: i64,
    pub digest_lock_ttl_ms: i64,
    pub digest_lookback_days: i64,
    pub digest_max_diffs: usize,
    pub trial_duration_days: i64,
    pub discovery_primary_min_confidence: f64,
    pub discovery_primary_min_gap: f64,
    pub write_rate_limit_max: u32,
    pub write_rate_limit_window_ms: i64,
    pub plan_rules: PlanRules,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./pricewatch.db".to_string());

        let cron_secret = std::env::var("CRON_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let mut plan_rules = PlanRules::default();
        if let Ok(tags) = std::env::var("PRO_PRICE_TAGS") {
            let tags: Vec<String> = tags
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !tags.is_empty() {
                plan_rules.pro_price_tags = tags;
            }
        }

        Ok(Self {
            database_path,
            port: env_parse("PORT", 8080u16),
            cron_secret,
            crawl_batch_limit: env_parse("CRAWL_BATCH_LIMIT", 3usize),
            crawl_lease_ms: env_parse("CRAWL_LEASE_MS", 360_000i64),
            crawl_success_delay_ms: env_parse("CRAWL_SUCCESS_DELAY_MS", 86_400_000i64),
            crawl_error_backoff_ms: env_parse("CRAWL_ERROR_BACKOFF_MS", 21_600_000i64),
            crawl_blocked_backoff_ms: env_parse("CRAWL_BLOCKED_BACKOFF_MS", 129_600_000i64),
            crawl_manual_backoff_ms: env_parse("CRAWL_MANUAL_BACKOFF_MS", 172_800_000i64),
            crawl_fetch_timeout_ms: env_parse("CRAWL_FETCH_TIMEOUT_MS", 15_000u64),
            crawl_max_html_length: env_parse("CRAWL_MAX_HTML_LENGTH", 1_000_000usize),
            crawl_lock_ttl_ms: env_parse("CRAWL_LOCK_TTL_MS", 480_000i64),
            digest_lock_ttl_ms: env_parse("DIGEST_LOCK_TTL_MS", 2_700_000i64),
            digest_lookback_days: env_parse("DIGEST_LOOKBACK_DAYS", 7i64),
            digest_max_diffs: env_parse("DIGEST_MAX_DIFFS", 30usize),
            trial_duration_days: env_parse("TRIAL_DURATION_DAYS", 14i64),
            discovery_primary_min_confidence: env_parse(
                "DISCOVERY_PRIMARY_MIN_CONFIDENCE",
                0.86f64,
            ),
            discovery_primary_min_gap: env_parse("DISCOVERY_PRIMARY_MIN_GAP", 0.08f64),
            write_rate_limit_max: env_parse("WRITE_RATE_LIMIT_MAX", 10u32),
            write_rate_limit_window_ms: env_parse("WRITE_RATE_LIMIT_WINDOW_MS", 60_000i64),
            plan_rules,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            port: 8080,
            cron_secret: None,
            crawl_batch_limit: 3,
            crawl_lease_ms: 360_000,
            crawl_success_delay_ms: 86_400_000,
            crawl_error_backoff_ms: 21_600_000,
            crawl_blocked_backoff_ms: 129_600_000,
            crawl_manual_backoff_ms: 172_800_000,
            crawl_fetch_timeout_ms: 15_000,
            crawl_max_html_length: 1_000_000,
            crawl_lock_ttl_ms: 480_000,
            digest_lock_ttl_ms: 2_700_000,
            digest_lookback_days: 7,
            digest_max_diffs: 30,
            trial_duration_days: 14,
            discovery_primary_min_confidence: 0.86,
            discovery_primary_min_gap: 0.08,
            write_rate_limit_max: 10,
            write_rate_limit_window_ms: 60_000,
            plan_rules: PlanRules::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            CrawlStatus::Idle,
            CrawlStatus::Ok,
            CrawlStatus::Blocked,
            CrawlStatus::ManualNeeded,
            CrawlStatus::Error,
        ] {
            assert_eq!(CrawlStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CrawlStatus::parse("nope"), None);
    }

    #[test]
    fn test_severity_gate_allows() {
        assert!(SeverityGate::HighOnly.allows(Severity::High));
        assert!(!SeverityGate::HighOnly.allows(Severity::Medium));
        assert!(SeverityGate::HighAndMedium.allows(Severity::Medium));
        assert!(!SeverityGate::HighAndMedium.allows(Severity::Low));
    }

    #[test]
    fn test_period_ordering_matches_canonical_form() {
        assert!(PricePeriod::Day < PricePeriod::Week);
        assert!(PricePeriod::Month < PricePeriod::Year);
        assert!(PricePeriod::Year < PricePeriod::OneTime);
        assert!(PricePeriod::OneTime < PricePeriod::Unknown);
    }

    #[test]
    fn test_company_kind_serde_names() {
        assert_eq!(CompanyKind::Own.as_str(), "self");
        assert_eq!(serde_json::to_string(&CompanyKind::Own).unwrap(), "\"self\"");
        assert_eq!(
            CompanyKind::parse("competitor"),
            Some(CompanyKind::Competitor)
        );
    }
}
