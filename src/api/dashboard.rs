//! Read-only dashboard projections.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::api::{error::ApiError, AppState};
use crate::auth::AuthedUser;
use crate::models::{CompanyKind, CrawlStatus, Diff, Insight, PricePeriod};

#[derive(Debug, Serialize)]
pub struct CompanyOverview {
    pub company_id: String,
    pub name: String,
    pub domain: String,
    pub kind: CompanyKind,
    pub primary_pricing_url: Option<String>,
    pub last_crawl_status: CrawlStatus,
    pub last_crawl_at: Option<DateTime<Utc>>,
    pub next_crawl_at: Option<DateTime<Utc>>,
    pub last_crawl_error: Option<String>,
    pub latest_confidence: Option<f64>,
    pub snapshot_count: u32,
    pub diff_count: u32,
    pub insight_count: u32,
}

pub async fn overview(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<Json<Vec<CompanyOverview>>, ApiError> {
    let companies = state.store.list_companies_for_user(&user.user_id).await?;
    let diff_counts = state.store.diff_counts_by_company(&user.user_id).await?;
    let insight_counts = state
        .store
        .insight_counts_by_company(&user.user_id)
        .await?;

    let mut out = Vec::with_capacity(companies.len());
    for company in companies {
        let snapshot_count = state.store.count_snapshots(&company.company_id).await?;
        out.push(CompanyOverview {
            snapshot_count,
            diff_count: diff_counts.get(&company.company_id).copied().unwrap_or(0),
            insight_count: insight_counts
                .get(&company.company_id)
                .copied()
                .unwrap_or(0),
            company_id: company.company_id,
            name: company.name,
            domain: company.domain,
            kind: company.kind,
            primary_pricing_url: company.primary_pricing_url,
            last_crawl_status: company.last_crawl_status,
            last_crawl_at: company.last_crawl_at,
            next_crawl_at: company.next_crawl_at,
            last_crawl_error: company.last_crawl_error,
            latest_confidence: company.latest_confidence,
        });
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FeedItem {
    pub diff: Diff,
    pub insight: Option<Insight>,
}

/// Verified diffs only; unverified changes stay off the feed.
pub async fn feed(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<FeedItem>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let diffs = state
        .store
        .list_diffs_for_user(&user.user_id, true, limit)
        .await?;

    let mut items = Vec::with_capacity(diffs.len());
    for diff in diffs {
        let insight = state.store.get_insight_for_diff(&diff.diff_id).await?;
        items.push(FeedItem { diff, insight });
    }
    Ok(Json(items))
}

#[derive(Debug, Serialize)]
pub struct ComparisonBucket {
    pub currency: String,
    pub period: PricePeriod,
    pub min_amount: f64,
    pub max_amount: f64,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct CompanyComparison {
    pub company_id: String,
    pub name: String,
    pub domain: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub is_verified: bool,
    pub plan_names: Vec<String>,
    pub buckets: Vec<ComparisonBucket>,
}

/// Latest snapshot per company, collapsed to per-bucket price ranges.
pub async fn comparison(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<Json<Vec<CompanyComparison>>, ApiError> {
    let companies = state.store.list_companies_for_user(&user.user_id).await?;

    let mut out = Vec::with_capacity(companies.len());
    for company in companies {
        let snapshot = state.store.latest_snapshot(&company.company_id).await?;
        let mut row = CompanyComparison {
            company_id: company.company_id,
            name: company.name,
            domain: company.domain,
            captured_at: None,
            is_verified: false,
            plan_names: Vec::new(),
            buckets: Vec::new(),
        };

        if let Some(snapshot) = snapshot {
            let mut buckets: BTreeMap<(String, PricePeriod), Vec<f64>> = BTreeMap::new();
            for mention in &snapshot.payload.price_mentions {
                buckets
                    .entry((mention.currency.clone(), mention.period))
                    .or_default()
                    .push(mention.amount);
            }
            row.captured_at = Some(snapshot.captured_at);
            row.is_verified = snapshot.is_verified;
            row.plan_names = snapshot.payload.plan_names.clone();
            row.buckets = buckets
                .into_iter()
                .map(|((currency, period), amounts)| ComparisonBucket {
                    currency,
                    period,
                    min_amount: amounts.iter().copied().fold(f64::INFINITY, f64::min),
                    max_amount: amounts.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    count: amounts.len(),
                })
                .collect();
        }
        out.push(row);
    }
    Ok(Json(out))
}
