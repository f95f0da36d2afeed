//! Company management endpoints.
//!
//! All mutations here are interactive: they consume the write rate limit,
//! never take the invocation lock, and never claim leases. A user-initiated
//! crawl only marks the company due; the scheduler does the work.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{error::ApiError, AppState};
use crate::auth::AuthedUser;
use crate::crawler::discovery::{discover, merge_candidates, DiscoverySettings};
use crate::crawler::url::{matches_domain, normalize_domain, normalize_url};
use crate::entitlements::refresh_and_resolve;
use crate::middleware::rate_limit::enforce_write_limit;
use crate::models::{Company, CompanyKind, PricingUrlCandidate, User};
use crate::store::{AuditEvent, AuditOutcome, CrawlNowOutcome, NewCompany};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCompanyRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CompanyKind,
    pub domain: Option<String>,
    pub homepage_url: Option<String>,
    pub primary_pricing_url: Option<String>,
}

pub async fn create_company(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Json(req): Json<CreateCompanyRequest>,
) -> Result<(StatusCode, Json<Company>), ApiError> {
    let now = Utc::now();
    enforce_write_limit(&state.store, &user.user_id, "companies", &state.config, now).await?;

    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("Company name is required"));
    }
    if req.domain.is_none() && req.homepage_url.is_none() && req.primary_pricing_url.is_none() {
        return Err(ApiError::bad_request(
            "One of domain, homepageUrl, or primaryPricingUrl is required",
        ));
    }

    let homepage_url = match &req.homepage_url {
        Some(raw) => Some(
            normalize_url(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid homepageUrl: {raw}")))?,
        ),
        None => None,
    };
    let primary_pricing_url = match &req.primary_pricing_url {
        Some(raw) => Some(
            normalize_url(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid primaryPricingUrl: {raw}")))?,
        ),
        None => None,
    };

    // Canonical domain: explicit input first, then derived from a URL.
    let domain = req
        .domain
        .as_deref()
        .and_then(normalize_domain)
        .or_else(|| homepage_url.as_deref().and_then(normalize_domain))
        .or_else(|| primary_pricing_url.as_deref().and_then(normalize_domain))
        .ok_or_else(|| ApiError::bad_request("Could not derive a valid domain"))?;

    for (field, url) in [
        ("homepageUrl", &homepage_url),
        ("primaryPricingUrl", &primary_pricing_url),
    ] {
        if let Some(url) = url {
            if !matches_domain(url, &domain) {
                return Err(ApiError::bad_request(format!(
                    "{field} does not match domain {domain}"
                )));
            }
        }
    }

    if req.kind == CompanyKind::Competitor {
        let (_, entitlements) =
            refresh_and_resolve(&state.store, &user, &state.config.plan_rules, now).await?;
        if !entitlements.has_access {
            return Err(ApiError::Forbidden(
                "An active subscription or trial is required to track competitors".to_string(),
            ));
        }
        let tracked = state.store.count_competitors(&user.user_id).await?;
        if tracked >= entitlements.competitor_limit {
            state
                .store
                .record_audit(
                    AuditEvent::new("competitor_cap_hit", AuditOutcome::Rejected)
                        .user(&user.user_id)
                        .metadata(serde_json::json!({
                            "limit": entitlements.competitor_limit,
                            "tracked": tracked,
                        })),
                    now,
                )
                .await?;
            return Err(ApiError::Forbidden(format!(
                "Competitor limit of {} reached for your plan",
                entitlements.competitor_limit
            )));
        }
    }

    if req.kind == CompanyKind::Own
        && state.store.find_self_company(&user.user_id).await?.is_some()
    {
        return Err(ApiError::conflict("self_company_exists"));
    }
    if state
        .store
        .find_company_by_domain(&user.user_id, req.kind, &domain)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict("duplicate_domain"));
    }

    let pricing_url_candidates = primary_pricing_url
        .as_ref()
        .map(|url| {
            vec![PricingUrlCandidate {
                url: url.clone(),
                confidence: 1.0,
                selected_by_user: true,
            }]
        })
        .unwrap_or_default();

    let company = state
        .store
        .insert_company(
            NewCompany {
                user_id: user.user_id.clone(),
                kind: req.kind,
                name,
                domain,
                homepage_url,
                primary_pricing_url,
                pricing_url_candidates,
                // Competitors are due immediately; the self company is
                // never claimed by the scheduler.
                next_crawl_at: (req.kind == CompanyKind::Competitor).then_some(now),
            },
            now,
        )
        .await?;

    state
        .store
        .record_audit(
            AuditEvent::new("company_created", AuditOutcome::Success)
                .user(&user.user_id)
                .company(&company.company_id)
                .metadata(serde_json::json!({
                    "kind": company.kind.as_str(),
                    "domain": company.domain.clone(),
                })),
            now,
        )
        .await?;
    info!(
        user_id = %user.user_id,
        company_id = %company.company_id,
        domain = %company.domain,
        "Company created"
    );

    Ok((StatusCode::CREATED, Json(company)))
}

async fn load_owned_company(
    state: &AppState,
    user: &User,
    company_id: &str,
) -> Result<Company, ApiError> {
    let company = state
        .store
        .get_company(company_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if company.user_id != user.user_id {
        return Err(ApiError::NotFound);
    }
    Ok(company)
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub candidates: Vec<PricingUrlCandidate>,
    pub recommended_primary_url: Option<String>,
}

pub async fn discover_pricing(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(company_id): Path<String>,
) -> Result<Json<DiscoveryResponse>, ApiError> {
    let now = Utc::now();
    enforce_write_limit(
        &state.store,
        &user.user_id,
        "companies:discover",
        &state.config,
        now,
    )
    .await?;

    let company = load_owned_company(&state, &user, &company_id).await?;
    let Some(homepage) = company.homepage_url.clone() else {
        return Err(ApiError::bad_request(
            "Company has no homepageUrl to discover from",
        ));
    };

    let outcome = discover(
        state.fetcher.as_ref(),
        &homepage,
        &company.domain,
        DiscoverySettings {
            primary_min_confidence: state.config.discovery_primary_min_confidence,
            primary_min_gap: state.config.discovery_primary_min_gap,
        },
    )
    .await;

    let merged = merge_candidates(&company.pricing_url_candidates, &outcome.candidates);
    state
        .store
        .update_candidates(
            &company.company_id,
            &merged,
            outcome.recommended_primary_url.as_deref(),
            now,
        )
        .await?;

    Ok(Json(DiscoveryResponse {
        candidates: merged,
        recommended_primary_url: outcome.recommended_primary_url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryPricingRequest {
    pub url: Option<String>,
    pub candidate_url: Option<String>,
}

pub async fn update_primary_pricing(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(company_id): Path<String>,
    Json(req): Json<PrimaryPricingRequest>,
) -> Result<Json<Company>, ApiError> {
    let now = Utc::now();
    enforce_write_limit(
        &state.store,
        &user.user_id,
        "companies:primary",
        &state.config,
        now,
    )
    .await?;

    let company = load_owned_company(&state, &user, &company_id).await?;

    let (raw, from_candidates) = match (&req.url, &req.candidate_url) {
        (Some(url), None) => (url.clone(), false),
        (None, Some(url)) => (url.clone(), true),
        _ => {
            return Err(ApiError::bad_request(
                "Provide exactly one of url or candidateUrl",
            ))
        }
    };

    let url = normalize_url(&raw)
        .ok_or_else(|| ApiError::bad_request(format!("Invalid pricing URL: {raw}")))?;
    if !matches_domain(&url, &company.domain) {
        return Err(ApiError::bad_request(format!(
            "Pricing URL does not match domain {}",
            company.domain
        )));
    }

    let existing_confidence = company
        .pricing_url_candidates
        .iter()
        .find(|c| normalize_url(&c.url).as_deref() == Some(url.as_str()))
        .map(|c| c.confidence);
    if from_candidates && existing_confidence.is_none() {
        return Err(ApiError::bad_request(
            "candidateUrl is not among the discovered candidates",
        ));
    }

    let merged = merge_candidates(
        &company.pricing_url_candidates,
        &[PricingUrlCandidate {
            url: url.clone(),
            confidence: existing_confidence.unwrap_or(1.0),
            selected_by_user: true,
        }],
    );
    state
        .store
        .set_primary_pricing_url(&company.company_id, &url, &merged, now)
        .await?;
    state
        .store
        .record_audit(
            AuditEvent::new("primary_pricing_updated", AuditOutcome::Success)
                .user(&user.user_id)
                .company(&company.company_id)
                .metadata(serde_json::json!({ "url": url })),
            now,
        )
        .await?;

    let updated = state
        .store
        .get_company(&company.company_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(updated))
}

pub async fn crawl_now(
    state: State<AppState>,
    user: Extension<AuthedUser>,
    company_id: Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    request_immediate_crawl(state, user, company_id, "companies:crawl-now").await
}

pub async fn retry_crawl(
    state: State<AppState>,
    user: Extension<AuthedUser>,
    company_id: Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    request_immediate_crawl(state, user, company_id, "companies:retry-crawl").await
}

/// Mark the company due now. An active lease is left untouched and the
/// request conflicts; the lease holder finishes on its own schedule.
async fn request_immediate_crawl(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(company_id): Path<String>,
    route: &'static str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    enforce_write_limit(&state.store, &user.user_id, route, &state.config, now).await?;

    let company = load_owned_company(&state, &user, &company_id).await?;
    if company.kind != CompanyKind::Competitor {
        return Err(ApiError::bad_request("Only competitors are crawled"));
    }

    match state.store.request_crawl_now(&company.company_id, now).await? {
        CrawlNowOutcome::Scheduled => {
            state
                .store
                .record_audit(
                    AuditEvent::new("crawl_requested", AuditOutcome::Success)
                        .user(&user.user_id)
                        .company(&company.company_id),
                    now,
                )
                .await?;
            Ok(Json(serde_json::json!({
                "scheduled": true,
                "nextCrawlAt": now.to_rfc3339(),
            })))
        }
        CrawlNowOutcome::LeaseActive { lease_until } => {
            state
                .store
                .record_audit(
                    AuditEvent::new("crawl_requested", AuditOutcome::Rejected)
                        .user(&user.user_id)
                        .company(&company.company_id)
                        .metadata(serde_json::json!({ "reason": "crawl_in_progress" })),
                    now,
                )
                .await?;
            Err(ApiError::Conflict {
                reason: "crawl_in_progress".to_string(),
                body: Some(serde_json::json!({
                    "leaseUntil": lease_until.to_rfc3339(),
                })),
            })
        }
    }
}
