//! Scheduler entrypoints.
//!
//! Both jobs follow the same shape: verify the shared secret, take the named
//! invocation lock, run, and release the lock on every exit path. A held
//! lock is not an error: the caller gets a 202 and the next timer tick
//! retries.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info};

use crate::api::{error::ApiError, AppState};
use crate::crawler::runner::CrawlRunner;
use crate::digest::DigestRunner;
use crate::models::{Config, MAX_CRAWL_BATCH_LIMIT};
use crate::store::{LockAcquisition, CRAWL_LOCK_KEY, DIGEST_LOCK_KEY};

const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Shared-secret check: `x-cron-secret: <SECRET>` or
/// `Authorization: Bearer <SECRET>`. With no secret configured every call is
/// rejected rather than left open.
pub fn authorize_cron(headers: &HeaderMap, config: &Config) -> Result<(), ApiError> {
    let Some(secret) = config.cron_secret.as_deref() else {
        return Err(ApiError::Unauthorized);
    };

    let presented = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match presented {
        Some(value) if value == secret => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

#[derive(Debug, Deserialize)]
pub struct CrawlQuery {
    pub limit: Option<i64>,
}

/// Missing or non-positive limits fall back to the configured default;
/// anything above the hard cap is clamped.
pub fn resolve_batch_limit(requested: Option<i64>, config: &Config) -> usize {
    match requested {
        Some(n) if n > 0 => (n as usize).min(MAX_CRAWL_BATCH_LIMIT),
        _ => config.crawl_batch_limit.min(MAX_CRAWL_BATCH_LIMIT),
    }
}

fn lock_held_response(acquisition: &LockAcquisition) -> Response {
    let LockAcquisition::Held {
        lock_until,
        retry_after_secs,
    } = acquisition
    else {
        unreachable!("only held locks produce a 202");
    };
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "skipped": true,
            "reason": "lock_active",
            "retryAfterSeconds": retry_after_secs,
            "lockUntil": lock_until.to_rfc3339(),
        })),
    )
        .into_response()
}

pub async fn run_crawl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CrawlQuery>,
) -> Result<Response, ApiError> {
    authorize_cron(&headers, &state.config)?;
    let now = Utc::now();
    let limit = resolve_batch_limit(query.limit, &state.config);

    let acquisition = state
        .store
        .acquire_invocation_lock(CRAWL_LOCK_KEY, state.config.crawl_lock_ttl_ms, now)
        .await?;
    let LockAcquisition::Acquired { owner_id, .. } = acquisition else {
        info!("Crawl invocation skipped: lock active");
        return Ok(lock_held_response(&acquisition));
    };

    let runner = CrawlRunner::new(
        state.store.clone(),
        state.fetcher.clone(),
        state.config.clone(),
    );
    let result = runner.run_batch(limit, now).await;

    // Release before surfacing the batch result, on success and failure alike.
    if let Err(e) = state
        .store
        .release_invocation_lock(CRAWL_LOCK_KEY, &owner_id, Utc::now())
        .await
    {
        error!(error = %format!("{e:#}"), "Failed to release crawl lock");
    }

    let report = result?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "skipped": false,
        "result": report,
    }))
    .into_response())
}

pub async fn run_digest(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize_cron(&headers, &state.config)?;
    let now = Utc::now();

    let acquisition = state
        .store
        .acquire_invocation_lock(DIGEST_LOCK_KEY, state.config.digest_lock_ttl_ms, now)
        .await?;
    let LockAcquisition::Acquired { owner_id, .. } = acquisition else {
        info!("Digest invocation skipped: lock active");
        return Ok(lock_held_response(&acquisition));
    };

    let runner = DigestRunner::new(
        state.store.clone(),
        state.email.clone(),
        state.config.clone(),
    );
    let result = runner.run(now).await;

    if let Err(e) = state
        .store
        .release_invocation_lock(DIGEST_LOCK_KEY, &owner_id, Utc::now())
        .await
    {
        error!(error = %format!("{e:#}"), "Failed to release digest lock");
    }

    let report = result?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "skipped": false,
        "result": report,
    }))
    .into_response())
}
