//! Entitlements and trial endpoints.

use axum::{extract::State, Extension, Json};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::api::{error::ApiError, AppState};
use crate::auth::AuthedUser;
use crate::entitlements::refresh_and_resolve;
use crate::middleware::rate_limit::enforce_write_limit;
use crate::models::{Entitlements, TrialStatus, User};
use crate::store::{AuditEvent, AuditOutcome};

#[derive(Debug, Serialize)]
pub struct TrialView {
    pub status: TrialStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Serialize)]
pub struct EntitlementsResponse {
    pub entitlements: Entitlements,
    pub trial: TrialView,
}

fn trial_view(user: &User, now: DateTime<Utc>) -> TrialView {
    TrialView {
        status: user.trial_status,
        started_at: user.trial_started_at,
        ends_at: user.trial_ends_at,
        is_active: user.trial_status == TrialStatus::Active
            && user.trial_ends_at.map(|ends| ends > now).unwrap_or(false),
    }
}

pub async fn get_entitlements(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<Json<EntitlementsResponse>, ApiError> {
    let now = Utc::now();
    let (user, entitlements) =
        refresh_and_resolve(&state.store, &user, &state.config.plan_rules, now).await?;

    Ok(Json(EntitlementsResponse {
        entitlements,
        trial: trial_view(&user, now),
    }))
}

pub async fn start_trial(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<Json<EntitlementsResponse>, ApiError> {
    let now = Utc::now();
    enforce_write_limit(&state.store, &user.user_id, "trial:start", &state.config, now).await?;

    // Refresh first so an ended trial reports `already_expired`, not a
    // stale `active`.
    let (user, _) = refresh_and_resolve(&state.store, &user, &state.config.plan_rules, now).await?;

    if user.has_paid_access {
        return Err(conflict_response(&state, &user, "paid_user", now).await?);
    }

    let ends_at = now + Duration::days(state.config.trial_duration_days);
    let started = state.store.start_trial(&user.user_id, ends_at, now).await?;
    if !started {
        // Raced another start, or the trial already ran: report what the
        // row says now without touching any dates.
        let current = state
            .store
            .get_user(&user.user_id)
            .await?
            .unwrap_or(user.clone());
        let reason = match current.trial_status {
            TrialStatus::Active => "already_active",
            TrialStatus::Expired => "already_expired",
            TrialStatus::Converted => "already_converted",
            TrialStatus::NotStarted => "already_active",
        };
        return Err(conflict_response(&state, &current, reason, now).await?);
    }

    state
        .store
        .record_audit(
            AuditEvent::new("trial_started", AuditOutcome::Success).user(&user.user_id),
            now,
        )
        .await?;
    info!(user_id = %user.user_id, "Trial started");

    let refreshed = state
        .store
        .get_user(&user.user_id)
        .await?
        .unwrap_or(user);
    let (refreshed, entitlements) =
        refresh_and_resolve(&state.store, &refreshed, &state.config.plan_rules, now).await?;

    Ok(Json(EntitlementsResponse {
        entitlements,
        trial: trial_view(&refreshed, now),
    }))
}

/// 409 body carrying the current trial and entitlements alongside the reason.
async fn conflict_response(
    state: &AppState,
    user: &User,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<ApiError, ApiError> {
    let entitlements =
        crate::entitlements::resolve_entitlements(user, &state.config.plan_rules, now);
    state
        .store
        .record_audit(
            AuditEvent::new("trial_start", AuditOutcome::Rejected)
                .user(&user.user_id)
                .metadata(serde_json::json!({ "reason": reason })),
            now,
        )
        .await?;

    Ok(ApiError::Conflict {
        reason: reason.to_string(),
        body: Some(serde_json::json!({
            "trial": trial_view(user, now),
            "entitlements": entitlements,
        })),
    })
}
