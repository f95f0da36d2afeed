//! HTTP surface.
//!
//! Cron entrypoints carry their own shared-secret auth; everything else sits
//! behind the session middleware. Route handlers stay thin: validate, call
//! the store/engines, map errors through [`error::ApiError`].

pub mod account;
pub mod companies;
pub mod cron;
pub mod dashboard;
pub mod error;

use std::sync::Arc;

use axum::{
    middleware as axum_mw,
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::auth::session_auth;
use crate::crawler::fetch::PageFetcher;
use crate::email::EmailSender;
use crate::middleware::logging::request_logging;
use crate::models::Config;
use crate::store::Store;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub fetcher: Arc<dyn PageFetcher>,
    pub email: Arc<dyn EmailSender>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health_check))
        .route("/cron/crawl", get(cron::run_crawl).post(cron::run_crawl))
        .route("/cron/digest", get(cron::run_digest).post(cron::run_digest));

    let authed = Router::new()
        .route("/entitlements/me", get(account::get_entitlements))
        .route("/trial/start", post(account::start_trial))
        .route("/companies", post(companies::create_company))
        .route(
            "/companies/:id/discover-pricing",
            post(companies::discover_pricing),
        )
        .route(
            "/companies/:id/primary-pricing",
            patch(companies::update_primary_pricing),
        )
        .route("/companies/:id/crawl-now", post(companies::crawl_now))
        .route("/companies/:id/retry-crawl", post(companies::retry_crawl))
        .route("/dashboard/overview", get(dashboard::overview))
        .route("/dashboard/feed", get(dashboard::feed))
        .route("/dashboard/comparison", get(dashboard::comparison))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), session_auth));

    Router::new()
        .merge(public)
        .merge(authed)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "PriceWatch operational"
}
