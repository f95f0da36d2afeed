//! Write rate limiting for interactive endpoints.
//!
//! Fixed window per `user:route`, persisted in the store (counters survive
//! restarts). Only user-facing mutations consume it; the crawl runner and
//! the cron entrypoints never do.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::api::error::ApiError;
use crate::models::Config;
use crate::store::Store;

/// Count one write against `user_id` on `route`; 429 with `Retry-After`
/// when the window is exhausted.
pub async fn enforce_write_limit(
    store: &Store,
    user_id: &str,
    route: &str,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let key = format!("{user_id}:{route}");
    let decision = store
        .check_rate_limit(
            &key,
            config.write_rate_limit_max,
            config.write_rate_limit_window_ms,
            now,
        )
        .await
        .map_err(ApiError::Internal)?;

    if decision.allowed {
        return Ok(());
    }

    warn!(
        user_id,
        route,
        retry_after_secs = decision.retry_after_secs,
        "Write rate limit exceeded"
    );
    Err(ApiError::RateLimited {
        retry_after_secs: decision.retry_after_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enforce_write_limit_denies_after_window_full() {
        let store = Store::open_in_memory().unwrap();
        let config = Config {
            write_rate_limit_max: 2,
            ..Config::default()
        };
        let now = Utc::now();

        assert!(enforce_write_limit(&store, "u-1", "companies", &config, now)
            .await
            .is_ok());
        assert!(enforce_write_limit(&store, "u-1", "companies", &config, now)
            .await
            .is_ok());
        match enforce_write_limit(&store, "u-1", "companies", &config, now).await {
            Err(ApiError::RateLimited { retry_after_secs }) => assert!(retry_after_secs >= 1),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // Different route has its own window.
        assert!(enforce_write_limit(&store, "u-1", "trial:start", &config, now)
            .await
            .is_ok());
    }
}
