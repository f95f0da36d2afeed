//! Persisted fixed-window rate-limit counters.
//!
//! Keys are `user:route`. Counters are durable state so interactive limits
//! survive process restarts; the crawl runner never consults them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::store::{to_millis, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: i64,
}

impl Store {
    /// Count one hit against `key` and decide whether it is allowed inside
    /// the current fixed window.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u32,
        window_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let conn = self.lock().await;
        let now_ms = to_millis(now);

        let existing: Option<(u32, i64)> = conn
            .query_row(
                "SELECT count, window_started_at FROM rate_limit_counters WHERE counter_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let window_live = existing
            .map(|(_, started)| started + window_ms > now_ms)
            .unwrap_or(false);

        if !window_live {
            conn.execute(
                "INSERT INTO rate_limit_counters (counter_key, count, window_started_at, expires_at)
                 VALUES (?1, 1, ?2, ?3)
                 ON CONFLICT(counter_key) DO UPDATE SET
                    count = 1,
                    window_started_at = excluded.window_started_at,
                    expires_at = excluded.expires_at",
                params![key, now_ms, now_ms + 2 * window_ms],
            )?;
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: max_requests.saturating_sub(1),
                retry_after_secs: 0,
            });
        }

        let (count, window_started_at) = existing.unwrap_or((0, now_ms));
        if count >= max_requests {
            let reset_ms = window_started_at + window_ms - now_ms;
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: ((reset_ms.max(0) + 999) / 1000).max(1),
            });
        }

        conn.execute(
            "UPDATE rate_limit_counters SET count = count + 1 WHERE counter_key = ?1",
            params![key],
        )?;
        Ok(RateLimitDecision {
            allowed: true,
            remaining: max_requests.saturating_sub(count + 1),
            retry_after_secs: 0,
        })
    }

    /// Drop counters whose retention window has passed.
    pub async fn purge_expired_rate_limits(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM rate_limit_counters WHERE expires_at <= ?1",
            params![to_millis(now)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_fixed_window_allows_then_denies() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        for i in 0..3 {
            let decision = store
                .check_rate_limit("u-1:trial:start", 3, 60_000, now)
                .await
                .unwrap();
            assert!(decision.allowed, "request {i} should pass");
        }

        let denied = store
            .check_rate_limit("u-1:trial:start", 3, 60_000, now + Duration::seconds(1))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);

        // Window rollover resets the counter.
        let reset = store
            .check_rate_limit("u-1:trial:start", 3, 60_000, now + Duration::seconds(61))
            .await
            .unwrap();
        assert!(reset.allowed);
        assert_eq!(reset.remaining, 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .check_rate_limit("u-1:companies", 1, 60_000, now)
            .await
            .unwrap();
        let other = store
            .check_rate_limit("u-2:companies", 1, 60_000, now)
            .await
            .unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .check_rate_limit("u-1:companies", 1, 1_000, now)
            .await
            .unwrap();
        assert_eq!(
            store
                .purge_expired_rate_limits(now + Duration::seconds(3))
                .await
                .unwrap(),
            1
        );
    }
}
