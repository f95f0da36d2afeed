//! Named invocation locks.
//!
//! One row per job key. Acquisition is a single conditional upsert: the
//! `WHERE lock_until <= now` guard on the conflict branch makes the
//! compare-and-set atomic. A crashed holder is recovered by TTL expiry;
//! release is fenced on `owner_id` so a stale holder can never release a
//! successor's lock.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::store::{from_millis, to_millis, Store};

/// Crawl batch job key.
pub const CRAWL_LOCK_KEY: &str = "cron:crawl";
/// Weekly digest job key.
pub const DIGEST_LOCK_KEY: &str = "cron:digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired {
        owner_id: String,
        lock_until: DateTime<Utc>,
    },
    Held {
        lock_until: DateTime<Utc>,
        retry_after_secs: i64,
    },
}

impl Store {
    pub async fn acquire_invocation_lock(
        &self,
        key: &str,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition> {
        let conn = self.lock().await;
        let owner_id = Uuid::new_v4().to_string();
        let now_ms = to_millis(now);
        let lock_until = now_ms + ttl_ms;

        let changed = conn.execute(
            "INSERT INTO cron_locks (lock_key, owner_id, lock_until, locked_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lock_key) DO UPDATE SET
                owner_id = excluded.owner_id,
                lock_until = excluded.lock_until,
                locked_at = excluded.locked_at
             WHERE cron_locks.lock_until <= ?4",
            params![key, owner_id, lock_until, now_ms],
        )?;

        if changed == 1 {
            return Ok(LockAcquisition::Acquired {
                owner_id,
                lock_until: from_millis(lock_until),
            });
        }

        let held_until: i64 = conn
            .query_row(
                "SELECT lock_until FROM cron_locks WHERE lock_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(now_ms);
        let retry_after_secs = ((held_until - now_ms).max(0) + 999) / 1000;

        Ok(LockAcquisition::Held {
            lock_until: from_millis(held_until),
            retry_after_secs,
        })
    }

    /// Fenced release: only the current owner can release. Returns whether
    /// anything was released.
    pub async fn release_invocation_lock(
        &self,
        key: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let now_ms = to_millis(now);
        let changed = conn.execute(
            "UPDATE cron_locks SET lock_until = ?3, last_released_at = ?3
             WHERE lock_key = ?1 AND owner_id = ?2",
            params![key, owner_id, now_ms],
        )?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        let first = store
            .acquire_invocation_lock(CRAWL_LOCK_KEY, 480_000, now)
            .await
            .unwrap();
        let LockAcquisition::Acquired { owner_id, lock_until } = first else {
            panic!("first acquisition must succeed");
        };
        assert!(lock_until > now);

        match store
            .acquire_invocation_lock(CRAWL_LOCK_KEY, 480_000, now + Duration::seconds(1))
            .await
            .unwrap()
        {
            LockAcquisition::Held {
                retry_after_secs, ..
            } => assert!(retry_after_secs > 0 && retry_after_secs <= 480),
            LockAcquisition::Acquired { .. } => panic!("held lock must not re-acquire"),
        }

        assert!(store
            .release_invocation_lock(CRAWL_LOCK_KEY, &owner_id, now + Duration::seconds(2))
            .await
            .unwrap());
        assert!(matches!(
            store
                .acquire_invocation_lock(CRAWL_LOCK_KEY, 480_000, now + Duration::seconds(3))
                .await
                .unwrap(),
            LockAcquisition::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_reacquirable() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .acquire_invocation_lock(CRAWL_LOCK_KEY, 1_000, now)
            .await
            .unwrap();
        // Holder crashed; TTL expiry frees the lock.
        assert!(matches!(
            store
                .acquire_invocation_lock(CRAWL_LOCK_KEY, 1_000, now + Duration::seconds(2))
                .await
                .unwrap(),
            LockAcquisition::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_is_fenced_on_owner() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .acquire_invocation_lock(DIGEST_LOCK_KEY, 480_000, now)
            .await
            .unwrap();
        assert!(!store
            .release_invocation_lock(DIGEST_LOCK_KEY, "not-the-owner", now)
            .await
            .unwrap());
        assert!(matches!(
            store
                .acquire_invocation_lock(DIGEST_LOCK_KEY, 480_000, now + Duration::seconds(1))
                .await
                .unwrap(),
            LockAcquisition::Held { .. }
        ));
    }

    #[tokio::test]
    async fn test_locks_are_independent_per_key() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .acquire_invocation_lock(CRAWL_LOCK_KEY, 480_000, now)
            .await
            .unwrap();
        assert!(matches!(
            store
                .acquire_invocation_lock(DIGEST_LOCK_KEY, 2_700_000, now)
                .await
                .unwrap(),
            LockAcquisition::Acquired { .. }
        ));
    }
}
