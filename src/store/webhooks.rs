//! Idempotency ledger for billing webhook events.
//!
//! The webhook handler itself lives with the billing collaborator; this is
//! the at-most-once claim contract it relies on. `begin` either claims the
//! event (fresh, retried-after-failure, or expired-lock) or reports why not.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::store::{to_millis, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookClaim {
    /// Caller owns the event until its processing lock expires.
    Claimed { attempts: u32 },
    AlreadyProcessed,
    /// Another worker holds an unexpired processing lock.
    InFlight,
}

impl Store {
    pub async fn begin_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        lock_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim> {
        let conn = self.lock().await;
        let now_ms = to_millis(now);
        let lock_expires_at = now_ms + lock_ms;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO webhook_events
                (event_id, event_type, status, attempts, lock_expires_at)
             VALUES (?1, ?2, 'processing', 1, ?3)",
            params![event_id, event_type, lock_expires_at],
        )?;
        if inserted == 1 {
            return Ok(WebhookClaim::Claimed { attempts: 1 });
        }

        // Re-claim only failed events or expired processing locks.
        let changed = conn.execute(
            "UPDATE webhook_events SET
                status = 'processing',
                attempts = attempts + 1,
                lock_expires_at = ?2,
                last_error = NULL
             WHERE event_id = ?1
               AND status != 'processed'
               AND (status = 'failed' OR lock_expires_at <= ?3)",
            params![event_id, lock_expires_at, now_ms],
        )?;
        if changed == 1 {
            let attempts: u32 = conn.query_row(
                "SELECT attempts FROM webhook_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )?;
            return Ok(WebhookClaim::Claimed { attempts });
        }

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM webhook_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            Some("processed") => Ok(WebhookClaim::AlreadyProcessed),
            _ => Ok(WebhookClaim::InFlight),
        }
    }

    pub async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        if success {
            conn.execute(
                "UPDATE webhook_events SET status = 'processed', processed_at = ?2,
                    last_error = NULL
                 WHERE event_id = ?1",
                params![event_id, to_millis(now)],
            )?;
        } else {
            conn.execute(
                "UPDATE webhook_events SET status = 'failed', last_error = ?2
                 WHERE event_id = ?1",
                params![event_id, error],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_event_processed_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        assert_eq!(
            store
                .begin_webhook_event("evt-1", "invoice.paid", 60_000, now)
                .await
                .unwrap(),
            WebhookClaim::Claimed { attempts: 1 }
        );
        // Concurrent duplicate delivery sees the in-flight lock.
        assert_eq!(
            store
                .begin_webhook_event("evt-1", "invoice.paid", 60_000, now)
                .await
                .unwrap(),
            WebhookClaim::InFlight
        );

        store
            .finish_webhook_event("evt-1", true, None, now)
            .await
            .unwrap();
        assert_eq!(
            store
                .begin_webhook_event("evt-1", "invoice.paid", 60_000, now)
                .await
                .unwrap(),
            WebhookClaim::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_failed_event_is_retryable() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .begin_webhook_event("evt-1", "invoice.paid", 60_000, now)
            .await
            .unwrap();
        store
            .finish_webhook_event("evt-1", false, Some("provider timeout"), now)
            .await
            .unwrap();

        assert_eq!(
            store
                .begin_webhook_event("evt-1", "invoice.paid", 60_000, now)
                .await
                .unwrap(),
            WebhookClaim::Claimed { attempts: 2 }
        );
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .begin_webhook_event("evt-1", "invoice.paid", 1_000, now)
            .await
            .unwrap();
        assert_eq!(
            store
                .begin_webhook_event("evt-1", "invoice.paid", 1_000, now + Duration::seconds(2))
                .await
                .unwrap(),
            WebhookClaim::Claimed { attempts: 2 }
        );
    }
}
