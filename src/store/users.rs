//! User persistence.
//!
//! Rows are owned by the external auth/billing collaborator; the core reads
//! them, applies the idempotent trial transitions, and stamps digest sends.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::models::{TrialStatus, User};
use crate::store::{column_parse_error, from_millis, opt_from_millis, opt_to_millis, to_millis, Store};

const USER_COLUMNS: &str = "user_id, email, paid_plan_price_tag, has_paid_access, trial_status, \
     trial_started_at, trial_ends_at, last_digest_sent_at, created_at, updated_at";

/// Collaborator-facing write shape (account provisioning, billing updates).
#[derive(Debug, Clone, Default)]
pub struct UpsertUser {
    pub user_id: String,
    pub email: Option<String>,
    pub paid_plan_price_tag: Option<String>,
    pub has_paid_access: bool,
    pub trial_status: TrialStatus,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let trial_status: String = row.get(4)?;
    Ok(User {
        user_id: row.get(0)?,
        email: row.get(1)?,
        paid_plan_price_tag: row.get(2)?,
        has_paid_access: row.get::<_, i64>(3)? != 0,
        trial_status: TrialStatus::parse(&trial_status)
            .ok_or_else(|| column_parse_error("unknown trial status", &trial_status))?,
        trial_started_at: opt_from_millis(row.get(5)?),
        trial_ends_at: opt_from_millis(row.get(6)?),
        last_digest_sent_at: opt_from_millis(row.get(7)?),
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
    })
}

impl Store {
    pub async fn upsert_user(&self, input: UpsertUser, now: DateTime<Utc>) -> Result<User> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO users (user_id, email, paid_plan_price_tag, has_paid_access,
                trial_status, trial_started_at, trial_ends_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                paid_plan_price_tag = excluded.paid_plan_price_tag,
                has_paid_access = excluded.has_paid_access,
                trial_status = excluded.trial_status,
                trial_started_at = excluded.trial_started_at,
                trial_ends_at = excluded.trial_ends_at,
                updated_at = excluded.updated_at",
            params![
                input.user_id,
                input.email,
                input.paid_plan_price_tag,
                input.has_paid_access as i64,
                input.trial_status.as_str(),
                opt_to_millis(input.trial_started_at),
                opt_to_millis(input.trial_ends_at),
                to_millis(now),
            ],
        )
        .context("upsert user")?;

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"
        ))?;
        stmt.query_row(params![input.user_id], user_from_row)
            .context("read back upserted user")
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"
        ))?;
        Ok(stmt.query_row(params![user_id], user_from_row).optional()?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], user_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Begin a trial, but only from `not_started`. Returns false when the
    /// user raced us or was never eligible; callers re-read to learn why.
    pub async fn start_trial(
        &self,
        user_id: &str,
        ends_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE users SET
                trial_status = 'active',
                trial_started_at = ?2,
                trial_ends_at = ?3,
                updated_at = ?2
             WHERE user_id = ?1 AND trial_status = 'not_started'",
            params![user_id, to_millis(now), to_millis(ends_at)],
        )?;
        Ok(changed == 1)
    }

    /// Idempotent trial refresh transition: `active` to `converted` or
    /// `expired`. A no-op unless the row is still `active`.
    pub async fn apply_trial_transition(
        &self,
        user_id: &str,
        to: TrialStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE users SET trial_status = ?2, updated_at = ?3
             WHERE user_id = ?1 AND trial_status = 'active'",
            params![user_id, to.as_str(), to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    pub async fn set_last_digest_sent_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE users SET last_digest_sent_at = ?2, updated_at = ?2 WHERE user_id = ?1",
            params![user_id, to_millis(now)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fresh_user(user_id: &str) -> UpsertUser {
        UpsertUser {
            user_id: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_trial_only_from_not_started() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.upsert_user(fresh_user("u-1"), now).await.unwrap();

        let ends = now + Duration::days(14);
        assert!(store.start_trial("u-1", ends, now).await.unwrap());
        // Second attempt observes `active` and does not move the dates.
        assert!(!store.start_trial("u-1", now + Duration::days(99), now).await.unwrap());

        let user = store.get_user("u-1").await.unwrap().unwrap();
        assert_eq!(user.trial_status, TrialStatus::Active);
        assert_eq!(
            user.trial_ends_at.unwrap().timestamp_millis(),
            ends.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_trial_transition_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.upsert_user(fresh_user("u-1"), now).await.unwrap();
        store
            .start_trial("u-1", now + Duration::days(14), now)
            .await
            .unwrap();

        assert!(store
            .apply_trial_transition("u-1", TrialStatus::Expired, now)
            .await
            .unwrap());
        assert!(!store
            .apply_trial_transition("u-1", TrialStatus::Converted, now)
            .await
            .unwrap());

        let user = store.get_user("u-1").await.unwrap().unwrap();
        assert_eq!(user.trial_status, TrialStatus::Expired);
    }

    #[tokio::test]
    async fn test_digest_stamp() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.upsert_user(fresh_user("u-1"), now).await.unwrap();
        store.set_last_digest_sent_at("u-1", now).await.unwrap();
        let user = store.get_user("u-1").await.unwrap().unwrap();
        assert_eq!(
            user.last_digest_sent_at.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }
}
