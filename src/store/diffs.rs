//! Diff persistence and feed/digest queries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::collections::HashMap;

use crate::models::{Diff, Severity, VerificationState};
use crate::store::{column_parse_error, from_millis, to_millis, Store};

const DIFF_COLUMNS: &str = "diff_id, user_id, company_id, previous_snapshot_id, \
     current_snapshot_id, normalized_diff, severity, verification_state, detected_at";

fn diff_from_row(row: &Row<'_>) -> rusqlite::Result<Diff> {
    let severity: String = row.get(6)?;
    let verification: String = row.get(7)?;
    let normalized_json: String = row.get(5)?;
    let normalized_diff = serde_json::from_str(&normalized_json)
        .map_err(|e| column_parse_error("invalid normalized diff", &e.to_string()))?;

    Ok(Diff {
        diff_id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        previous_snapshot_id: row.get(3)?,
        current_snapshot_id: row.get(4)?,
        normalized_diff,
        severity: Severity::parse(&severity)
            .ok_or_else(|| column_parse_error("unknown severity", &severity))?,
        verification_state: VerificationState::parse(&verification)
            .ok_or_else(|| column_parse_error("unknown verification state", &verification))?,
        detected_at: from_millis(row.get(8)?),
    })
}

impl Store {
    pub async fn insert_diff(&self, diff: &Diff) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO diffs (diff_id, user_id, company_id, previous_snapshot_id,
                current_snapshot_id, normalized_diff, severity, verification_state, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                diff.diff_id,
                diff.user_id,
                diff.company_id,
                diff.previous_snapshot_id,
                diff.current_snapshot_id,
                serde_json::to_string(&diff.normalized_diff)?,
                diff.severity.as_str(),
                diff.verification_state.as_str(),
                to_millis(diff.detected_at),
            ],
        )
        .context("insert diff")?;
        Ok(())
    }

    /// Newest-first diffs for a user. `verified_only` is the feed filter:
    /// unverified diffs exist on the record but stay out of projections.
    pub async fn list_diffs_for_user(
        &self,
        user_id: &str,
        verified_only: bool,
        limit: usize,
    ) -> Result<Vec<Diff>> {
        let conn = self.lock().await;
        let limit = limit.clamp(1, 500) as i64;
        let sql = if verified_only {
            format!(
                "SELECT {DIFF_COLUMNS} FROM diffs
                 WHERE user_id = ?1 AND verification_state = 'verified'
                 ORDER BY detected_at DESC LIMIT ?2"
            )
        } else {
            format!(
                "SELECT {DIFF_COLUMNS} FROM diffs
                 WHERE user_id = ?1
                 ORDER BY detected_at DESC LIMIT ?2"
            )
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![user_id, limit], diff_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Verified diffs detected on or after `since`, for the weekly digest.
    pub async fn list_verified_diffs_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Diff>> {
        let conn = self.lock().await;
        let limit = limit.clamp(1, 500) as i64;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DIFF_COLUMNS} FROM diffs
             WHERE user_id = ?1 AND verification_state = 'verified' AND detected_at >= ?2
             ORDER BY detected_at DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![user_id, to_millis(since), limit], diff_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn diff_counts_by_company(&self, user_id: &str) -> Result<HashMap<String, u32>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT company_id, COUNT(*) FROM diffs WHERE user_id = ?1 GROUP BY company_id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (company_id, count) = row?;
            out.insert(company_id, count);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NormalizedDiff;
    use chrono::Duration;

    fn diff(
        user_id: &str,
        company_id: &str,
        verification: VerificationState,
        detected_at: DateTime<Utc>,
    ) -> Diff {
        Diff {
            diff_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            previous_snapshot_id: None,
            current_snapshot_id: "s-1".to_string(),
            normalized_diff: NormalizedDiff {
                buckets: Vec::new(),
                added_hints: vec!["contact sales".to_string()],
                removed_hints: Vec::new(),
                previous_price_count: 0,
                current_price_count: 0,
                previous_plan_count: 0,
                current_plan_count: 0,
                changed_at: detected_at,
            },
            severity: Severity::Medium,
            verification_state: verification,
            detected_at,
        }
    }

    #[tokio::test]
    async fn test_feed_filters_unverified() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .insert_diff(&diff("u-1", "c-1", VerificationState::Verified, now))
            .await
            .unwrap();
        store
            .insert_diff(&diff(
                "u-1",
                "c-1",
                VerificationState::Unverified,
                now - Duration::hours(1),
            ))
            .await
            .unwrap();

        let all = store.list_diffs_for_user("u-1", false, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let verified = store.list_diffs_for_user("u-1", true, 10).await.unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].verification_state, VerificationState::Verified);
    }

    #[tokio::test]
    async fn test_digest_window_query() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .insert_diff(&diff("u-1", "c-1", VerificationState::Verified, now))
            .await
            .unwrap();
        store
            .insert_diff(&diff(
                "u-1",
                "c-1",
                VerificationState::Verified,
                now - Duration::days(10),
            ))
            .await
            .unwrap();

        let recent = store
            .list_verified_diffs_since("u-1", now - Duration::days(7), 30)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        let counts = store.diff_counts_by_company("u-1").await.unwrap();
        assert_eq!(counts.get("c-1"), Some(&2));
    }
}
