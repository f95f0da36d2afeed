//! Snapshot persistence. Rows are immutable once written.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::models::{CaptureMethod, Snapshot};
use crate::store::{column_parse_error, from_millis, to_millis, Store};

const SNAPSHOT_COLUMNS: &str = "snapshot_id, user_id, company_id, captured_at, capture_method, \
     confidence, content_hash, payload, is_verified";

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let method: String = row.get(4)?;
    let payload_json: String = row.get(7)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| column_parse_error("invalid snapshot payload", &e.to_string()))?;

    Ok(Snapshot {
        snapshot_id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        captured_at: from_millis(row.get(3)?),
        capture_method: CaptureMethod::parse(&method)
            .ok_or_else(|| column_parse_error("unknown capture method", &method))?,
        confidence: row.get(5)?,
        content_hash: row.get(6)?,
        payload,
        is_verified: row.get::<_, i64>(8)? != 0,
    })
}

impl Store {
    pub async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO snapshots (snapshot_id, user_id, company_id, captured_at,
                capture_method, confidence, content_hash, payload, is_verified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snapshot.snapshot_id,
                snapshot.user_id,
                snapshot.company_id,
                to_millis(snapshot.captured_at),
                snapshot.capture_method.as_str(),
                snapshot.confidence,
                snapshot.content_hash,
                serde_json::to_string(&snapshot.payload)?,
                snapshot.is_verified as i64,
            ],
        )
        .context("insert snapshot")?;
        Ok(())
    }

    /// Most recent snapshot for a company by `captured_at`; the diff engine
    /// compares against exactly this row.
    pub async fn latest_snapshot(&self, company_id: &str) -> Result<Option<Snapshot>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
             WHERE company_id = ?1
             ORDER BY captured_at DESC
             LIMIT 1"
        ))?;
        Ok(stmt
            .query_row(params![company_id], snapshot_from_row)
            .optional()?)
    }

    pub async fn count_snapshots(&self, company_id: &str) -> Result<u32> {
        let conn = self.lock().await;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE company_id = ?1",
            params![company_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
