//! Persisted audit events.
//!
//! One row per notable outcome: crawl terminal failures, entitlement
//! rejections, and user-facing mutations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::store::{from_millis, to_millis, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub event: String,
    pub outcome: AuditOutcome,
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event: &str, outcome: AuditOutcome) -> Self {
        Self {
            user_id: None,
            company_id: None,
            event: event.to_string(),
            outcome,
            metadata: None,
        }
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn company(mut self, company_id: &str) -> Self {
        self.company_id = Some(company_id.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StoredAuditEvent {
    pub event_id: String,
    pub ts: DateTime<Utc>,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub event: String,
    pub outcome: String,
    pub metadata: Option<String>,
}

impl Store {
    pub async fn record_audit(&self, event: AuditEvent, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        let metadata = match &event.metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO audit_events (event_id, ts, user_id, company_id, event, outcome, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                to_millis(now),
                event.user_id,
                event.company_id,
                event.event,
                event.outcome.as_str(),
                metadata,
            ],
        )?;
        Ok(())
    }

    pub async fn list_audit_events(&self, limit: usize) -> Result<Vec<StoredAuditEvent>> {
        let conn = self.lock().await;
        let limit = limit.clamp(1, 1000) as i64;
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, ts, user_id, company_id, event, outcome, metadata
             FROM audit_events ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(StoredAuditEvent {
                event_id: row.get(0)?,
                ts: from_millis(row.get(1)?),
                user_id: row.get(2)?,
                company_id: row.get(3)?,
                event: row.get(4)?,
                outcome: row.get(5)?,
                metadata: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
