//! Insight persistence.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

use crate::models::{Insight, InsightFeedback, SeverityGate};
use crate::store::{column_parse_error, from_millis, to_millis, Store};

const INSIGHT_COLUMNS: &str = "insight_id, user_id, company_id, diff_id, model, prompt_tokens, \
     completion_tokens, total_cost_usd, recommendation, severity_gate, generated_at, feedback";

fn insight_from_row(row: &Row<'_>) -> rusqlite::Result<Insight> {
    let gate: String = row.get(9)?;
    let feedback: String = row.get(11)?;
    let recommendation_json: String = row.get(8)?;
    let recommendation = serde_json::from_str(&recommendation_json)
        .map_err(|e| column_parse_error("invalid recommendation", &e.to_string()))?;

    Ok(Insight {
        insight_id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        diff_id: row.get(3)?,
        model: row.get(4)?,
        prompt_tokens: row.get(5)?,
        completion_tokens: row.get(6)?,
        total_cost_usd: row.get(7)?,
        recommendation,
        severity_gate: SeverityGate::parse(&gate)
            .ok_or_else(|| column_parse_error("unknown severity gate", &gate))?,
        generated_at: from_millis(row.get(10)?),
        feedback: InsightFeedback::parse(&feedback)
            .ok_or_else(|| column_parse_error("unknown feedback", &feedback))?,
    })
}

impl Store {
    pub async fn insert_insight(&self, insight: &Insight) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO insights (insight_id, user_id, company_id, diff_id, model,
                prompt_tokens, completion_tokens, total_cost_usd, recommendation,
                severity_gate, generated_at, feedback)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                insight.insight_id,
                insight.user_id,
                insight.company_id,
                insight.diff_id,
                insight.model,
                insight.prompt_tokens,
                insight.completion_tokens,
                insight.total_cost_usd,
                serde_json::to_string(&insight.recommendation)?,
                insight.severity_gate.as_str(),
                to_millis(insight.generated_at),
                insight.feedback.as_str(),
            ],
        )
        .context("insert insight")?;
        Ok(())
    }

    pub async fn get_insight_for_diff(&self, diff_id: &str) -> Result<Option<Insight>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM insights WHERE diff_id = ?1 LIMIT 1"
        ))?;
        Ok(stmt
            .query_row(params![diff_id], insight_from_row)
            .optional()?)
    }

    pub async fn list_insights_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Insight>> {
        let conn = self.lock().await;
        let limit = limit.clamp(1, 500) as i64;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INSIGHT_COLUMNS} FROM insights
             WHERE user_id = ?1 ORDER BY generated_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit], insight_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn insight_counts_by_company(&self, user_id: &str) -> Result<HashMap<String, u32>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT company_id, COUNT(*) FROM insights WHERE user_id = ?1 GROUP BY company_id",
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
