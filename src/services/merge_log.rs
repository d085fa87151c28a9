// src/services/merge_log.rs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::PgPool;
use crate::errors::ResolverError;

/// One merge history row shaped for display: joined with both profiles'
/// names and emails so a reviewer can read it without further lookups.
#[derive(Debug, Serialize)]
pub struct MergeLogView {
    pub id: String,
    pub source_profile_id: String,
    pub target_profile_id: String,
    pub source_name: Option<String>,
    pub source_email: Option<String>,
    pub target_name: Option<String>,
    pub target_email: Option<String>,
    pub merge_type: String,
    pub confidence_score: f64,
    pub score_breakdown: serde_json::Value,
    pub reason: String,
    pub triggered_by: String,
    pub merged_at: DateTime<Utc>,
    pub rolled_back: bool,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub review_outcome: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MergeLogPage {
    pub logs: Vec<MergeLogView>,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
}

/// Paginated audit read over merge history, newest first.
pub async fn get_merge_logs(pool: &PgPool, page: i64, limit: i64) -> Result<MergeLogPage> {
    if page < 1 {
        return Err(ResolverError::Validation("page must be >= 1".to_string()).into());
    }
    let limit = limit.clamp(1, 100);
    let offset = (page - 1) * limit;

    let conn = pool
        .get()
        .await
        .context("MergeLog: Failed to get DB connection")?;

    let total: i64 = conn
        .query_one("SELECT COUNT(*) FROM merge_log", &[])
        .await
        .context("MergeLog: Failed to count entries")?
        .get(0);

    let rows = conn
        .query(
            "SELECT ml.id, ml.source_profile_id, ml.target_profile_id,
                    ml.merge_type, ml.confidence_score, ml.score_breakdown,
                    ml.reason, ml.triggered_by, ml.merged_at,
                    ml.rolled_back, ml.rolled_back_at, ml.review_outcome,
                    sp.full_name AS source_name, sp.primary_email AS source_email,
                    tp.full_name AS target_name, tp.primary_email AS target_email
             FROM merge_log ml
             LEFT JOIN customer_profiles sp ON sp.id = ml.source_profile_id
             LEFT JOIN customer_profiles tp ON tp.id = ml.target_profile_id
             ORDER BY ml.merged_at DESC
             LIMIT $1 OFFSET $2",
            &[&limit, &offset],
        )
        .await
        .context("MergeLog: Failed to query merge history")?;

    let logs = rows
        .iter()
        .map(|row| MergeLogView {
            id: row.get("id"),
            source_profile_id: row.get("source_profile_id"),
            target_profile_id: row.get("target_profile_id"),
            source_name: row.get("source_name"),
            source_email: row.get("source_email"),
            target_name: row.get("target_name"),
            target_email: row.get("target_email"),
            merge_type: row.get("merge_type"),
            confidence_score: row.get("confidence_score"),
            score_breakdown: row.get("score_breakdown"),
            reason: row.get("reason"),
            triggered_by: row.get("triggered_by"),
            merged_at: row.get("merged_at"),
            rolled_back: row.get("rolled_back"),
            rolled_back_at: row.get("rolled_back_at"),
            review_outcome: row.get("review_outcome"),
        })
        .collect();

    Ok(MergeLogPage {
        logs,
        total,
        page,
        pages: (total + limit - 1) / limit,
    })
}
