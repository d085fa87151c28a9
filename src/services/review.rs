// src/services/review.rs

use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use serde::Serialize;
use uuid::Uuid;

use crate::db::PgPool;
use crate::errors::ResolverError;
use crate::models::{MergeLogEntry, MergeType};
use crate::services::merge::{merge_profiles, MergeOutcome};

/// Records a medium-confidence pair for human review. This writes a
/// `pending_review` merge_log entry and moves nothing: no identifiers,
/// no events, no snapshot.
pub async fn queue_for_review(
    pool: &PgPool,
    source_id: &str,
    target_id: &str,
    confidence_score: f64,
    score_breakdown: serde_json::Value,
    triggered_by: &str,
) -> Result<String> {
    let conn = pool
        .get()
        .await
        .context("Review: Failed to get DB connection")?;

    let entry_id = Uuid::new_v4().to_string();
    let reason = format!(
        "confidence {:.3} in review band; queued for manual decision",
        confidence_score
    );
    conn.execute(
        "INSERT INTO merge_log (
            id, source_profile_id, target_profile_id, snapshot, merge_type,
            confidence_score, score_breakdown, reason, triggered_by, merged_at,
            rolled_back, rolled_back_at, rolled_back_by, rollback_reason, review_outcome
         ) VALUES ($1, $2, $3, NULL, 'pending_review', $4, $5, $6, $7, $8,
                   FALSE, NULL, NULL, NULL, NULL)",
        &[
            &entry_id,
            &source_id,
            &target_id,
            &confidence_score,
            &score_breakdown,
            &reason,
            &triggered_by,
            &Utc::now(),
        ],
    )
    .await
    .context("Review: Failed to insert pending_review entry")?;

    info!(
        "Review: queued ({}, {}) at {:.3} as {}",
        source_id, target_id, confidence_score, entry_id
    );
    Ok(entry_id)
}

#[derive(Debug, Serialize)]
pub struct PendingReviewPage {
    pub reviews: Vec<MergeLogEntry>,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
}

/// Returns pending-review entries not yet decided, newest first.
pub async fn get_pending_reviews(pool: &PgPool, page: i64, limit: i64) -> Result<PendingReviewPage> {
    if page < 1 {
        return Err(ResolverError::Validation("page must be >= 1".to_string()).into());
    }
    let limit = limit.clamp(1, 100);
    let offset = (page - 1) * limit;

    let conn = pool
        .get()
        .await
        .context("Review: Failed to get DB connection for listing")?;

    let total: i64 = conn
        .query_one(
            "SELECT COUNT(*) FROM merge_log
             WHERE merge_type = 'pending_review' AND rolled_back = FALSE
               AND review_outcome IS NULL",
            &[],
        )
        .await
        .context("Review: Failed to count pending entries")?
        .get(0);

    let rows = conn
        .query(
            "SELECT * FROM merge_log
             WHERE merge_type = 'pending_review' AND rolled_back = FALSE
               AND review_outcome IS NULL
             ORDER BY merged_at DESC
             LIMIT $1 OFFSET $2",
            &[&limit, &offset],
        )
        .await
        .context("Review: Failed to list pending entries")?;

    let mut reviews = Vec::with_capacity(rows.len());
    for row in &rows {
        reviews.push(MergeLogEntry::from_row(row)?);
    }

    Ok(PendingReviewPage {
        reviews,
        total,
        page,
        pages: (total + limit - 1) / limit,
    })
}

pub enum ReviewDecision {
    Approve,
    Reject,
}

#[derive(Debug)]
pub struct ReviewResolution {
    pub entry_id: String,
    pub outcome: &'static str,
    /// Set when approval performed a manual merge.
    pub merge: Option<MergeOutcome>,
}

/// Promotes or closes a pending-review entry, exactly once. Approval
/// re-invokes the merge service with `merge_type = manual`, which marks
/// the entry `approved` inside the merge transaction itself: either both
/// commit or neither does. Rejection just records the outcome.
pub async fn resolve_review(
    pool: &PgPool,
    entry_id: &str,
    decision: ReviewDecision,
    reviewer: &str,
) -> Result<ReviewResolution> {
    let conn = pool
        .get()
        .await
        .context("Review: Failed to get DB connection for resolution")?;

    let row = conn
        .query_opt("SELECT * FROM merge_log WHERE id = $1", &[&entry_id])
        .await
        .context("Review: Failed to load entry")?
        .ok_or_else(|| ResolverError::NotFound("merge log", entry_id.to_string()))?;
    let entry = MergeLogEntry::from_row(&row)?;

    if entry.merge_type != MergeType::PendingReview {
        return Err(ResolverError::Validation(format!(
            "merge log {} is not a pending-review entry",
            entry_id
        ))
        .into());
    }
    if entry.review_outcome.is_some() {
        return Err(ResolverError::Validation(format!(
            "merge log {} has already been reviewed ({})",
            entry_id,
            entry.review_outcome.unwrap_or_default()
        ))
        .into());
    }

    let (outcome, merge) = match decision {
        ReviewDecision::Approve => {
            // The merge transaction claims the entry itself; no separate
            // outcome write can be lost between the merge and here.
            let merge = merge_profiles(
                pool,
                &entry.source_profile_id,
                &entry.target_profile_id,
                entry.confidence_score,
                entry.score_breakdown.clone(),
                MergeType::Manual,
                &format!("approved review {}", entry_id),
                reviewer,
                Some(entry_id),
            )
            .await?;
            ("approved", Some(merge))
        }
        ReviewDecision::Reject => {
            let marked = conn
                .execute(
                    "UPDATE merge_log SET review_outcome = 'rejected'
                     WHERE id = $1 AND review_outcome IS NULL",
                    &[&entry_id],
                )
                .await
                .context("Review: Failed to record rejection")?;
            if marked != 1 {
                return Err(ResolverError::Validation(format!(
                    "merge log {} was reviewed concurrently",
                    entry_id
                ))
                .into());
            }
            ("rejected", None)
        }
    };

    info!("Review: entry {} {} by {}", entry_id, outcome, reviewer);
    Ok(ReviewResolution {
        entry_id: entry_id.to_string(),
        outcome,
        merge,
    })
}
