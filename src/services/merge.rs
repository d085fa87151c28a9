// src/services/merge.rs

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};
use tokio_postgres::Transaction;
use uuid::Uuid;

use crate::db::PgPool;
use crate::errors::ResolverError;
use crate::models::{
    CustomerProfile, MergeSnapshot, MergeType, ProfileIdentifier, ProfileSnapshot,
};

#[derive(Debug)]
pub struct MergeOutcome {
    pub target_id: String,
    pub merge_log_id: String,
}

/// Merges `source` into `target` as one all-or-nothing transaction:
/// lock both rows, snapshot both sides, write the audit entry, reassign
/// identifiers and events, fold metrics, mark the source merged, then
/// recompute the target's metrics from its combined event history. Any
/// failure rolls the whole transaction back.
///
/// When the merge promotes a pending-review entry, `approved_review`
/// carries that entry's id and it is marked `approved` inside the same
/// transaction: the merge and the review outcome commit or fail
/// together, and a concurrently-decided entry aborts the merge.
pub async fn merge_profiles(
    pool: &PgPool,
    source_id: &str,
    target_id: &str,
    confidence_score: f64,
    score_breakdown: serde_json::Value,
    merge_type: MergeType,
    reason: &str,
    triggered_by: &str,
    approved_review: Option<&str>,
) -> Result<MergeOutcome> {
    if source_id == target_id {
        return Err(ResolverError::Validation(
            "source and target profile must differ".to_string(),
        )
        .into());
    }

    let mut conn = pool
        .get()
        .await
        .context("Merge: Failed to get DB connection")?;
    let tx = conn
        .transaction()
        .await
        .context("Merge: Failed to start transaction")?;

    // Pessimistic lock on both rows, id-sorted so two concurrent merges
    // of the same pair cannot deadlock or both proceed.
    let (first, second) = if source_id < target_id {
        (source_id, target_id)
    } else {
        (target_id, source_id)
    };
    let first_profile = lock_profile(&tx, first).await?;
    let second_profile = lock_profile(&tx, second).await?;
    let (source, target) = if first_profile.id == source_id {
        (first_profile, second_profile)
    } else {
        (second_profile, first_profile)
    };

    if source.is_merged {
        return Err(ResolverError::Validation(format!(
            "source profile {} is already merged into {:?}",
            source.id, source.merged_into
        ))
        .into());
    }
    if target.is_merged {
        return Err(ResolverError::Validation(format!(
            "target profile {} is already merged into {:?}",
            target.id, target.merged_into
        ))
        .into());
    }

    // Claim the review entry before any mutation; losing the race to
    // another reviewer aborts the whole merge.
    if let Some(review_id) = approved_review {
        let claimed = tx
            .execute(
                "UPDATE merge_log SET review_outcome = 'approved'
                 WHERE id = $1 AND merge_type = 'pending_review'
                   AND review_outcome IS NULL",
                &[&review_id],
            )
            .await
            .context("Merge: Failed to claim review entry")?;
        if claimed != 1 {
            return Err(ResolverError::Validation(format!(
                "review entry {} was already decided",
                review_id
            ))
            .into());
        }
    }

    // Snapshot both sides before any mutation; this is the rollback
    // material.
    let snapshot = MergeSnapshot::new(
        snapshot_profile(&tx, &source).await?,
        snapshot_profile(&tx, &target).await?,
    );
    let snapshot_json =
        serde_json::to_value(&snapshot).context("Merge: Failed to serialize snapshot")?;

    // Audit entry first: a merge must not happen without its trail.
    let merge_log_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    tx.execute(
        "INSERT INTO merge_log (
            id, source_profile_id, target_profile_id, snapshot, merge_type,
            confidence_score, score_breakdown, reason, triggered_by, merged_at,
            rolled_back, rolled_back_at, rolled_back_by, rollback_reason, review_outcome
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, NULL, NULL, NULL, NULL)",
        &[
            &merge_log_id,
            &source.id,
            &target.id,
            &snapshot_json,
            &merge_type.as_str(),
            &confidence_score,
            &score_breakdown,
            &reason,
            &triggered_by,
            &now,
        ],
    )
    .await
    .context("Merge: Failed to write merge_log entry")?;

    // Identifiers the source shares with the target (same type + hash)
    // would violate uniqueness when repointed; drop them. Rollback
    // re-creates them from the snapshot.
    tx.execute(
        "DELETE FROM profile_identifiers pi
         USING profile_identifiers t
         WHERE pi.profile_id = $1 AND t.profile_id = $2
           AND pi.id_type = t.id_type AND pi.value_hash = t.value_hash",
        &[&source.id, &target.id],
    )
    .await
    .context("Merge: Failed to drop duplicate identifiers")?;
    let moved = tx
        .execute(
            "UPDATE profile_identifiers SET profile_id = $1 WHERE profile_id = $2",
            &[&target.id, &source.id],
        )
        .await
        .context("Merge: Failed to reassign identifiers")?;

    let moved_events = tx
        .execute(
            "UPDATE customer_events SET profile_id = $1 WHERE profile_id = $2",
            &[&target.id, &source.id],
        )
        .await
        .context("Merge: Failed to reassign events")?;

    // Fast-path metric fold from the two pre-merge rows.
    let total_orders = source.total_orders + target.total_orders;
    let total_spent = source.total_spent + target.total_spent;
    let avg_order_value = if total_orders > 0 {
        total_spent / total_orders as f64
    } else {
        0.0
    };
    let first_seen_at = source.first_seen_at.min(target.first_seen_at);
    let last_seen_at = source.last_seen_at.max(target.last_seen_at);
    let last_purchase_at = match (source.last_purchase_at, target.last_purchase_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    tx.execute(
        "UPDATE customer_profiles SET
            total_orders = $1, total_spent = $2, avg_order_value = $3, ltv = $4,
            first_seen_at = $5, last_seen_at = $6, last_purchase_at = $7, updated_at = $8
         WHERE id = $9",
        &[
            &total_orders,
            &total_spent,
            &avg_order_value,
            &(source.ltv + target.ltv),
            &first_seen_at,
            &last_seen_at,
            &last_purchase_at,
            &now,
            &target.id,
        ],
    )
    .await
    .context("Merge: Failed to fold target metrics")?;

    tx.execute(
        "UPDATE customer_profiles
         SET is_merged = TRUE, merged_into = $1, updated_at = $2
         WHERE id = $3",
        &[&target.id, &now, &source.id],
    )
    .await
    .context("Merge: Failed to mark source as merged")?;

    // Authoritative recompute from the combined event history; the fold
    // above is only a fast path.
    recompute_metrics(&tx, &target.id).await?;

    tx.commit()
        .await
        .context("Merge: Failed to commit merge transaction")?;

    info!(
        "Merge: {} -> {} ({} identifiers, {} events moved, score {:.3}, type {}, log {})",
        source.id, target.id, moved, moved_events, confidence_score, merge_type, merge_log_id
    );
    Ok(MergeOutcome {
        target_id: target.id,
        merge_log_id,
    })
}

/// Reverses one specific merge using its stored snapshot. Refuses if the
/// log entry is missing, already rolled back, was a pending-review entry
/// (nothing moved), or if either profile participates in a later merge
/// that is still standing — chains unwind newest-first.
pub async fn rollback_merge(
    pool: &PgPool,
    merge_log_id: &str,
    reason: &str,
    rolled_back_by: &str,
) -> Result<()> {
    if reason.trim().is_empty() {
        return Err(ResolverError::Validation("rollback reason is required".to_string()).into());
    }

    let mut conn = pool
        .get()
        .await
        .context("Rollback: Failed to get DB connection")?;
    let tx = conn
        .transaction()
        .await
        .context("Rollback: Failed to start transaction")?;

    let row = tx
        .query_opt(
            "SELECT * FROM merge_log WHERE id = $1 FOR UPDATE",
            &[&merge_log_id],
        )
        .await
        .context("Rollback: Failed to query merge_log")?
        .ok_or_else(|| ResolverError::NotFound("merge log", merge_log_id.to_string()))?;
    let entry = crate::models::MergeLogEntry::from_row(&row)?;

    if entry.merge_type == MergeType::PendingReview {
        return Err(ResolverError::Validation(format!(
            "merge log {} is a pending-review entry; nothing was moved",
            merge_log_id
        ))
        .into());
    }
    if entry.rolled_back {
        return Err(ResolverError::AlreadyRolledBack(merge_log_id.to_string()).into());
    }

    // Chain consistency: a later merge touching either side would be
    // left dangling by this rollback.
    let conflict = tx
        .query_opt(
            "SELECT id FROM merge_log
             WHERE merged_at > $1 AND rolled_back = FALSE AND merge_type != 'pending_review'
               AND (source_profile_id = ANY($2) OR target_profile_id = ANY($2))
             ORDER BY merged_at DESC LIMIT 1",
            &[
                &entry.merged_at,
                &vec![entry.source_profile_id.clone(), entry.target_profile_id.clone()],
            ],
        )
        .await
        .context("Rollback: Failed to check merge chain")?;
    if let Some(conflict_row) = conflict {
        let conflict_id: String = conflict_row.get("id");
        return Err(
            ResolverError::MergeChainConflict(merge_log_id.to_string(), conflict_id).into(),
        );
    }

    let snapshot_json = entry
        .snapshot
        .clone()
        .ok_or_else(|| ResolverError::Validation(format!(
            "merge log {} has no snapshot to restore from",
            merge_log_id
        )))?;
    let snapshot: MergeSnapshot = serde_json::from_value(snapshot_json)
        .context("Rollback: Failed to deserialize snapshot")?;
    snapshot.validate()?;

    // Lock both profile rows in id order, same discipline as merge.
    let (first, second) = if entry.source_profile_id < entry.target_profile_id {
        (&entry.source_profile_id, &entry.target_profile_id)
    } else {
        (&entry.target_profile_id, &entry.source_profile_id)
    };
    lock_profile(&tx, first).await?;
    lock_profile(&tx, second).await?;

    let now = Utc::now();
    restore_profile_row(&tx, &snapshot.source.profile).await?;
    restore_profile_row(&tx, &snapshot.target.profile).await?;

    // Move each identifier row back by its original row id; rows the
    // merge deleted as duplicates are re-created.
    for ident in &snapshot.source.identifiers {
        restore_identifier_row(&tx, ident, &snapshot.source.profile.id).await?;
    }

    if !snapshot.source.event_ids.is_empty() {
        tx.execute(
            "UPDATE customer_events SET profile_id = $1 WHERE id = ANY($2)",
            &[&snapshot.source.profile.id, &snapshot.source.event_ids],
        )
        .await
        .context("Rollback: Failed to restore event ownership")?;
    }

    // Exactly-once marker; a concurrent rollback racing us loses here.
    let marked = tx
        .execute(
            "UPDATE merge_log
             SET rolled_back = TRUE, rolled_back_at = $1, rolled_back_by = $2, rollback_reason = $3
             WHERE id = $4 AND rolled_back = FALSE",
            &[&now, &rolled_back_by, &reason, &merge_log_id],
        )
        .await
        .context("Rollback: Failed to mark merge_log as rolled back")?;
    if marked != 1 {
        return Err(ResolverError::AlreadyRolledBack(merge_log_id.to_string()).into());
    }

    recompute_metrics(&tx, &snapshot.source.profile.id).await?;
    recompute_metrics(&tx, &snapshot.target.profile.id).await?;

    tx.commit()
        .await
        .context("Rollback: Failed to commit rollback transaction")?;

    info!(
        "Rollback: merge log {} reversed ({} -> {}) by {}",
        merge_log_id, entry.source_profile_id, entry.target_profile_id, rolled_back_by
    );
    Ok(())
}

async fn lock_profile(tx: &Transaction<'_>, profile_id: &str) -> Result<CustomerProfile> {
    let row = tx
        .query_opt(
            "SELECT * FROM customer_profiles WHERE id = $1 FOR UPDATE",
            &[&profile_id],
        )
        .await
        .context("Failed to lock profile row")?
        .ok_or_else(|| ResolverError::NotFound("profile", profile_id.to_string()))?;
    Ok(CustomerProfile::from_row(&row))
}

async fn snapshot_profile(
    tx: &Transaction<'_>,
    profile: &CustomerProfile,
) -> Result<ProfileSnapshot> {
    let ident_rows = tx
        .query(
            "SELECT * FROM profile_identifiers WHERE profile_id = $1 ORDER BY created_at, id",
            &[&profile.id],
        )
        .await
        .context("Merge: Failed to snapshot identifiers")?;
    let mut identifiers = Vec::with_capacity(ident_rows.len());
    for row in &ident_rows {
        identifiers.push(ProfileIdentifier::from_row(row)?);
    }

    let event_rows = tx
        .query(
            "SELECT id FROM customer_events WHERE profile_id = $1",
            &[&profile.id],
        )
        .await
        .context("Merge: Failed to snapshot event ids")?;
    let event_ids = event_rows
        .iter()
        .map(|row| row.get::<_, String>("id"))
        .collect();

    Ok(ProfileSnapshot {
        profile: profile.clone(),
        identifiers,
        event_ids,
    })
}

/// Writes a profile row back to its snapshotted state. Clears the merge
/// flags on the source; the target's were never set.
async fn restore_profile_row(tx: &Transaction<'_>, profile: &CustomerProfile) -> Result<()> {
    tx.execute(
        "UPDATE customer_profiles SET
            first_name = $1, last_name = $2, full_name = $3,
            primary_phone = $4, primary_email = $5,
            total_orders = $6, total_spent = $7, avg_order_value = $8, ltv = $9,
            first_seen_at = $10, last_seen_at = $11, last_purchase_at = $12,
            is_merged = FALSE, merged_into = NULL, updated_at = $13
         WHERE id = $14",
        &[
            &profile.first_name,
            &profile.last_name,
            &profile.full_name,
            &profile.primary_phone,
            &profile.primary_email,
            &profile.total_orders,
            &profile.total_spent,
            &profile.avg_order_value,
            &profile.ltv,
            &profile.first_seen_at,
            &profile.last_seen_at,
            &profile.last_purchase_at,
            &Utc::now(),
            &profile.id,
        ],
    )
    .await
    .context("Rollback: Failed to restore profile row")?;
    Ok(())
}

async fn restore_identifier_row(
    tx: &Transaction<'_>,
    ident: &ProfileIdentifier,
    owner_id: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO profile_identifiers
            (id, profile_id, id_type, raw_value, value_hash, confidence, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (id) DO UPDATE SET profile_id = EXCLUDED.profile_id",
        &[
            &ident.id,
            &owner_id,
            &ident.id_type.as_str(),
            &ident.raw_value,
            &ident.value_hash,
            &ident.confidence,
            &ident.created_at,
        ],
    )
    .await
    .context("Rollback: Failed to restore identifier row")?;
    Ok(())
}

/// Recomputes a profile's purchase-derived metrics from its current
/// event set. This is the source of truth; additive folds are only an
/// optimization.
pub async fn recompute_metrics(tx: &Transaction<'_>, profile_id: &str) -> Result<()> {
    let row = tx
        .query_one(
            "SELECT
                COUNT(*) FILTER (WHERE event_type = 'purchase') AS total_orders,
                COALESCE(SUM(amount) FILTER (WHERE event_type = 'purchase'), 0.0) AS total_spent,
                MAX(occurred_at) FILTER (WHERE event_type = 'purchase') AS last_purchase_at
             FROM customer_events WHERE profile_id = $1",
            &[&profile_id],
        )
        .await
        .context("Failed to aggregate events for metric recompute")?;

    let total_orders: i64 = row.get("total_orders");
    let total_spent: f64 = row.get("total_spent");
    let last_purchase_at: Option<chrono::DateTime<Utc>> = row.get("last_purchase_at");
    let avg_order_value = if total_orders > 0 {
        total_spent / total_orders as f64
    } else {
        0.0
    };

    tx.execute(
        "UPDATE customer_profiles SET
            total_orders = $1, total_spent = $2, avg_order_value = $3, ltv = $4,
            last_purchase_at = $5, updated_at = $6
         WHERE id = $7",
        &[
            &total_orders,
            &total_spent,
            &avg_order_value,
            &total_spent,
            &last_purchase_at,
            &Utc::now(),
            &profile_id,
        ],
    )
    .await
    .context("Failed to write recomputed metrics")?;

    debug!(
        "Metrics: {} recomputed to {} orders / {:.2} spent",
        profile_id, total_orders, total_spent
    );
    Ok(())
}
