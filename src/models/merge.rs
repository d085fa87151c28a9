// src/models/merge.rs

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;

use crate::errors::ResolverError;
use crate::models::core::{CustomerProfile, ProfileIdentifier};

/// Snapshot wire-format version. Bump when `MergeSnapshot` changes shape;
/// rollback refuses snapshots written by a different version.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    Auto,
    Manual,
    PendingReview,
}

impl MergeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeType::Auto => "auto",
            MergeType::Manual => "manual",
            MergeType::PendingReview => "pending_review",
        }
    }
}

impl fmt::Display for MergeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(MergeType::Auto),
            "manual" => Ok(MergeType::Manual),
            "pending_review" => Ok(MergeType::PendingReview),
            other => Err(anyhow!("unknown merge type '{}'", other)),
        }
    }
}

/// Per-signal contributions behind a confidence score. Each field holds
/// the already-weighted contribution; `rule_score` is their sum. When the
/// ML scorer was consulted and answered in time, `ml_score` is set and
/// `final_score` carries it; otherwise `final_score == rule_score`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub phone_exact: f64,
    pub email: f64,
    pub device_exact: f64,
    pub name_similarity: f64,
    pub purchase_overlap: f64,
    pub rule_score: f64,
    pub ml_score: Option<f64>,
    pub final_score: f64,
}

impl ScoreBreakdown {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Pre-merge state of one profile: the profile row, all identifier rows,
/// and the ids of the event rows it owned. Captured before any mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub profile: CustomerProfile,
    pub identifiers: Vec<ProfileIdentifier>,
    pub event_ids: Vec<String>,
}

/// Versioned rollback material for one merge: both sides as they existed
/// immediately before any mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSnapshot {
    pub schema_version: u32,
    pub source: ProfileSnapshot,
    pub target: ProfileSnapshot,
}

impl MergeSnapshot {
    pub fn new(source: ProfileSnapshot, target: ProfileSnapshot) -> Self {
        MergeSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            source,
            target,
        }
    }

    /// Validates the shape tag before rollback mutates anything.
    pub fn validate(&self) -> Result<(), ResolverError> {
        if self.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(ResolverError::SnapshotSchema {
                found: self.schema_version,
                expected: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

/// Immutable audit record of one merge attempt. Pending-review entries
/// carry `merge_type = pending_review`, a null snapshot, and move nothing.
/// The rollback fields are set exactly once; nothing else is ever mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub id: String,
    pub source_profile_id: String,
    pub target_profile_id: String,
    pub snapshot: Option<serde_json::Value>,
    pub merge_type: MergeType,
    pub confidence_score: f64,
    pub score_breakdown: serde_json::Value,
    pub reason: String,
    pub triggered_by: String,
    pub merged_at: DateTime<Utc>,
    pub rolled_back: bool,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub rolled_back_by: Option<String>,
    pub rollback_reason: Option<String>,
    pub review_outcome: Option<String>,
}

impl MergeLogEntry {
    pub fn from_row(row: &Row) -> Result<Self> {
        let merge_type: String = row.get("merge_type");
        Ok(MergeLogEntry {
            id: row.get("id"),
            source_profile_id: row.get("source_profile_id"),
            target_profile_id: row.get("target_profile_id"),
            snapshot: row.get("snapshot"),
            merge_type: merge_type.parse()?,
            confidence_score: row.get("confidence_score"),
            score_breakdown: row.get("score_breakdown"),
            reason: row.get("reason"),
            triggered_by: row.get("triggered_by"),
            merged_at: row.get("merged_at"),
            rolled_back: row.get("rolled_back"),
            rolled_back_at: row.get("rolled_back_at"),
            rolled_back_by: row.get("rolled_back_by"),
            rollback_reason: row.get("rollback_reason"),
            review_outcome: row.get("review_outcome"),
        })
    }
}
