// src/matching/exact.rs

use anyhow::{Context, Result};
use log::debug;
use tokio_postgres::types::ToSql;

use crate::db::PgPool;
use crate::models::NormalizedIdentifiers;

/// Pure (type, hash) lookup: returns the ids of non-merged profiles that
/// own at least one identifier row matching the incoming set. No scoring,
/// no side effects; an empty result is not an error.
///
/// Candidate order is deterministic (first_seen_at, then id) so the
/// orchestrator's "first candidate" is stable across calls.
pub async fn find_exact_candidates(
    pool: &PgPool,
    identifiers: &NormalizedIdentifiers,
) -> Result<Vec<String>> {
    if identifiers.is_empty() {
        return Ok(Vec::new());
    }

    let conn = pool
        .get()
        .await
        .context("Exact: Failed to get DB connection")?;

    // One (id_type = $n AND value_hash = $n+1) disjunct per incoming
    // identifier.
    let mut clauses: Vec<String> = Vec::new();
    let mut owned_params: Vec<String> = Vec::new();
    for (id_type, ident) in &identifiers.identifiers {
        let idx = owned_params.len();
        clauses.push(format!(
            "(pi.id_type = ${} AND pi.value_hash = ${})",
            idx + 1,
            idx + 2
        ));
        owned_params.push(id_type.as_str().to_string());
        owned_params.push(ident.value_hash.clone());
    }

    let query = format!(
        "SELECT DISTINCT p.id, p.first_seen_at
         FROM profile_identifiers pi
         JOIN customer_profiles p ON p.id = pi.profile_id AND p.is_merged = FALSE
         WHERE {}
         ORDER BY p.first_seen_at, p.id",
        clauses.join(" OR ")
    );

    let params: Vec<&(dyn ToSql + Sync)> = owned_params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect();

    let rows = conn
        .query(query.as_str(), params.as_slice())
        .await
        .context("Exact: Failed to query matching profile identifiers")?;

    let candidates: Vec<String> = rows.iter().map(|row| row.get::<_, String>("id")).collect();
    debug!(
        "Exact: {} identifier(s) matched {} candidate profile(s)",
        identifiers.len(),
        candidates.len()
    );
    Ok(candidates)
}
