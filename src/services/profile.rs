// src/services/profile.rs

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::db::PgPool;
use crate::errors::ResolverError;
use crate::models::{CustomerProfile, IdentifierType, NormalizedIdentifiers};

/// Creates a canonical profile plus one identifier row per incoming
/// normalized identifier, all in a single transaction. A profile without
/// its identifiers is never observable.
pub async fn create_profile(
    pool: &PgPool,
    identifiers: &NormalizedIdentifiers,
) -> Result<CustomerProfile> {
    if identifiers.is_empty() {
        return Err(ResolverError::Validation(
            "cannot create a profile with no identifiers".to_string(),
        )
        .into());
    }

    let mut conn = pool
        .get()
        .await
        .context("Profile: Failed to get DB connection for create")?;
    let tx = conn
        .transaction()
        .await
        .context("Profile: Failed to start transaction for create")?;

    let profile_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let (first_name, last_name) = split_name(identifiers.full_name.as_deref());
    let primary_phone = identifiers
        .get(IdentifierType::Phone)
        .map(|i| i.raw.clone());
    let primary_email = identifiers
        .get(IdentifierType::Email)
        .map(|i| i.raw.clone());

    tx.execute(
        "INSERT INTO customer_profiles (
            id, first_name, last_name, full_name, primary_phone, primary_email,
            total_orders, total_spent, avg_order_value, ltv,
            first_seen_at, last_seen_at, last_purchase_at,
            is_merged, merged_into, created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, 0, 0.0, 0.0, 0.0, $7, $7, NULL, FALSE, NULL, $7, $7)",
        &[
            &profile_id,
            &first_name,
            &last_name,
            &identifiers.full_name,
            &primary_phone,
            &primary_email,
            &now,
        ],
    )
    .await
    .context("Profile: Failed to insert customer_profiles row")?;

    // Multi-row identifier insert, one statement.
    let mut values_clause_parts = Vec::new();
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    let mut param_idx = 1;
    for (id_type, ident) in &identifiers.identifiers {
        values_clause_parts.push(format!(
            "(${}, ${}, ${}, ${}, ${}, 1.0, ${})",
            param_idx,
            param_idx + 1,
            param_idx + 2,
            param_idx + 3,
            param_idx + 4,
            param_idx + 5
        ));
        params.push(Box::new(Uuid::new_v4().to_string()));
        params.push(Box::new(profile_id.clone()));
        params.push(Box::new(id_type.as_str().to_string()));
        params.push(Box::new(ident.raw.clone()));
        params.push(Box::new(ident.value_hash.clone()));
        params.push(Box::new(now));
        param_idx += 6;
    }

    let insert_sql = format!(
        "INSERT INTO profile_identifiers
            (id, profile_id, id_type, raw_value, value_hash, confidence, created_at)
         VALUES {}",
        values_clause_parts.join(", ")
    );
    let params_slice: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    tx.execute(insert_sql.as_str(), params_slice.as_slice())
        .await
        .context("Profile: Failed to insert identifier rows")?;

    tx.commit()
        .await
        .context("Profile: Failed to commit create transaction")?;

    info!(
        "Profile: created {} with {} identifier(s)",
        profile_id,
        identifiers.len()
    );
    get_profile(pool, &profile_id)
        .await?
        .ok_or_else(|| ResolverError::NotFound("profile", profile_id).into())
}

/// Attaches any previously-unseen incoming identifiers to an existing
/// profile with confidence 1.0. Already-known (type, hash) pairs are left
/// untouched. Also bumps last_seen_at.
pub async fn attach_identifiers(
    pool: &PgPool,
    profile_id: &str,
    identifiers: &NormalizedIdentifiers,
) -> Result<u64> {
    if identifiers.is_empty() {
        return Ok(0);
    }

    let conn = pool
        .get()
        .await
        .context("Profile: Failed to get DB connection for attach")?;
    let now = Utc::now();

    let mut attached = 0;
    for (id_type, ident) in &identifiers.identifiers {
        let rows = conn
            .execute(
                "INSERT INTO profile_identifiers
                    (id, profile_id, id_type, raw_value, value_hash, confidence, created_at)
                 VALUES ($1, $2, $3, $4, $5, 1.0, $6)
                 ON CONFLICT (profile_id, id_type, value_hash) DO NOTHING",
                &[
                    &Uuid::new_v4().to_string(),
                    &profile_id,
                    &id_type.as_str(),
                    &ident.raw,
                    &ident.value_hash,
                    &now,
                ],
            )
            .await
            .context("Profile: Failed to attach identifier")?;
        attached += rows;
    }

    conn.execute(
        "UPDATE customer_profiles SET last_seen_at = $1, updated_at = $1 WHERE id = $2",
        &[&now, &profile_id],
    )
    .await
    .context("Profile: Failed to bump last_seen_at")?;

    if attached > 0 {
        debug!(
            "Profile: attached {} new identifier(s) to {}",
            attached, profile_id
        );
    }
    Ok(attached)
}

pub async fn get_profile(pool: &PgPool, profile_id: &str) -> Result<Option<CustomerProfile>> {
    let conn = pool
        .get()
        .await
        .context("Profile: Failed to get DB connection for read")?;
    let row = conn
        .query_opt("SELECT * FROM customer_profiles WHERE id = $1", &[&profile_id])
        .await
        .context("Profile: Failed to query profile")?;
    Ok(row.map(|r| CustomerProfile::from_row(&r)))
}

/// Splits a free-text full name into (first, last) on the last space.
fn split_name(full_name: Option<&str>) -> (Option<String>, Option<String>) {
    let name = match full_name {
        Some(n) if !n.trim().is_empty() => n.trim(),
        _ => return (None, None),
    };
    match name.rsplit_once(' ') {
        Some((first, last)) => (Some(first.trim().to_string()), Some(last.to_string())),
        None => (Some(name.to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(
            split_name(Some("Ada Lovelace")),
            (Some("Ada".to_string()), Some("Lovelace".to_string()))
        );
        assert_eq!(
            split_name(Some("Anne Marie Smith")),
            (Some("Anne Marie".to_string()), Some("Smith".to_string()))
        );
        assert_eq!(split_name(Some("Prince")), (Some("Prince".to_string()), None));
        assert_eq!(split_name(Some("   ")), (None, None));
        assert_eq!(split_name(None), (None, None));
    }
}
