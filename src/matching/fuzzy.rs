// src/matching/fuzzy.rs

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::debug;
use strsim::jaro_winkler;

use crate::config::ResolverConfig;
use crate::db::PgPool;
use crate::models::{IdentifierType, NormalizedIdentifiers};

/// Approximate candidate discovery for events with no exact match.
/// Three independent strategies, each over a bounded sample of rows
/// (`fuzzy_scan_limit`), unioned. The cap trades recall for latency:
/// identifiers past the sample are simply never candidates.
pub async fn find_fuzzy_candidates(
    pool: &PgPool,
    config: &ResolverConfig,
    identifiers: &NormalizedIdentifiers,
) -> Result<Vec<String>> {
    let mut candidates: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for id in email_local_part_candidates(pool, config, identifiers).await? {
        if seen.insert(id.clone()) {
            candidates.push(id);
        }
    }
    for id in name_candidates(pool, config, identifiers).await? {
        if seen.insert(id.clone()) {
            candidates.push(id);
        }
    }
    for id in phone_suffix_candidates(pool, config, identifiers).await? {
        if seen.insert(id.clone()) {
            candidates.push(id);
        }
    }

    debug!("Fuzzy: {} candidate profile(s) after union", candidates.len());
    Ok(candidates)
}

/// Email local-parts similar at or above the configured floor.
async fn email_local_part_candidates(
    pool: &PgPool,
    config: &ResolverConfig,
    identifiers: &NormalizedIdentifiers,
) -> Result<Vec<String>> {
    let incoming_local = match identifiers
        .get(IdentifierType::Email)
        .and_then(|i| email_local_part(&i.raw))
    {
        Some(local) => local.to_string(),
        None => return Ok(Vec::new()),
    };

    let conn = pool
        .get()
        .await
        .context("Fuzzy: Failed to get DB connection for email scan")?;
    let rows = conn
        .query(
            "SELECT pi.profile_id, pi.raw_value
             FROM profile_identifiers pi
             JOIN customer_profiles p ON p.id = pi.profile_id AND p.is_merged = FALSE
             WHERE pi.id_type = 'email'
             ORDER BY pi.created_at DESC
             LIMIT $1",
            &[&config.fuzzy_scan_limit],
        )
        .await
        .context("Fuzzy: Failed to scan email identifiers")?;

    let mut out = Vec::new();
    for row in rows {
        let raw: String = row.get("raw_value");
        if let Some(local) = email_local_part(&raw) {
            if jaro_winkler(&incoming_local, local) >= config.email_local_similarity_floor {
                out.push(row.get::<_, String>("profile_id"));
            }
        }
    }
    debug!("Fuzzy/email: {} candidate(s)", out.len());
    Ok(out)
}

/// Full-name similarity against profiles with a non-null name.
async fn name_candidates(
    pool: &PgPool,
    config: &ResolverConfig,
    identifiers: &NormalizedIdentifiers,
) -> Result<Vec<String>> {
    let incoming_name = match &identifiers.full_name {
        Some(name) if !name.trim().is_empty() => name.trim().to_lowercase(),
        _ => return Ok(Vec::new()),
    };

    let conn = pool
        .get()
        .await
        .context("Fuzzy: Failed to get DB connection for name scan")?;
    let rows = conn
        .query(
            "SELECT id, full_name
             FROM customer_profiles
             WHERE full_name IS NOT NULL AND is_merged = FALSE
             ORDER BY last_seen_at DESC
             LIMIT $1",
            &[&config.fuzzy_scan_limit],
        )
        .await
        .context("Fuzzy: Failed to scan profile names")?;

    let mut out = Vec::new();
    for row in rows {
        let full_name: String = row.get("full_name");
        if jaro_winkler(&incoming_name, &full_name.trim().to_lowercase())
            >= config.name_similarity_floor
        {
            out.push(row.get::<_, String>("id"));
        }
    }
    debug!("Fuzzy/name: {} candidate(s)", out.len());
    Ok(out)
}

/// Trailing-digit phone match: the last `phone_suffix_len` normalized
/// digits equal those of a stored phone identifier.
async fn phone_suffix_candidates(
    pool: &PgPool,
    config: &ResolverConfig,
    identifiers: &NormalizedIdentifiers,
) -> Result<Vec<String>> {
    let incoming_suffix = match identifiers
        .get(IdentifierType::Phone)
        .and_then(|i| phone_suffix(&i.raw, config.phone_suffix_len))
    {
        Some(suffix) => suffix,
        None => return Ok(Vec::new()),
    };

    let conn = pool
        .get()
        .await
        .context("Fuzzy: Failed to get DB connection for phone scan")?;
    let rows = conn
        .query(
            "SELECT pi.profile_id, pi.raw_value
             FROM profile_identifiers pi
             JOIN customer_profiles p ON p.id = pi.profile_id AND p.is_merged = FALSE
             WHERE pi.id_type = 'phone'
             ORDER BY pi.created_at DESC
             LIMIT $1",
            &[&config.fuzzy_scan_limit],
        )
        .await
        .context("Fuzzy: Failed to scan phone identifiers")?;

    let mut out = Vec::new();
    for row in rows {
        let raw: String = row.get("raw_value");
        if phone_suffix(&raw, config.phone_suffix_len).as_deref() == Some(incoming_suffix.as_str()) {
            out.push(row.get::<_, String>("profile_id"));
        }
    }
    debug!("Fuzzy/phone: {} candidate(s)", out.len());
    Ok(out)
}

/// The part of an email address before '@', lowercased by the upstream
/// normalizer. Returns None for values with no usable local part.
pub fn email_local_part(email: &str) -> Option<&str> {
    let local = email.split('@').next()?;
    if local.is_empty() || !email.contains('@') {
        return None;
    }
    Some(local)
}

/// Last `len` digits of a phone number, ignoring formatting. Numbers with
/// fewer digits than `len` do not participate in suffix matching.
pub fn phone_suffix(phone: &str, len: usize) -> Option<String> {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < len {
        return None;
    }
    Some(digits[digits.len() - len..].iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_local_part() {
        assert_eq!(email_local_part("jane.doe@example.com"), Some("jane.doe"));
        assert_eq!(email_local_part("a@b"), Some("a"));
        assert_eq!(email_local_part("@example.com"), None);
        assert_eq!(email_local_part("not-an-email"), None);
    }

    #[test]
    fn test_phone_suffix() {
        assert_eq!(phone_suffix("+1 (206) 555-0001", 7), Some("5550001".to_string()));
        assert_eq!(phone_suffix("2065550001", 7), Some("5550001".to_string()));
        // identical trailing digits, different country formatting
        assert_eq!(
            phone_suffix("+44 20 6555 0001", 7),
            phone_suffix("206-555-0001", 7)
        );
        // too short to participate
        assert_eq!(phone_suffix("555-01", 7), None);
    }

    #[test]
    fn test_local_part_similarity_floor_behaves() {
        // Near-identical local parts clear the default 0.8 floor.
        assert!(jaro_winkler("jane.doe", "janedoe") >= 0.8);
        // Unrelated ones do not.
        assert!(jaro_winkler("jane.doe", "bob.smith") < 0.8);
    }
}
