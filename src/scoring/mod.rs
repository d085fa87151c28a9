// src/scoring/mod.rs

pub mod ml;

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::{debug, warn};
use strsim::{jaro_winkler, normalized_levenshtein};

use crate::config::ResolverConfig;
use crate::db::PgPool;
use crate::matching::fuzzy::email_local_part;
use crate::models::{IdentifierType, NormalizedIdentifiers, ScoreBreakdown};
use self::ml::MlScorer;

// Signal weights. The sum can exceed 1.0 by design: this is a confidence
// heuristic, not a probability.
pub const PHONE_WEIGHT: f64 = 0.6;
pub const EMAIL_WEIGHT: f64 = 0.4;
pub const DEVICE_WEIGHT: f64 = 0.4;
pub const NAME_WEIGHT: f64 = 0.3;
pub const PURCHASE_WEIGHT: f64 = 0.2;

/// Partial credit factor for similar-but-not-equal email local parts.
pub const EMAIL_PARTIAL_FACTOR: f64 = 0.5;

/// Shared distinct SKUs at which purchase overlap saturates to 1.0.
pub const PURCHASE_OVERLAP_SATURATION: f64 = 5.0;

/// The identity-bearing facts of one stored profile, loaded once per
/// scoring call: identifier hashes by type, raw emails for local-part
/// similarity, the display name, and distinct purchased SKUs.
#[derive(Debug, Clone, Default)]
pub struct ProfileFacts {
    pub profile_id: String,
    pub phone_hashes: HashSet<String>,
    pub email_hashes: HashSet<String>,
    pub email_raws: Vec<String>,
    pub device_hashes: HashSet<String>,
    pub full_name: Option<String>,
    pub purchase_skus: HashSet<String>,
}

pub async fn load_profile_facts(pool: &PgPool, profile_id: &str) -> Result<ProfileFacts> {
    let conn = pool
        .get()
        .await
        .context("Scoring: Failed to get DB connection for profile facts")?;

    let mut facts = ProfileFacts {
        profile_id: profile_id.to_string(),
        ..ProfileFacts::default()
    };

    let name_row = conn
        .query_opt(
            "SELECT full_name FROM customer_profiles WHERE id = $1",
            &[&profile_id],
        )
        .await
        .context("Scoring: Failed to load profile name")?;
    if let Some(row) = name_row {
        facts.full_name = row.get("full_name");
    }

    let ident_rows = conn
        .query(
            "SELECT id_type, raw_value, value_hash
             FROM profile_identifiers WHERE profile_id = $1",
            &[&profile_id],
        )
        .await
        .context("Scoring: Failed to load profile identifiers")?;
    for row in ident_rows {
        let id_type: String = row.get("id_type");
        let value_hash: String = row.get("value_hash");
        match id_type.as_str() {
            "phone" => {
                facts.phone_hashes.insert(value_hash);
            }
            "email" => {
                facts.email_hashes.insert(value_hash);
                facts.email_raws.push(row.get("raw_value"));
            }
            "device" => {
                facts.device_hashes.insert(value_hash);
            }
            _ => {}
        }
    }

    let sku_rows = conn
        .query(
            "SELECT DISTINCT sku FROM customer_events
             WHERE profile_id = $1 AND event_type = 'purchase' AND sku IS NOT NULL",
            &[&profile_id],
        )
        .await
        .context("Scoring: Failed to load purchase SKUs")?;
    for row in sku_rows {
        facts.purchase_skus.insert(row.get("sku"));
    }

    Ok(facts)
}

/// Rule-based confidence between the incoming identifiers (optionally
/// backed by a source profile's facts) and a target profile's facts.
/// Absent signals contribute zero; they never reduce the score.
pub fn rule_score(
    incoming: &NormalizedIdentifiers,
    source: Option<&ProfileFacts>,
    target: &ProfileFacts,
) -> ScoreBreakdown {
    let mut breakdown = ScoreBreakdown::default();

    if let Some(hash) = incoming.hash_for(IdentifierType::Phone) {
        if target.phone_hashes.contains(hash) {
            breakdown.phone_exact = PHONE_WEIGHT;
        }
    }

    if let Some(ident) = incoming.get(IdentifierType::Email) {
        if target.email_hashes.contains(&ident.value_hash) {
            breakdown.email = EMAIL_WEIGHT;
        } else if let Some(incoming_local) = email_local_part(&ident.raw) {
            // Partial credit: best local-part similarity across the
            // target's stored emails, halved.
            let best = target
                .email_raws
                .iter()
                .filter_map(|raw| email_local_part(raw))
                .map(|local| jaro_winkler(incoming_local, local))
                .fold(0.0_f64, f64::max);
            if best > 0.0 {
                breakdown.email = EMAIL_WEIGHT * best * EMAIL_PARTIAL_FACTOR;
            }
        }
    }

    if let Some(hash) = incoming.hash_for(IdentifierType::Device) {
        if target.device_hashes.contains(hash) {
            breakdown.device_exact = DEVICE_WEIGHT;
        }
    }

    // Name and purchase-history terms only apply when comparing two
    // stored profiles.
    if let Some(source) = source {
        if let (Some(a), Some(b)) = (&source.full_name, &target.full_name) {
            let sim = normalized_levenshtein(&a.trim().to_lowercase(), &b.trim().to_lowercase());
            breakdown.name_similarity = NAME_WEIGHT * sim;
        }
        if !source.purchase_skus.is_empty() && !target.purchase_skus.is_empty() {
            let shared = source.purchase_skus.intersection(&target.purchase_skus).count();
            let overlap = (shared as f64 / PURCHASE_OVERLAP_SATURATION).min(1.0);
            breakdown.purchase_overlap = PURCHASE_WEIGHT * overlap;
        }
    }

    breakdown.rule_score = breakdown.phone_exact
        + breakdown.email
        + breakdown.device_exact
        + breakdown.name_similarity
        + breakdown.purchase_overlap;
    breakdown.final_score = breakdown.rule_score;
    breakdown
}

/// Computes confidence between a (possibly absent) source profile and a
/// target profile. Rule score first; when it lands in the ambiguous band
/// and a source profile exists, the external ML scorer is consulted and
/// its answer replaces the rule score. ML failure or timeout falls back
/// silently — never surfaced to the caller, never inside a transaction.
pub struct ScoringEngine {
    config: ResolverConfig,
    ml_scorer: Option<MlScorer>,
}

impl ScoringEngine {
    pub fn new(config: ResolverConfig) -> Result<Self> {
        let ml_scorer = match &config.ml_scorer_url {
            Some(url) => Some(MlScorer::new(url.clone(), config.ml_scorer_timeout)?),
            None => None,
        };
        Ok(ScoringEngine { config, ml_scorer })
    }

    /// The ambiguous band is [manual_review, auto_merge): confident
    /// scores on either side never need escalation.
    pub fn is_ambiguous(&self, score: f64) -> bool {
        score >= self.config.manual_review_threshold && score < self.config.auto_merge_threshold
    }

    pub async fn score_pair(
        &self,
        pool: &PgPool,
        incoming: &NormalizedIdentifiers,
        source_id: Option<&str>,
        target_id: &str,
    ) -> Result<ScoreBreakdown> {
        let source_facts = match source_id {
            Some(id) => Some(load_profile_facts(pool, id).await?),
            None => None,
        };
        let target_facts = load_profile_facts(pool, target_id).await?;

        let mut breakdown = rule_score(incoming, source_facts.as_ref(), &target_facts);
        debug!(
            "Scoring: rule score {:.3} for ({:?}, {})",
            breakdown.rule_score, source_id, target_id
        );

        if let (Some(ml), Some(source_id)) = (&self.ml_scorer, source_id) {
            if self.is_ambiguous(breakdown.rule_score) {
                match ml.score_pair(pool, source_id, target_id).await {
                    Some(score) => {
                        debug!(
                            "Scoring: ML score {:.3} replaces rule score {:.3} for ({}, {})",
                            score, breakdown.rule_score, source_id, target_id
                        );
                        breakdown.ml_score = Some(score);
                        breakdown.final_score = score;
                    }
                    None => {
                        warn!(
                            "Scoring: ML scorer unavailable for ({}, {}); keeping rule score {:.3}",
                            source_id, target_id, breakdown.rule_score
                        );
                    }
                }
            }
        }

        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hash_identifier;

    fn incoming(pairs: &[(IdentifierType, &str)]) -> NormalizedIdentifiers {
        let mut ids = NormalizedIdentifiers::default();
        for (t, raw) in pairs {
            ids.insert_raw(*t, raw);
        }
        ids
    }

    fn target_with(pairs: &[(IdentifierType, &str)]) -> ProfileFacts {
        let mut facts = ProfileFacts {
            profile_id: "target".to_string(),
            ..ProfileFacts::default()
        };
        for (t, raw) in pairs {
            let hash = hash_identifier(raw);
            match t {
                IdentifierType::Phone => {
                    facts.phone_hashes.insert(hash);
                }
                IdentifierType::Email => {
                    facts.email_hashes.insert(hash);
                    facts.email_raws.push(raw.to_string());
                }
                IdentifierType::Device => {
                    facts.device_hashes.insert(hash);
                }
                _ => {}
            }
        }
        facts
    }

    #[test]
    fn test_phone_only_scores_exactly_point_six() {
        let incoming = incoming(&[(IdentifierType::Phone, "2065550001")]);
        let target = target_with(&[(IdentifierType::Phone, "2065550001")]);
        let b = rule_score(&incoming, None, &target);
        assert_eq!(b.rule_score, 0.6);
        assert_eq!(b.final_score, 0.6);
        assert_eq!(b.email, 0.0);
    }

    #[test]
    fn test_phone_plus_email_is_exactly_one() {
        let incoming = incoming(&[
            (IdentifierType::Phone, "2065550001"),
            (IdentifierType::Email, "ada@example.com"),
        ]);
        let target = target_with(&[
            (IdentifierType::Phone, "2065550001"),
            (IdentifierType::Email, "ada@example.com"),
        ]);
        let b = rule_score(&incoming, None, &target);
        assert_eq!(b.rule_score, 1.0);
    }

    #[test]
    fn test_email_partial_credit_is_halved() {
        let incoming = incoming(&[(IdentifierType::Email, "jane.doe@gmail.com")]);
        let target = target_with(&[(IdentifierType::Email, "janedoe@work.com")]);
        let b = rule_score(&incoming, None, &target);
        let sim = jaro_winkler("jane.doe", "janedoe");
        assert!((b.email - EMAIL_WEIGHT * sim * 0.5).abs() < 1e-12);
        assert!(b.email > 0.0 && b.email < EMAIL_WEIGHT);
    }

    #[test]
    fn test_absent_signals_contribute_zero() {
        let incoming = incoming(&[(IdentifierType::Cookie, "some-cookie")]);
        let target = target_with(&[(IdentifierType::Phone, "2065550001")]);
        let b = rule_score(&incoming, None, &target);
        assert_eq!(b.rule_score, 0.0);
    }

    #[test]
    fn test_name_and_purchase_terms_require_source_profile() {
        let incoming = incoming(&[(IdentifierType::Phone, "2065550001")]);
        let mut target = target_with(&[(IdentifierType::Phone, "2065550001")]);
        target.full_name = Some("Ada Lovelace".to_string());
        target.purchase_skus.insert("SKU-1".to_string());

        // Without a source profile the extra terms are skipped.
        let b = rule_score(&incoming, None, &target);
        assert_eq!(b.rule_score, 0.6);

        let mut source = ProfileFacts {
            profile_id: "source".to_string(),
            ..ProfileFacts::default()
        };
        source.full_name = Some("Ada Lovelace".to_string());
        source.purchase_skus.insert("SKU-1".to_string());

        let b = rule_score(&incoming, Some(&source), &target);
        // identical names: full 0.3; one shared SKU: 0.2 * 1/5
        assert!((b.name_similarity - 0.3).abs() < 1e-12);
        assert!((b.purchase_overlap - 0.2 * (1.0 / 5.0)).abs() < 1e-12);
        assert!((b.rule_score - (0.6 + 0.3 + 0.04)).abs() < 1e-12);
    }

    #[test]
    fn test_purchase_overlap_saturates_at_five_skus() {
        let incoming = NormalizedIdentifiers::default();
        let mut source = ProfileFacts::default();
        let mut target = ProfileFacts::default();
        for i in 0..8 {
            source.purchase_skus.insert(format!("SKU-{}", i));
            target.purchase_skus.insert(format!("SKU-{}", i));
        }
        let b = rule_score(&incoming, Some(&source), &target);
        assert!((b.purchase_overlap - PURCHASE_WEIGHT).abs() < 1e-12);
    }

    #[test]
    fn test_ambiguous_band_is_inclusive_exclusive() {
        let engine = ScoringEngine::new(ResolverConfig::default()).unwrap();
        assert!(!engine.is_ambiguous(0.449));
        assert!(engine.is_ambiguous(0.45));
        assert!(engine.is_ambiguous(0.799));
        assert!(!engine.is_ambiguous(0.80));
    }

    #[test]
    fn test_engine_builds_timed_out_ml_client() {
        // With an ML url configured the engine must construct the
        // timeout-bearing client or fail loudly, never fall back to an
        // unbounded one.
        let mut config = ResolverConfig::default();
        config.ml_scorer_url = Some("http://localhost:9/score".to_string());
        let engine = ScoringEngine::new(config).unwrap();
        assert!(engine.ml_scorer.is_some());

        let no_ml = ScoringEngine::new(ResolverConfig::default()).unwrap();
        assert!(no_ml.ml_scorer.is_none());
    }
}
