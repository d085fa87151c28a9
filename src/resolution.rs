// src/resolution.rs

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::ResolverConfig;
use crate::db::PgPool;
use crate::errors::ResolverError;
use crate::matching::{exact, fuzzy};
use crate::models::{
    MergeType, NormalizedIdentifiers, ResolutionAction, ResolutionOutcome, ScoreBreakdown,
};
use crate::scoring::ScoringEngine;
use crate::services::{merge, profile, review};

/// Branch for a scored pair of exact-matched profiles. Pure function of
/// the score relative to the two thresholds; both comparisons are
/// inclusive on the lower bound (`score >= threshold`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairDecision {
    AutoMerge,
    QueueForReview,
    /// Multiple exact matches scored below the review band: the first
    /// candidate is returned as matched and the rest are ignored. A
    /// deliberate, visible compromise rather than an implicit default.
    LowScoreMultiMatch,
}

pub fn decide_pair(score: f64, config: &ResolverConfig) -> PairDecision {
    if score >= config.auto_merge_threshold {
        PairDecision::AutoMerge
    } else if score >= config.manual_review_threshold {
        PairDecision::QueueForReview
    } else {
        PairDecision::LowScoreMultiMatch
    }
}

/// Branch for the best fuzzy candidate when no exact match exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzyDecision {
    /// High confidence: the event belongs to that one profile directly,
    /// no merge involved.
    DirectMatch,
    /// Review band: create a fresh profile, queue the (new, candidate)
    /// pair for a human.
    CreateAndQueue,
    CreateOnly,
}

pub fn decide_fuzzy(score: f64, config: &ResolverConfig) -> FuzzyDecision {
    if score >= config.auto_merge_threshold {
        FuzzyDecision::DirectMatch
    } else if score >= config.manual_review_threshold {
        FuzzyDecision::CreateAndQueue
    } else {
        FuzzyDecision::CreateOnly
    }
}

/// Sequences matching, scoring, and the merge/review/create policy for
/// one incoming event. Matching reads are non-transactional; only
/// profile creation and merges open a transaction, and the ML scorer is
/// always consulted before any transaction begins.
pub struct ResolutionOrchestrator {
    pool: PgPool,
    config: ResolverConfig,
    scoring: ScoringEngine,
}

impl ResolutionOrchestrator {
    pub fn new(pool: PgPool, config: ResolverConfig) -> Result<Self> {
        let scoring = ScoringEngine::new(config.clone())
            .context("Resolution: failed to build scoring engine")?;
        Ok(ResolutionOrchestrator {
            pool,
            config,
            scoring,
        })
    }

    pub async fn resolve(
        &self,
        event_id: &str,
        identifiers: &NormalizedIdentifiers,
    ) -> Result<ResolutionOutcome> {
        if event_id.trim().is_empty() {
            return Err(ResolverError::Validation("event_id is required".to_string()).into());
        }
        if identifiers.is_empty() {
            return Err(ResolverError::Validation(
                "at least one identifier is required".to_string(),
            )
            .into());
        }

        let candidates = exact::find_exact_candidates(&self.pool, identifiers)
            .await
            .context("Resolution: exact matching failed")?;

        let outcome = match candidates.len() {
            0 => self.resolve_without_exact(event_id, identifiers).await?,
            1 => {
                let profile_id = candidates.into_iter().next().expect("one candidate");
                profile::attach_identifiers(&self.pool, &profile_id, identifiers).await?;
                info!(
                    "Resolution[{}]: matched profile {} (exact, score 1.0)",
                    event_id, profile_id
                );
                ResolutionOutcome::matched(profile_id, Some(1.0))
            }
            _ => {
                self.resolve_multi_exact(event_id, identifiers, candidates)
                    .await?
            }
        };
        Ok(outcome)
    }

    /// Multiple exact candidates: score the first against each of the
    /// rest and act on the best-scoring pair.
    async fn resolve_multi_exact(
        &self,
        event_id: &str,
        identifiers: &NormalizedIdentifiers,
        candidates: Vec<String>,
    ) -> Result<ResolutionOutcome> {
        let anchor = candidates[0].clone();
        let mut best: Option<(String, ScoreBreakdown)> = None;
        for other in &candidates[1..] {
            let breakdown = self
                .scoring
                .score_pair(&self.pool, identifiers, Some(anchor.as_str()), other)
                .await?;
            let better = match &best {
                Some((_, current)) => breakdown.final_score > current.final_score,
                None => true,
            };
            if better {
                best = Some((other.clone(), breakdown));
            }
        }
        let (best_other, breakdown) = best.expect("at least one non-anchor candidate");
        let score = breakdown.final_score;

        match decide_pair(score, &self.config) {
            PairDecision::AutoMerge => {
                let outcome = merge::merge_profiles(
                    &self.pool,
                    &best_other,
                    &anchor,
                    score,
                    breakdown.to_json(),
                    MergeType::Auto,
                    &format!("auto-merge from event {}", event_id),
                    "resolution",
                    None,
                )
                .await?;
                profile::attach_identifiers(&self.pool, &outcome.target_id, identifiers).await?;
                info!(
                    "Resolution[{}]: merged {} into {} at {:.3}",
                    event_id, best_other, anchor, score
                );
                Ok(ResolutionOutcome {
                    profile_id: outcome.target_id,
                    action: ResolutionAction::Merged,
                    confidence_score: Some(score),
                    matched_profiles: Some((best_other, anchor)),
                })
            }
            PairDecision::QueueForReview => {
                review::queue_for_review(
                    &self.pool,
                    &best_other,
                    &anchor,
                    score,
                    breakdown.to_json(),
                    "resolution",
                )
                .await?;
                info!(
                    "Resolution[{}]: queued ({}, {}) for review at {:.3}; caller gets {}",
                    event_id, best_other, anchor, score, anchor
                );
                Ok(ResolutionOutcome {
                    profile_id: anchor.clone(),
                    action: ResolutionAction::QueuedForReview,
                    confidence_score: Some(score),
                    matched_profiles: Some((best_other, anchor)),
                })
            }
            PairDecision::LowScoreMultiMatch => {
                warn!(
                    "Resolution[{}]: {} exact candidates scored {:.3}, below review band; \
                     matching first candidate {} and ignoring the rest",
                    event_id,
                    candidates.len(),
                    score,
                    anchor
                );
                profile::attach_identifiers(&self.pool, &anchor, identifiers).await?;
                Ok(ResolutionOutcome::matched(anchor, Some(score)))
            }
        }
    }

    /// No exact match: try fuzzy candidates (scored without a source
    /// profile, so name and purchase terms are skipped), else create.
    async fn resolve_without_exact(
        &self,
        event_id: &str,
        identifiers: &NormalizedIdentifiers,
    ) -> Result<ResolutionOutcome> {
        let candidates = fuzzy::find_fuzzy_candidates(&self.pool, &self.config, identifiers)
            .await
            .context("Resolution: fuzzy matching failed")?;

        let mut best: Option<(String, ScoreBreakdown)> = None;
        for candidate in &candidates {
            let breakdown = self
                .scoring
                .score_pair(&self.pool, identifiers, None, candidate)
                .await?;
            let better = match &best {
                Some((_, current)) => breakdown.final_score > current.final_score,
                None => true,
            };
            if better {
                best = Some((candidate.clone(), breakdown));
            }
        }

        if let Some((candidate, breakdown)) = best {
            let score = breakdown.final_score;
            match decide_fuzzy(score, &self.config) {
                FuzzyDecision::DirectMatch => {
                    profile::attach_identifiers(&self.pool, &candidate, identifiers).await?;
                    info!(
                        "Resolution[{}]: fuzzy-matched profile {} at {:.3}",
                        event_id, candidate, score
                    );
                    return Ok(ResolutionOutcome::matched(candidate, Some(score)));
                }
                FuzzyDecision::CreateAndQueue => {
                    let created = profile::create_profile(&self.pool, identifiers).await?;
                    review::queue_for_review(
                        &self.pool,
                        &created.id,
                        &candidate,
                        score,
                        breakdown.to_json(),
                        "resolution",
                    )
                    .await?;
                    info!(
                        "Resolution[{}]: created {} and queued ({}, {}) for review at {:.3}",
                        event_id, created.id, created.id, candidate, score
                    );
                    return Ok(ResolutionOutcome {
                        profile_id: created.id.clone(),
                        action: ResolutionAction::QueuedForReview,
                        confidence_score: Some(score),
                        matched_profiles: Some((created.id, candidate)),
                    });
                }
                FuzzyDecision::CreateOnly => {}
            }
        }

        let created = profile::create_profile(&self.pool, identifiers).await?;
        info!("Resolution[{}]: created profile {}", event_id, created.id);
        Ok(ResolutionOutcome::created(created.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResolverConfig {
        ResolverConfig::default()
    }

    #[test]
    fn test_pair_decision_thresholds_are_inclusive_lower_bound() {
        let config = config();
        // exactly at auto-merge threshold merges
        assert_eq!(decide_pair(0.80, &config), PairDecision::AutoMerge);
        assert_eq!(decide_pair(0.95, &config), PairDecision::AutoMerge);
        // just below auto-merge queues
        assert_eq!(decide_pair(0.799, &config), PairDecision::QueueForReview);
        // exactly at review threshold queues
        assert_eq!(decide_pair(0.45, &config), PairDecision::QueueForReview);
        // below review band falls back to first-candidate match
        assert_eq!(decide_pair(0.449, &config), PairDecision::LowScoreMultiMatch);
        assert_eq!(decide_pair(0.0, &config), PairDecision::LowScoreMultiMatch);
    }

    #[test]
    fn test_fuzzy_decision_thresholds() {
        let config = config();
        assert_eq!(decide_fuzzy(0.80, &config), FuzzyDecision::DirectMatch);
        assert_eq!(decide_fuzzy(0.79, &config), FuzzyDecision::CreateAndQueue);
        assert_eq!(decide_fuzzy(0.45, &config), FuzzyDecision::CreateAndQueue);
        assert_eq!(decide_fuzzy(0.44, &config), FuzzyDecision::CreateOnly);
    }

    #[test]
    fn test_decisions_follow_configured_thresholds() {
        let config = ResolverConfig::with_thresholds(0.5, 0.2).unwrap();
        // a phone-only 0.6 auto-merges when the threshold is lowered
        assert_eq!(decide_pair(0.6, &config), PairDecision::AutoMerge);
        assert_eq!(decide_pair(0.3, &config), PairDecision::QueueForReview);
        assert_eq!(decide_pair(0.1, &config), PairDecision::LowScoreMultiMatch);
    }
}
