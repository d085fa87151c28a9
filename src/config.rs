// src/config.rs

use std::time::Duration;

use anyhow::{bail, Result};
use log::info;

/// Tunables for the resolution engine, read from the environment once at
/// startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Score at/above which two profiles merge without human review.
    pub auto_merge_threshold: f64,
    /// Score at/above which (but below auto-merge) a pair is queued.
    pub manual_review_threshold: f64,
    /// Row cap per fuzzy strategy scan. Bounds cost at the price of
    /// recall: candidates beyond the cap are never considered.
    pub fuzzy_scan_limit: i64,
    /// Minimum jaro-winkler similarity on email local-parts.
    pub email_local_similarity_floor: f64,
    /// Minimum similarity on full names for fuzzy candidacy.
    pub name_similarity_floor: f64,
    /// Number of trailing normalized digits for the phone-suffix strategy.
    pub phone_suffix_len: usize,
    /// External ML scorer endpoint. None disables the escalation path.
    pub ml_scorer_url: Option<String>,
    /// Hard budget for one ML scorer call; timeout falls back silently
    /// to the rule-based score.
    pub ml_scorer_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            auto_merge_threshold: 0.80,
            manual_review_threshold: 0.45,
            fuzzy_scan_limit: 1000,
            email_local_similarity_floor: 0.8,
            name_similarity_floor: 0.85,
            phone_suffix_len: 7,
            ml_scorer_url: None,
            ml_scorer_timeout: Duration::from_secs(2),
        }
    }
}

impl ResolverConfig {
    /// Builds a config with explicit thresholds, enforcing
    /// `0 <= manual_review < auto_merge <= 1`.
    pub fn with_thresholds(auto_merge: f64, manual_review: f64) -> Result<Self> {
        let config = ResolverConfig {
            auto_merge_threshold: auto_merge,
            manual_review_threshold: manual_review,
            ..ResolverConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = ResolverConfig::default();

        if let Ok(v) = std::env::var("AUTO_MERGE_THRESHOLD") {
            config.auto_merge_threshold = v
                .parse()
                .map_err(|_| anyhow::anyhow!("AUTO_MERGE_THRESHOLD '{}' is not a number", v))?;
        }
        if let Ok(v) = std::env::var("MANUAL_REVIEW_THRESHOLD") {
            config.manual_review_threshold = v
                .parse()
                .map_err(|_| anyhow::anyhow!("MANUAL_REVIEW_THRESHOLD '{}' is not a number", v))?;
        }
        if let Ok(v) = std::env::var("FUZZY_SCAN_LIMIT") {
            config.fuzzy_scan_limit = v
                .parse()
                .map_err(|_| anyhow::anyhow!("FUZZY_SCAN_LIMIT '{}' is not a number", v))?;
        }
        if let Ok(v) = std::env::var("ML_SCORER_URL") {
            if !v.trim().is_empty() {
                config.ml_scorer_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ML_SCORER_TIMEOUT_MS") {
            let ms: u64 = v
                .parse()
                .map_err(|_| anyhow::anyhow!("ML_SCORER_TIMEOUT_MS '{}' is not a number", v))?;
            config.ml_scorer_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.manual_review_threshold)
            || !(0.0..=1.0).contains(&self.auto_merge_threshold)
            || self.manual_review_threshold >= self.auto_merge_threshold
        {
            bail!(
                "thresholds must satisfy 0 <= manual_review ({}) < auto_merge ({}) <= 1",
                self.manual_review_threshold,
                self.auto_merge_threshold
            );
        }
        if self.fuzzy_scan_limit <= 0 {
            bail!("FUZZY_SCAN_LIMIT must be positive, got {}", self.fuzzy_scan_limit);
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!(
            "Resolver config: auto_merge={}, manual_review={}, fuzzy_scan_limit={}, ml_scorer={}",
            self.auto_merge_threshold,
            self.manual_review_threshold,
            self.fuzzy_scan_limit,
            self.ml_scorer_url.as_deref().unwrap_or("disabled"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = ResolverConfig::default();
        assert_eq!(config.auto_merge_threshold, 0.80);
        assert_eq!(config.manual_review_threshold, 0.45);
        config.validate().unwrap();
    }

    #[test]
    fn test_threshold_ordering_is_enforced() {
        assert!(ResolverConfig::with_thresholds(0.5, 0.45).is_ok());
        // review >= auto
        assert!(ResolverConfig::with_thresholds(0.45, 0.45).is_err());
        assert!(ResolverConfig::with_thresholds(0.4, 0.6).is_err());
        // out of range
        assert!(ResolverConfig::with_thresholds(1.2, 0.45).is_err());
        assert!(ResolverConfig::with_thresholds(0.8, -0.1).is_err());
    }

    #[test]
    fn test_scan_limit_must_be_positive() {
        let mut config = ResolverConfig::default();
        config.fuzzy_scan_limit = 0;
        assert!(config.validate().is_err());
    }
}
