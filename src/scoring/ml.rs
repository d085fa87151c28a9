// src/scoring/ml.rs

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::db::PgPool;
use crate::models::{CustomerEvent, CustomerProfile, ProfileIdentifier};

/// Events sent per profile in the scoring payload. Recent history is
/// what the model was trained on; older events add latency for nothing.
const MAX_EVENTS_PER_PROFILE: i64 = 200;

#[derive(Serialize)]
struct MlScoreRequest {
    profile_a: CustomerProfile,
    profile_b: CustomerProfile,
    identifiers_a: Vec<ProfileIdentifier>,
    identifiers_b: Vec<ProfileIdentifier>,
    events_a: Vec<CustomerEvent>,
    events_b: Vec<CustomerEvent>,
}

#[derive(Deserialize)]
struct MlScoreResponse {
    score: f64,
}

/// Client for the external, advisory ML scorer. Every failure mode —
/// unreachable endpoint, non-2xx, malformed body, timeout — yields
/// `None` and the caller keeps the rule-based score. The timeout is a
/// hard budget; this call must never hold a database transaction open.
pub struct MlScorer {
    client: reqwest::Client,
    url: String,
}

impl MlScorer {
    /// Fails if the HTTP client cannot be built: a client without the
    /// configured timeout would turn the hard budget into no budget.
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("ML scorer: Failed to build HTTP client")?;
        Ok(MlScorer { client, url })
    }

    pub async fn score_pair(&self, pool: &PgPool, source_id: &str, target_id: &str) -> Option<f64> {
        let request = match self.build_request(pool, source_id, target_id).await {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "ML scorer: failed to assemble payload for ({}, {}): {}",
                    source_id, target_id, e
                );
                return None;
            }
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("ML scorer: request failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!("ML scorer: non-success status {}", response.status());
            return None;
        }

        match response.json::<MlScoreResponse>().await {
            Ok(body) => {
                let score = body.score.clamp(0.0, 1.0);
                debug!(
                    "ML scorer: {:.3} for ({}, {})",
                    score, source_id, target_id
                );
                Some(score)
            }
            Err(e) => {
                warn!("ML scorer: malformed response body: {}", e);
                None
            }
        }
    }

    async fn build_request(
        &self,
        pool: &PgPool,
        source_id: &str,
        target_id: &str,
    ) -> Result<MlScoreRequest> {
        let conn = pool
            .get()
            .await
            .context("ML scorer: Failed to get DB connection")?;

        let mut profiles = Vec::with_capacity(2);
        for id in [source_id, target_id] {
            let row = conn
                .query_opt("SELECT * FROM customer_profiles WHERE id = $1", &[&id])
                .await
                .context("ML scorer: Failed to load profile")?
                .ok_or_else(|| anyhow::anyhow!("profile {} missing", id))?;
            profiles.push(CustomerProfile::from_row(&row));
        }
        let profile_b = profiles.pop().expect("two profiles loaded");
        let profile_a = profiles.pop().expect("two profiles loaded");

        let mut identifiers = Vec::with_capacity(2);
        let mut events = Vec::with_capacity(2);
        for id in [source_id, target_id] {
            let ident_rows = conn
                .query(
                    "SELECT * FROM profile_identifiers WHERE profile_id = $1",
                    &[&id],
                )
                .await
                .context("ML scorer: Failed to load identifiers")?;
            let mut idents = Vec::with_capacity(ident_rows.len());
            for row in &ident_rows {
                idents.push(ProfileIdentifier::from_row(row)?);
            }
            identifiers.push(idents);

            let event_rows = conn
                .query(
                    "SELECT * FROM customer_events WHERE profile_id = $1
                     ORDER BY occurred_at DESC LIMIT $2",
                    &[&id, &MAX_EVENTS_PER_PROFILE],
                )
                .await
                .context("ML scorer: Failed to load events")?;
            events.push(event_rows.iter().map(CustomerEvent::from_row).collect());
        }
        let events_b = events.pop().expect("two event sets loaded");
        let events_a = events.pop().expect("two event sets loaded");
        let identifiers_b = identifiers.pop().expect("two identifier sets loaded");
        let identifiers_a = identifiers.pop().expect("two identifier sets loaded");

        Ok(MlScoreRequest {
            profile_a,
            profile_b,
            identifiers_a,
            identifiers_b,
            events_a,
            events_b,
        })
    }
}
