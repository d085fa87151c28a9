// src/models/core.rs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_postgres::Row;

/// The identifier channels a touchpoint can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Phone,
    Email,
    Device,
    Cookie,
    LoyaltyId,
    InvoiceId,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Phone => "phone",
            IdentifierType::Email => "email",
            IdentifierType::Device => "device",
            IdentifierType::Cookie => "cookie",
            IdentifierType::LoyaltyId => "loyalty_id",
            IdentifierType::InvoiceId => "invoice_id",
        }
    }

    pub fn all() -> [IdentifierType; 6] {
        [
            IdentifierType::Phone,
            IdentifierType::Email,
            IdentifierType::Device,
            IdentifierType::Cookie,
            IdentifierType::LoyaltyId,
            IdentifierType::InvoiceId,
        ]
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "phone" => Ok(IdentifierType::Phone),
            "email" => Ok(IdentifierType::Email),
            "device" => Ok(IdentifierType::Device),
            "cookie" => Ok(IdentifierType::Cookie),
            "loyalty_id" => Ok(IdentifierType::LoyaltyId),
            "invoice_id" => Ok(IdentifierType::InvoiceId),
            other => Err(anyhow!("unknown identifier type '{}'", other)),
        }
    }
}

/// Canonical customer identity record. Never hard-deleted; merged-away
/// profiles keep their row with `is_merged` set and `merged_into` pointing
/// at the survivor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub primary_phone: Option<String>,
    pub primary_email: Option<String>,
    pub total_orders: i64,
    pub total_spent: f64,
    pub avg_order_value: f64,
    pub ltv: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_purchase_at: Option<DateTime<Utc>>,
    pub is_merged: bool,
    pub merged_into: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerProfile {
    pub fn from_row(row: &Row) -> Self {
        CustomerProfile {
            id: row.get("id"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            full_name: row.get("full_name"),
            primary_phone: row.get("primary_phone"),
            primary_email: row.get("primary_email"),
            total_orders: row.get("total_orders"),
            total_spent: row.get("total_spent"),
            avg_order_value: row.get("avg_order_value"),
            ltv: row.get("ltv"),
            first_seen_at: row.get("first_seen_at"),
            last_seen_at: row.get("last_seen_at"),
            last_purchase_at: row.get("last_purchase_at"),
            is_merged: row.get("is_merged"),
            merged_into: row.get("merged_into"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Edge from a profile to one observed identifier.
/// (profile_id, id_type, value_hash) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileIdentifier {
    pub id: String,
    pub profile_id: String,
    pub id_type: IdentifierType,
    pub raw_value: String,
    pub value_hash: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl ProfileIdentifier {
    pub fn from_row(row: &Row) -> Result<Self> {
        let id_type: String = row.get("id_type");
        Ok(ProfileIdentifier {
            id: row.get("id"),
            profile_id: row.get("profile_id"),
            id_type: id_type.parse()?,
            raw_value: row.get("raw_value"),
            value_hash: row.get("value_hash"),
            confidence: row.get("confidence"),
            created_at: row.get("created_at"),
        })
    }
}

/// One touchpoint attributed to a profile. Written by the ingestion layer;
/// the engine only reassigns ownership during merge/rollback and reads
/// purchase rows for metric recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerEvent {
    pub id: String,
    pub profile_id: String,
    pub event_id: String,
    pub event_type: String,
    pub sku: Option<String>,
    pub amount: Option<f64>,
    pub occurred_at: DateTime<Utc>,
}

impl CustomerEvent {
    pub fn from_row(row: &Row) -> Self {
        CustomerEvent {
            id: row.get("id"),
            profile_id: row.get("profile_id"),
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            sku: row.get("sku"),
            amount: row.get("amount"),
            occurred_at: row.get("occurred_at"),
        }
    }
}

/// Deterministic hash of a normalized identifier value: SHA-256 of the
/// lowercased, trimmed value, hex-encoded. Must match what the upstream
/// normalizer produced so exact matching stays hash-equality.
pub fn hash_identifier(value: &str) -> String {
    let normalized = value.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// A single normalized identifier value plus its deterministic hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedIdentifier {
    pub raw: String,
    pub value_hash: String,
}

impl NormalizedIdentifier {
    pub fn from_raw(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let value_hash = hash_identifier(&raw);
        NormalizedIdentifier { raw, value_hash }
    }
}

/// The normalized identifier set for one incoming event, keyed by type,
/// plus any free-text supplementary fields the fuzzy matcher can use.
/// The engine trusts this input is already normalized upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedIdentifiers {
    pub identifiers: BTreeMap<IdentifierType, NormalizedIdentifier>,
    pub full_name: Option<String>,
}

impl NormalizedIdentifiers {
    pub fn insert_raw(&mut self, id_type: IdentifierType, raw: &str) {
        self.identifiers
            .insert(id_type, NormalizedIdentifier::from_raw(raw));
    }

    pub fn get(&self, id_type: IdentifierType) -> Option<&NormalizedIdentifier> {
        self.identifiers.get(&id_type)
    }

    pub fn hash_for(&self, id_type: IdentifierType) -> Option<&str> {
        self.identifiers
            .get(&id_type)
            .map(|i| i.value_hash.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_normalization_invariant() {
        assert_eq!(hash_identifier("User@Example.COM"), hash_identifier("user@example.com"));
        assert_eq!(hash_identifier("  555-0001  "), hash_identifier("555-0001"));
        assert_ne!(hash_identifier("a@b.com"), hash_identifier("c@d.com"));
        // 32 bytes hex-encoded
        assert_eq!(hash_identifier("x").len(), 64);
    }

    #[test]
    fn test_identifier_type_round_trip() {
        for t in IdentifierType::all() {
            assert_eq!(t.as_str().parse::<IdentifierType>().unwrap(), t);
        }
        assert!("carrier_pigeon".parse::<IdentifierType>().is_err());
    }

    #[test]
    fn test_normalized_set_accessors() {
        let mut ids = NormalizedIdentifiers::default();
        assert!(ids.is_empty());
        ids.insert_raw(IdentifierType::Email, "a@b.com");
        ids.insert_raw(IdentifierType::Phone, "2065550001");
        assert_eq!(ids.len(), 2);
        assert_eq!(
            ids.hash_for(IdentifierType::Email),
            Some(hash_identifier("a@b.com").as_str())
        );
        assert!(ids.hash_for(IdentifierType::Device).is_none());
    }
}
