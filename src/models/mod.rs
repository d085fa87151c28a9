// src/models/mod.rs

pub mod core;
pub mod merge;
pub mod resolution;

pub use self::core::{
    hash_identifier, CustomerEvent, CustomerProfile, IdentifierType, NormalizedIdentifier,
    NormalizedIdentifiers, ProfileIdentifier,
};
pub use merge::{
    MergeLogEntry, MergeSnapshot, MergeType, ProfileSnapshot, ScoreBreakdown,
    SNAPSHOT_SCHEMA_VERSION,
};
pub use resolution::{ResolutionAction, ResolutionOutcome};
