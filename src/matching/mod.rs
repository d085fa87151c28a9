// src/matching/mod.rs

pub mod exact;
pub mod fuzzy;
