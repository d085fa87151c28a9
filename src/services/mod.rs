// src/services/mod.rs

pub mod merge;
pub mod merge_log;
pub mod profile;
pub mod review;
