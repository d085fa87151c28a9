// src/lib.rs

pub mod config;
pub mod db;
pub mod errors;
pub mod matching;
pub mod models;
pub mod resolution;
pub mod scoring;
pub mod services;

pub use config::ResolverConfig;
pub use db::PgPool;
pub use errors::ResolverError;
pub use resolution::ResolutionOrchestrator;
