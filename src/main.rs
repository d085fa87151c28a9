// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use resolver_lib::config::ResolverConfig;
use resolver_lib::db;
use resolver_lib::models::{IdentifierType, NormalizedIdentifiers};
use resolver_lib::resolution::ResolutionOrchestrator;
use resolver_lib::services::{merge, merge_log, review};

#[derive(Parser)]
#[command(name = "resolver", about = "Customer identity resolution and merge engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve one event's identifiers to a canonical profile.
    Resolve {
        /// Ingestion event id.
        event_id: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        cookie: Option<String>,
        #[arg(long)]
        loyalty_id: Option<String>,
        #[arg(long)]
        invoice_id: Option<String>,
        /// Free-text customer name, used by fuzzy matching only.
        #[arg(long)]
        name: Option<String>,
    },
    /// Page through merge history, newest first.
    MergeLogs {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Page through undecided pending-review pairs.
    PendingReviews {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Reverse one specific merge from its snapshot.
    Rollback {
        merge_log_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Decide a pending-review pair.
    ResolveReview {
        merge_log_id: String,
        /// Approve (manual merge) instead of reject.
        #[arg(long)]
        approve: bool,
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    db::load_env_from_file(".env")?;

    let config = ResolverConfig::from_env().context("Failed to load resolver configuration")?;
    config.log_config();

    let pool = db::connect().await.context("Failed to connect to database")?;

    let cli = Cli::parse();
    match cli.command {
        Command::Resolve {
            event_id,
            phone,
            email,
            device,
            cookie,
            loyalty_id,
            invoice_id,
            name,
        } => {
            let mut identifiers = NormalizedIdentifiers::default();
            let inputs = [
                (IdentifierType::Phone, phone),
                (IdentifierType::Email, email),
                (IdentifierType::Device, device),
                (IdentifierType::Cookie, cookie),
                (IdentifierType::LoyaltyId, loyalty_id),
                (IdentifierType::InvoiceId, invoice_id),
            ];
            for (id_type, value) in inputs {
                if let Some(value) = value {
                    identifiers.insert_raw(id_type, &value);
                }
            }
            identifiers.full_name = name;

            let orchestrator = ResolutionOrchestrator::new(pool, config)?;
            let outcome = orchestrator.resolve(&event_id, &identifiers).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::MergeLogs { page, limit } => {
            let page = merge_log::get_merge_logs(&pool, page, limit).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::PendingReviews { page, limit } => {
            let page = review::get_pending_reviews(&pool, page, limit).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Rollback {
            merge_log_id,
            reason,
            by,
        } => {
            merge::rollback_merge(&pool, &merge_log_id, &reason, &by).await?;
            info!("Rolled back merge log {}", merge_log_id);
            println!("{{\"success\": true, \"message\": \"merge {} rolled back\"}}", merge_log_id);
        }
        Command::ResolveReview {
            merge_log_id,
            approve,
            reviewer,
        } => {
            let decision = if approve {
                review::ReviewDecision::Approve
            } else {
                review::ReviewDecision::Reject
            };
            let resolution = review::resolve_review(&pool, &merge_log_id, decision, &reviewer).await?;
            match resolution.merge {
                Some(merge) => println!(
                    "{{\"entry\": \"{}\", \"outcome\": \"{}\", \"target_profile\": \"{}\", \"merge_log\": \"{}\"}}",
                    resolution.entry_id, resolution.outcome, merge.target_id, merge.merge_log_id
                ),
                None => println!(
                    "{{\"entry\": \"{}\", \"outcome\": \"{}\"}}",
                    resolution.entry_id, resolution.outcome
                ),
            }
        }
    }

    Ok(())
}
