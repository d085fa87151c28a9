// tests/test_merge_rollback.rs
//
// Postgres-backed round-trip tests for the merge, rollback, review, and
// resolution paths. They need a live database: set RESOLVER_TEST_DB=1
// (plus the POSTGRES_* connection variables) to enable them; without it
// each test skips so the suite stays green on machines without Postgres.
// The schema is applied idempotently on every run.

use resolver_lib::config::ResolverConfig;
use resolver_lib::db::{self, PgPool};
use resolver_lib::errors::ResolverError;
use resolver_lib::models::{
    CustomerProfile, IdentifierType, MergeType, NormalizedIdentifiers, ResolutionAction,
};
use resolver_lib::resolution::ResolutionOrchestrator;
use resolver_lib::services::{merge, profile, review};
use uuid::Uuid;

async fn test_pool() -> Option<PgPool> {
    if std::env::var("RESOLVER_TEST_DB").is_err() {
        eprintln!("RESOLVER_TEST_DB not set; skipping database-backed test");
        return None;
    }
    let pool = db::connect().await.expect("database connection");
    let conn = pool.get().await.expect("pooled connection");
    conn.batch_execute(include_str!("../schema.sql"))
        .await
        .expect("schema apply");
    drop(conn);
    Some(pool)
}

/// Random digit string, so concurrent runs never collide on a phone.
fn unique_digits(len: usize) -> String {
    let mut digits = format!("{:039}", Uuid::new_v4().as_u128());
    digits.truncate(len);
    digits
}

fn unique_email(prefix: &str) -> String {
    format!("{}-{}@example.com", prefix, unique_digits(8))
}

async fn insert_purchase(pool: &PgPool, profile_id: &str, sku: &str, amount: f64) {
    let conn = pool.get().await.expect("pooled connection");
    conn.execute(
        "INSERT INTO customer_events
            (id, profile_id, event_id, event_type, sku, amount, occurred_at)
         VALUES ($1, $2, $3, 'purchase', $4, $5, now())",
        &[
            &Uuid::new_v4().to_string(),
            &profile_id,
            &Uuid::new_v4().to_string(),
            &sku,
            &amount,
        ],
    )
    .await
    .expect("event insert");
}

/// Runs the authoritative metric recompute so the stored row agrees
/// with the inserted events before any merge happens.
async fn sync_metrics(pool: &PgPool, profile_id: &str) {
    let mut conn = pool.get().await.expect("pooled connection");
    let tx = conn.transaction().await.expect("transaction");
    merge::recompute_metrics(&tx, profile_id)
        .await
        .expect("metric recompute");
    tx.commit().await.expect("commit");
}

/// Creates a profile with the given identifiers, one purchase event of
/// `spend`, and event-consistent metrics. Returns the stored row.
async fn make_profile(
    pool: &PgPool,
    identifiers: &NormalizedIdentifiers,
    spend: f64,
) -> CustomerProfile {
    let created = profile::create_profile(pool, identifiers)
        .await
        .expect("profile create");
    let sku = format!("SKU-{}", &created.id[..8]);
    insert_purchase(pool, &created.id, &sku, spend).await;
    sync_metrics(pool, &created.id).await;
    profile::get_profile(pool, &created.id)
        .await
        .expect("profile load")
        .expect("profile exists")
}

fn phone_and_email(name: Option<&str>) -> NormalizedIdentifiers {
    let mut ids = NormalizedIdentifiers::default();
    ids.insert_raw(IdentifierType::Phone, &unique_digits(10));
    ids.insert_raw(IdentifierType::Email, &unique_email("customer"));
    ids.full_name = name.map(|n| n.to_string());
    ids
}

async fn identifier_row_ids(pool: &PgPool, profile_id: &str) -> Vec<String> {
    let conn = pool.get().await.expect("pooled connection");
    conn.query(
        "SELECT id FROM profile_identifiers WHERE profile_id = $1 ORDER BY id",
        &[&profile_id],
    )
    .await
    .expect("identifier query")
    .iter()
    .map(|row| row.get("id"))
    .collect()
}

async fn load(pool: &PgPool, profile_id: &str) -> CustomerProfile {
    profile::get_profile(pool, profile_id)
        .await
        .expect("profile load")
        .expect("profile exists")
}

#[tokio::test]
async fn test_rollback_restores_source_bit_identically() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let src = make_profile(&pool, &phone_and_email(Some("Rollback Source")), 5000.0).await;
    let tgt = make_profile(&pool, &phone_and_email(Some("Merge Target")), 3000.0).await;
    let src_idents = identifier_row_ids(&pool, &src.id).await;
    assert_eq!(src_idents.len(), 2);

    let outcome = merge::merge_profiles(
        &pool,
        &src.id,
        &tgt.id,
        0.9,
        serde_json::json!({}),
        MergeType::Auto,
        "round-trip check",
        "tests",
        None,
    )
    .await
    .expect("merge");

    // Merged state: source emptied of identifiers, target folded.
    let merged_src = load(&pool, &src.id).await;
    assert!(merged_src.is_merged);
    assert_eq!(merged_src.merged_into.as_deref(), Some(tgt.id.as_str()));
    assert!(identifier_row_ids(&pool, &src.id).await.is_empty());
    let merged_tgt = load(&pool, &tgt.id).await;
    assert_eq!(merged_tgt.total_spent, 8000.0);
    assert_eq!(merged_tgt.ltv, 8000.0);
    assert_eq!(merged_tgt.total_orders, 2);

    merge::rollback_merge(&pool, &outcome.merge_log_id, "round-trip check", "tests")
        .await
        .expect("rollback");

    // The source comes back exactly as it was: name, contact, metrics,
    // and the same identifier rows it owned before the merge.
    let restored = load(&pool, &src.id).await;
    assert!(!restored.is_merged);
    assert_eq!(restored.merged_into, None);
    assert_eq!(restored.full_name, src.full_name);
    assert_eq!(restored.first_name, src.first_name);
    assert_eq!(restored.last_name, src.last_name);
    assert_eq!(restored.primary_phone, src.primary_phone);
    assert_eq!(restored.primary_email, src.primary_email);
    assert_eq!(restored.total_orders, src.total_orders);
    assert_eq!(restored.total_spent, src.total_spent);
    assert_eq!(restored.avg_order_value, src.avg_order_value);
    assert_eq!(restored.ltv, src.ltv);
    assert_eq!(identifier_row_ids(&pool, &src.id).await, src_idents);

    let restored_tgt = load(&pool, &tgt.id).await;
    assert_eq!(restored_tgt.total_orders, tgt.total_orders);
    assert_eq!(restored_tgt.total_spent, tgt.total_spent);
    assert_eq!(restored_tgt.ltv, tgt.ltv);
}

#[tokio::test]
async fn test_second_rollback_is_refused_and_changes_nothing() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let src = make_profile(&pool, &phone_and_email(None), 1200.0).await;
    let tgt = make_profile(&pool, &phone_and_email(None), 700.0).await;

    let outcome = merge::merge_profiles(
        &pool,
        &src.id,
        &tgt.id,
        0.85,
        serde_json::json!({}),
        MergeType::Auto,
        "double-rollback check",
        "tests",
        None,
    )
    .await
    .expect("merge");

    merge::rollback_merge(&pool, &outcome.merge_log_id, "first undo", "tests")
        .await
        .expect("first rollback");
    let src_after = load(&pool, &src.id).await;
    let tgt_after = load(&pool, &tgt.id).await;
    let src_idents = identifier_row_ids(&pool, &src.id).await;

    let err = merge::rollback_merge(&pool, &outcome.merge_log_id, "second undo", "tests")
        .await
        .expect_err("second rollback must fail");
    match err.downcast_ref::<ResolverError>() {
        Some(ResolverError::AlreadyRolledBack(id)) => assert_eq!(id, &outcome.merge_log_id),
        other => panic!("expected AlreadyRolledBack, got {:?}", other),
    }

    // The refused attempt touched nothing.
    let src_again = load(&pool, &src.id).await;
    assert_eq!(src_again.updated_at, src_after.updated_at);
    assert_eq!(src_again.total_spent, src_after.total_spent);
    assert!(!src_again.is_merged);
    assert_eq!(identifier_row_ids(&pool, &src.id).await, src_idents);
    let tgt_again = load(&pool, &tgt.id).await;
    assert_eq!(tgt_again.updated_at, tgt_after.updated_at);
    assert_eq!(tgt_again.total_spent, tgt_after.total_spent);
}

#[tokio::test]
async fn test_resolve_is_idempotent_after_merge() {
    let Some(pool) = test_pool().await else {
        return;
    };

    // Two profiles sharing one phone, inserted out-of-band so the
    // resolver sees duplicate exact matches.
    let phone = unique_digits(10);
    let mut shared = NormalizedIdentifiers::default();
    shared.insert_raw(IdentifierType::Phone, &phone);
    let a = make_profile(&pool, &shared, 5000.0).await;
    let b = make_profile(&pool, &shared, 3000.0).await;

    // Lowered auto-merge threshold so the phone signal alone (0.6)
    // qualifies.
    let config = ResolverConfig::with_thresholds(0.5, 0.2).expect("config");
    let orchestrator = ResolutionOrchestrator::new(pool.clone(), config).expect("orchestrator");

    let mut incoming = NormalizedIdentifiers::default();
    incoming.insert_raw(IdentifierType::Phone, &phone);

    let first = orchestrator
        .resolve(&Uuid::new_v4().to_string(), &incoming)
        .await
        .expect("first resolve");
    assert_eq!(first.action, ResolutionAction::Merged);
    let survivor = first.profile_id.clone();
    assert!(survivor == a.id || survivor == b.id);
    assert_eq!(load(&pool, &survivor).await.ltv, 8000.0);

    // Re-resolving the same identifiers now finds exactly one live
    // profile and matches it; no further merge happens.
    let second = orchestrator
        .resolve(&Uuid::new_v4().to_string(), &incoming)
        .await
        .expect("second resolve");
    assert_eq!(second.action, ResolutionAction::Matched);
    assert_eq!(second.profile_id, survivor);
    assert_eq!(second.confidence_score, Some(1.0));

    let conn = pool.get().await.expect("pooled connection");
    let merges: i64 = conn
        .query_one(
            "SELECT COUNT(*) FROM merge_log
             WHERE source_profile_id IN ($1, $2) AND target_profile_id IN ($1, $2)
               AND merge_type = 'auto'",
            &[&a.id, &b.id],
        )
        .await
        .expect("merge_log count")
        .get(0);
    assert_eq!(merges, 1);
}

#[tokio::test]
async fn test_review_approval_marks_entry_with_the_merge() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let src = make_profile(&pool, &phone_and_email(Some("Pat Example")), 900.0).await;
    let tgt = make_profile(&pool, &phone_and_email(Some("Pat Example")), 400.0).await;

    let entry_id = review::queue_for_review(
        &pool,
        &src.id,
        &tgt.id,
        0.6,
        serde_json::json!({}),
        "tests",
    )
    .await
    .expect("queue for review");

    let resolution = review::resolve_review(&pool, &entry_id, review::ReviewDecision::Approve, "tests")
        .await
        .expect("approve");
    assert_eq!(resolution.outcome, "approved");
    let merge_outcome = resolution.merge.expect("approval performs a merge");
    assert_eq!(merge_outcome.target_id, tgt.id);

    // The entry was claimed inside the merge transaction: there is no
    // state where the merge committed but the entry is still pending.
    let conn = pool.get().await.expect("pooled connection");
    let row = conn
        .query_one(
            "SELECT review_outcome FROM merge_log WHERE id = $1",
            &[&entry_id],
        )
        .await
        .expect("entry lookup");
    assert_eq!(
        row.get::<_, Option<String>>("review_outcome").as_deref(),
        Some("approved")
    );
    assert!(load(&pool, &src.id).await.is_merged);

    // A second decision on the same entry is refused.
    let err = review::resolve_review(&pool, &entry_id, review::ReviewDecision::Approve, "tests")
        .await
        .expect_err("second decision must fail");
    assert!(matches!(
        err.downcast_ref::<ResolverError>(),
        Some(ResolverError::Validation(_))
    ));

    // Exactly one manual merge exists for the pair.
    let manual_merges: i64 = conn
        .query_one(
            "SELECT COUNT(*) FROM merge_log
             WHERE source_profile_id = $1 AND target_profile_id = $2
               AND merge_type = 'manual'",
            &[&src.id, &tgt.id],
        )
        .await
        .expect("manual merge count")
        .get(0);
    assert_eq!(manual_merges, 1);
}
