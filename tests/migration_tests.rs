/// Lifecycle tests: records aging hot → warm → cold through the full
/// engine, integrity verification, crash recovery, and cold expiry.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use strata::{
    AgingConfig, Embedder, HashEmbedder, MemoryObjectStore, NoopMetrics, ObjectStore, Record,
    SearchFilter, StorageTier, Strata, StrataConfig, Tier, TierMarker, Vector, WarmRecord,
    fingerprint,
};

fn engine_with_aging(aging: AgingConfig) -> (Strata, Arc<HashEmbedder>) {
    let embedder = Arc::new(HashEmbedder::new(64));
    let engine = Strata::new(
        StrataConfig {
            shard_count: 2,
            aging,
            ..Default::default()
        },
        Arc::new(MemoryObjectStore::new()) as Arc<dyn ObjectStore>,
        embedder.clone() as Arc<dyn Embedder>,
        Arc::new(NoopMetrics),
    );
    (engine, embedder)
}

/// Plant a record directly in the hot tier with a back-dated timestamp.
async fn plant(engine: &Strata, owner: &str, id: &str, content: &str, days_old: i64) {
    let embedding = HashEmbedder::new(64).embed(content).await.unwrap();
    let mut record = Record::new(
        id,
        owner,
        content,
        embedding,
        Utc::now(),
        BTreeMap::new(),
    );
    record.timestamp = Utc::now() - Duration::days(days_old);
    let shard = &engine.shards()[engine.shard_for(owner) as usize];
    shard.hot.insert(record).unwrap();
}

fn holding(engine: &Strata, owner: &str, id: &str) -> Vec<Tier> {
    engine.shards()[engine.shard_for(owner) as usize].tiers_holding(id)
}

#[tokio::test]
async fn test_records_age_through_all_three_tiers() {
    let (engine, embedder) = engine_with_aging(AgingConfig {
        hot_retention: Duration::days(7),
        warm_retention: Duration::days(30),
        ..Default::default()
    });

    plant(&engine, "sys", "young", "deployed the new build this morning", 1).await;
    plant(&engine, "sys", "middle", "renewed the certificates last week", 10).await;
    plant(&engine, "sys", "old", "archived the migration plan ages ago", 45).await;

    let stats = engine.run_aging_pass().await.unwrap();
    assert_eq!(stats.failed, 0);

    assert_eq!(holding(&engine, "sys", "young"), vec![Tier::Hot]);
    assert_eq!(holding(&engine, "sys", "middle"), vec![Tier::Warm]);
    // "old" went hot→warm this pass; a second pass lands it in cold.
    assert_eq!(holding(&engine, "sys", "old"), vec![Tier::Warm]);

    engine.run_aging_pass().await.unwrap();
    assert_eq!(holding(&engine, "sys", "old"), vec![Tier::Cold]);

    // Warm records still answer similarity queries; cold ones don't.
    let query = embedder.embed("renewed the certificates last week").await.unwrap();
    let answer = engine.search(&query, 5, &SearchFilter::default()).await.unwrap();
    assert!(answer.results.iter().any(|h| h.id == "middle" && h.tier == Tier::Warm));
    assert!(answer.results.iter().all(|h| h.id != "old"));
}

#[tokio::test]
async fn test_migration_preserves_identity_and_dedup_keys() {
    let (engine, _) = engine_with_aging(AgingConfig {
        hot_retention: Duration::zero(),
        warm_retention: Duration::zero(),
        ..Default::default()
    });

    let content = "the annual audit closed with no findings";
    plant(&engine, "sys", "r1", content, 1).await;
    let shard = &engine.shards()[engine.shard_for("sys") as usize];
    let original = shard.hot.get("r1").unwrap();

    engine.run_aging_pass().await.unwrap();
    engine.run_aging_pass().await.unwrap();

    let cold = shard.cold.get("r1").unwrap();
    assert_eq!(cold.owner_key, original.owner_key);
    assert_eq!(cold.content_hash, original.content_hash);
    assert_eq!(cold.fingerprint, fingerprint(content));
    assert_eq!(cold.timestamp, original.timestamp);
}

#[tokio::test]
async fn test_integrity_failure_leaves_source_authoritative() {
    let (engine, _) = engine_with_aging(AgingConfig {
        hot_retention: Duration::zero(),
        ..Default::default()
    });

    plant(&engine, "sys", "suspect", "this copy will fail verification", 1).await;
    engine.aging().corrupt_next.insert("suspect".to_string());

    let stats = engine.run_aging_pass().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(holding(&engine, "sys", "suspect"), vec![Tier::Hot]);

    // Next pass succeeds and the record moves normally.
    let stats = engine.run_aging_pass().await.unwrap();
    assert_eq!(stats.moved, 1);
    assert_eq!(holding(&engine, "sys", "suspect"), vec![Tier::Warm]);
}

#[tokio::test]
async fn test_startup_recovery_settles_interrupted_migrations() {
    let (engine, _) = engine_with_aging(AgingConfig::default());
    plant(&engine, "sys", "r1", "interrupted mid-flight", 10).await;

    // Fake a crash between target write and source delete.
    let shard = &engine.shards()[engine.shard_for("sys") as usize];
    let source = shard.hot.get("r1").unwrap();
    shard.warm.insert(WarmRecord::from_hot(&source)).unwrap();
    shard.set_marker(
        "r1".to_string(),
        TierMarker::Migrating {
            from: Tier::Hot,
            to: Tier::Warm,
        },
    );
    assert_eq!(shard.health().migrating, 1);

    let settled = engine.recover().await.unwrap();
    assert_eq!(settled, 1);
    assert_eq!(shard.health().migrating, 0);
    // At no point is the record lost.
    assert_eq!(holding(&engine, "sys", "r1").len(), 1);
}

#[tokio::test]
async fn test_expire_cold_drops_only_expired_records() {
    let (engine, _) = engine_with_aging(AgingConfig {
        hot_retention: Duration::zero(),
        warm_retention: Duration::zero(),
        ..Default::default()
    });

    plant(&engine, "sys", "keep", "retained within the retention window", 100).await;
    plant(&engine, "sys", "drop", "far beyond every retention policy", 500).await;
    engine.run_aging_pass().await.unwrap();
    engine.run_aging_pass().await.unwrap();
    assert_eq!(holding(&engine, "sys", "keep"), vec![Tier::Cold]);
    assert_eq!(holding(&engine, "sys", "drop"), vec![Tier::Cold]);

    let expired = engine.expire_cold(Utc::now() - Duration::days(365));
    assert_eq!(expired, 1);
    assert_eq!(holding(&engine, "sys", "keep"), vec![Tier::Cold]);
    assert!(holding(&engine, "sys", "drop").is_empty());
}

#[tokio::test]
async fn test_quantized_warm_search_still_finds_the_right_record() {
    let (engine, embedder) = engine_with_aging(AgingConfig {
        hot_retention: Duration::zero(),
        ..Default::default()
    });

    plant(&engine, "sys", "a", "kubernetes upgrade notes for the platform team", 1).await;
    plant(&engine, "sys", "b", "recipe collection for the office potluck", 1).await;
    engine.run_aging_pass().await.unwrap();

    let query = embedder
        .embed("kubernetes upgrade notes for the platform team")
        .await
        .unwrap();
    let answer = engine.search(&query, 2, &SearchFilter::default()).await.unwrap();

    assert_eq!(answer.results[0].id, "a");
    assert_eq!(answer.results[0].tier, Tier::Warm);
    // Quantization is lossy, so the self-match is close to but not
    // necessarily exactly 1.0.
    assert!(answer.results[0].score > 0.9);
}

#[tokio::test]
async fn test_empty_engine_aging_pass_is_a_noop() {
    let (engine, _) = engine_with_aging(AgingConfig::default());
    let stats = engine.run_aging_pass().await.unwrap();
    assert_eq!(stats.moved, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.bytes, 0);
}

#[tokio::test]
async fn test_zero_vector_records_migrate_cleanly() {
    // Whitespace-only tokens produce a zero embedding; migration must not
    // choke on a zero norm.
    let (engine, _) = engine_with_aging(AgingConfig {
        hot_retention: Duration::zero(),
        ..Default::default()
    });

    let shard_owner = "sys";
    let mut record = Record::new(
        "zv",
        shard_owner,
        "x",
        Vector::new(vec![0.0, 0.0, 0.0]),
        Utc::now(),
        BTreeMap::new(),
    );
    record.timestamp = Utc::now() - Duration::days(2);
    let shard = &engine.shards()[engine.shard_for(shard_owner) as usize];
    shard.hot.insert(record).unwrap();

    let stats = engine.run_aging_pass().await.unwrap();
    assert_eq!(stats.moved, 1);
    assert_eq!(holding(&engine, shard_owner, "zv"), vec![Tier::Warm]);
}
