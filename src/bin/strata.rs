//! Strata command line tool.
//!
//! Operational helpers plus a self-contained demo of the full pipeline
//! against an in-memory object store:
//!
//!   strata demo [--records N] [--shards S] [--query TEXT]
//!   strata route <owner-key> [--shards S]
//!   strata keys <text>

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use strata::{
    AgingConfig, Embedder, HashEmbedder, MemoryObjectStore, NoopMetrics, ObjectStore,
    SearchFilter, ShardRouter, Strata, StrataConfig, content_hash, fingerprint,
};

#[derive(Parser)]
#[command(name = "strata", version, about = "Tiered memory storage engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline against an in-memory object store
    Demo {
        /// Uploads to seed
        #[arg(long, default_value_t = 100)]
        records: usize,
        /// Shard count
        #[arg(long, default_value_t = 4)]
        shards: u32,
        /// Similarity query to run after ingestion
        #[arg(long, default_value = "shipment delayed by weather")]
        query: String,
    },
    /// Show which shard an owner key routes to
    Route {
        /// Owner key to route
        owner_key: String,
        /// Shard count
        #[arg(long, default_value_t = 4)]
        shards: u32,
    },
    /// Print the dedup keys derived from a piece of content
    Keys {
        /// Content to hash
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            records,
            shards,
            query,
        } => demo(records, shards, &query).await,
        Command::Route { owner_key, shards } => {
            let router = ShardRouter::new(shards);
            println!("{owner_key} -> shard {}", router.shard_for(&owner_key));
            Ok(())
        }
        Command::Keys { text } => {
            println!("content_hash: {}", content_hash(&text));
            println!("fingerprint:  {:016x}", fingerprint(&text));
            Ok(())
        }
    }
}

async fn demo(records: usize, shards: u32, query: &str) -> Result<()> {
    let object_store = Arc::new(MemoryObjectStore::new());
    let embedder = Arc::new(HashEmbedder::new(128));

    // Aggressive retention so the demo actually migrates something.
    let config = StrataConfig {
        shard_count: shards,
        aging: AgingConfig {
            hot_retention: chrono::Duration::zero(),
            warm_retention: chrono::Duration::days(30),
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Strata::new(
        config,
        object_store.clone() as Arc<dyn ObjectStore>,
        embedder.clone(),
        Arc::new(NoopMetrics),
    );

    let subjects = [
        "shipment delayed by weather at the port",
        "invoice reconciled against the purchase order",
        "sensor reported a temperature spike overnight",
        "maintenance window scheduled for the weekend",
    ];
    for i in 0..records {
        let owner = format!("system-{}", i % 7);
        let manifest = serde_json::json!({
            "content": format!("{} (event {i})", subjects[i % subjects.len()]),
            "metadata": { "batch": "demo" },
        });
        object_store
            .upload(
                "memory",
                &format!("uploads/{owner}/demo-{i:05}"),
                serde_json::to_vec(&manifest)?,
            )
            .await?;
    }

    let started = std::time::Instant::now();
    let report = engine.ingest_pending().await?;
    println!(
        "ingested {} stored / {} duplicate / {} rejected in {:?}",
        report.stored,
        report.duplicates,
        report.rejected,
        started.elapsed()
    );

    let stats = engine.run_aging_pass().await?;
    println!(
        "aging pass moved {} records ({} bytes) with {} failures",
        stats.moved, stats.bytes, stats.failed
    );

    let vector = embedder.embed(query).await?;
    let answer = engine.search(&vector, 5, &SearchFilter::default()).await?;
    println!("top hits for {query:?}:");
    for hit in &answer.results {
        println!("  {:8.4}  {}  [{}]", hit.score, hit.id, hit.tier);
    }
    if !answer.degraded_shards.is_empty() {
        println!("degraded shards: {:?}", answer.degraded_shards);
    }

    for health in engine.shard_health() {
        println!(
            "shard {}: hot={} warm={} cold={} migrating={}",
            health.shard, health.hot, health.warm, health.cold, health.migrating
        );
    }

    let expired = engine.expire_cold(Utc::now() - chrono::Duration::days(365));
    if expired > 0 {
        println!("expired {expired} cold records");
    }
    engine.shutdown().await;
    Ok(())
}
