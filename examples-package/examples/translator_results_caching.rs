//! Translator Results Caching Example
//!
//! Runs the same query against a slow source ten times. The source supplies
//! its own directive (VDB scope, memory preferred, read all, two minute TTL,
//! updatable), so only the first run reaches it.
//!
//! Set `RUST_LOG=query_cache=debug` to watch the cache at work.

use anyhow::Result;
use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use query_cache::{
    CacheConfig, CacheDirective, InvalidationEvent, QueryCache, Scope, SourceCapabilities,
    SourceExecutor,
};
use query_core::{count_rows, stream_from_batches, Command, ExecutionContext, RowStream, VdbId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for a slow relational source holding PERFTESTVIEW
struct PerfTestSource {
    executions: AtomicUsize,
    rows: usize,
}

impl PerfTestSource {
    fn new(rows: usize) -> Self {
        Self {
            executions: AtomicUsize::new(0),
            rows,
        }
    }

    fn batch(&self) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        let ids: Vec<i64> = (0..self.rows as i64).collect();
        let labels: Vec<String> = ids.iter().map(|id| format!("row-{}", id)).collect();

        Ok(RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(labels)),
            ],
        )?)
    }
}

impl SourceExecutor for PerfTestSource {
    fn execute(&self, _command: &Command, _ctx: &ExecutionContext) -> query_core::Result<RowStream> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(500));
        let batch = self
            .batch()
            .map_err(|err| query_core::QueryError::source_error("h2", err.to_string()))?;
        Ok(stream_from_batches(vec![batch]))
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::new("h2").with_directive(
            CacheDirective::new(Scope::Vdb)
                .with_prefer_memory(true)
                .with_read_all(true)
                .with_ttl_millis(120_000)
                .with_updatable(true),
        )
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "query_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    init_logging();

    println!("=== Translator Results Caching Example ===\n");

    let cache = QueryCache::new(CacheConfig::default())?;
    let source = PerfTestSource::new(10_000);
    let vdb = VdbId::new("ResultsCachingH2VDB", "1");
    let ctx = ExecutionContext::new(vdb.clone()).with_session("demo-session");
    let command = Command::query("SELECT * FROM PERFTESTVIEW")
        .with_source("h2")
        .with_tables(["PERFTESTVIEW"]);

    println!("Execute '{}' 10 times\n", command.sql);
    for run in 1..=10 {
        let started = Instant::now();
        let results = cache.execute(&command, &ctx, &source)?;
        let origin = results.origin();
        let rows = count_rows(&results.collect_batches()?);
        println!(
            "\t{}. Query Time: {:?} ({} rows, {:?})",
            run,
            started.elapsed(),
            rows,
            origin
        );
    }

    println!("\nSource executions: {}", source.executions.load(Ordering::SeqCst));

    let stats = cache.stats();
    println!("\nCache Statistics:");
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);
    println!("  Hit Rate: {:.2}%", stats.hit_rate * 100.0);
    println!("  Memory Used: {} bytes", cache.memory_used());

    let removed = cache.apply(&InvalidationEvent::vdb_undeployed(vdb));
    println!("\nUndeployed the VDB, {} entries invalidated", removed);

    Ok(())
}
