use std::sync::Arc;

use feedsync::prelude::*;
use tokio::runtime::Builder;

/// Ingest hotpath profiling
///
/// Profiles one import of a large feed with duplicates through the full
/// runtime: reconciliation, breaker-guarded store calls, checkpoint writes
/// and event dispatch.
///
/// Run with: cargo run --release --bin hotpath_ingest --features profiling
#[hotpath::main]
fn main() {
    println!("=== Ingest Hotpath Profile ===");
    println!("Workload: 200K records, every 10th a duplicate posting");
    println!();

    let runtime = match Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start runtime: {e}");
            return;
        }
    };

    let result = runtime.block_on(run_ingest(200_000));
    println!("{}", result.message);
    println!();
    println!("Profiling complete. Results above show function-level breakdown.");
}

fn feed(records: usize) -> Vec<String> {
    (0..records)
        .map(|i| {
            let guid = if i % 10 == 9 { format!("JOB-{}", i / 2) } else { format!("job-{i}") };
            format!(r#"{{"guid":"{guid}","published_at":"2024-05-{:02}T09:00:00Z","title":"Role {i}"}}"#, (i % 28) + 1)
        })
        .collect()
}

#[hotpath::measure]
async fn run_ingest(records: usize) -> RunResult {
    let mut config = RuntimeConfig::default();
    config.processor.resources = ResourceConfig {
        memory_ratio: Some(1.0),
        max_wall_secs: Some(24 * 60 * 60),
        ..ResourceConfig::default()
    };

    let source = Arc::new(MemoryFeedSource::from_lines(feed(records)));
    let runtime = Runtime::builder(source).with_config(config).build();
    runtime.drive(false).await
}
