use feedsync::prelude::*;

/// JSON-lines feed of `records` postings where every `dup_every`-th record
/// repeats an earlier posting (same guid and day, different casing)
pub fn generate_feed(records: usize, dup_every: usize) -> Vec<String> {
    (0..records)
        .map(|i| {
            let guid = if dup_every > 0 && i % dup_every == dup_every - 1 {
                format!("POSTING-{}", i / 2)
            } else {
                format!("posting-{i}")
            };
            serde_json::json!({
                "guid": guid,
                "published_at": format!("2024-05-{:02}T09:00:00Z", (i % 28) + 1),
                "source": "bench",
                "title": format!("Role {i}"),
                "city": "Lisbon",
            })
            .to_string()
        })
        .collect()
}

/// Processor config with resource checks that never pause a benchmark run
pub fn bench_config(batch_size: usize) -> ProcessorConfig {
    ProcessorConfig {
        batch_size,
        resources: ResourceConfig {
            memory_ratio: Some(1.0),
            max_wall_secs: Some(24 * 60 * 60),
            ..ResourceConfig::default()
        },
        ..ProcessorConfig::default()
    }
}
