use std::sync::Arc;

use feedsync::app::raise_level;
use feedsync::prelude::*;
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() {
    let args = match CliArgs::parse(std::env::args().collect()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let config = match EngineConfig::load(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("feedsync: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config, args.verbosity);

    let state: Arc<dyn CheckpointStore> = match &args.state_dir {
        Some(dir) => match FileCheckpointStore::open(dir).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("feedsync: {e}");
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryCheckpointStore::new()),
    };
    let cancel = CancellationFlag::new().with_store(Arc::clone(&state));

    CliApp::new("feedsync")
        .with_cancellation(cancel.clone())
        .run(|| run_import(args, config, state, cancel))
        .await
}

fn init_tracing(config: &EngineConfig, verbosity: u8) {
    let base = config.level().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(raise_level(base, verbosity))
        .with_writer(std::io::stderr)
        .init();
}

/// Drive one feed to completion and print the run summary as JSON
async fn run_import(
    args: CliArgs,
    config: EngineConfig,
    state: Arc<dyn CheckpointStore>,
    cancel: CancellationFlag,
) -> Result<(), AppError> {
    if !tokio::fs::try_exists(&args.feed).await? {
        return Err(AppError::FileNotFound(args.feed.display().to_string()));
    }
    let is_csv = args
        .feed
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let source: Arc<dyn FeedSource> = if is_csv {
        Arc::new(CsvFeedSource::new(&args.feed))
    } else {
        Arc::new(JsonlFeedSource::new(&args.feed))
    };

    // A stop request left over from an earlier invocation must not end this one
    cancel.reset().await;

    let runtime = Runtime::builder(source)
        .with_state_store(state)
        .with_cancellation(cancel)
        .with_config(config.runtime)
        .build();
    runtime.start().await;

    let result = runtime.drive(args.resume).await;

    let mut stdout = tokio::io::BufWriter::new(tokio::io::stdout());
    let summary = serde_json::to_vec_pretty(&result)?;
    stdout.write_all(&summary).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    if result.complete && result.success {
        Ok(())
    } else {
        Err(AppError::Incomplete(result.message))
    }
}
