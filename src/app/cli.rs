use std::future::Future;
use std::path::PathBuf;

use tracing::warn;

use super::error::AppError;
use crate::streaming::CancellationFlag;

const USAGE: &str = "Usage: feedsync <feed.jsonl|feed.csv> [--resume] [--config <file>] [--state-dir <dir>] [-v]";

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub feed: PathBuf,
    /// Continue from the stored checkpoint instead of starting over
    pub resume: bool,
    pub config: Option<PathBuf>,
    /// Directory for checkpoint and service state; in-memory when unset
    pub state_dir: Option<PathBuf>,
    /// Number of `-v` flags
    pub verbosity: u8,
}

impl CliArgs {
    /// Parse `std::env::args()`-style arguments, program name first
    pub fn parse(args: Vec<String>) -> Result<Self, AppError> {
        let mut feed = None;
        let mut resume = false;
        let mut config = None;
        let mut state_dir = None;
        let mut verbosity = 0u8;

        let mut iter = args.into_iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--resume" => resume = true,
                "--config" => config = Some(PathBuf::from(Self::value(&mut iter, "--config")?)),
                "--state-dir" => state_dir = Some(PathBuf::from(Self::value(&mut iter, "--state-dir")?)),
                flag if flag.starts_with("-v") && flag[1..].chars().all(|c| c == 'v') => {
                    verbosity = verbosity.saturating_add((flag.len() - 1) as u8);
                }
                flag if flag.starts_with('-') => {
                    return Err(AppError::InvalidArguments(format!("unknown flag {flag}\n{USAGE}")));
                }
                path if feed.is_none() => feed = Some(PathBuf::from(path)),
                extra => {
                    return Err(AppError::InvalidArguments(format!("unexpected argument {extra}\n{USAGE}")));
                }
            }
        }

        let feed = feed.ok_or_else(|| AppError::InvalidArguments(USAGE.to_string()))?;
        Ok(Self {
            feed,
            resume,
            config,
            state_dir,
            verbosity,
        })
    }

    fn value(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, AppError> {
        iter.next()
            .ok_or_else(|| AppError::InvalidArguments(format!("{flag} needs a value\n{USAGE}")))
    }
}

/// Reusable CLI application runner that handles:
/// - Signal handling (SIGINT, SIGTERM, SIGHUP)
/// - Cooperative shutdown through the import's cancellation flag
/// - Exit codes (0 = success, 1 = error, 130 = SIGINT, 143 = SIGTERM)
pub struct CliApp {
    name: String,
    cancel: CancellationFlag,
}

impl CliApp {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cancel: CancellationFlag::new(),
        }
    }

    /// Flag raised when a termination signal arrives
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `main_fn` to completion and exit the process
    ///
    /// A signal does not abort `main_fn`; it raises the cancellation flag and
    /// waits for the import to persist its progress before exiting with the
    /// signal's code.
    pub async fn run<F, Fut>(self, main_fn: F) -> !
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        let main = main_fn();
        tokio::pin!(main);
        let signal = wait_for_signal();
        tokio::pin!(signal);

        let code = tokio::select! {
            result = &mut main => exit_code(&self.name, result),
            signal_code = &mut signal => {
                eprintln!("Interrupted, saving progress...");
                self.cancel.cancel();
                if let Err(e) = main.await {
                    eprintln!("{}: {}", self.name, e);
                }
                signal_code
            }
        };
        std::process::exit(code);
    }
}

fn exit_code(name: &str, result: Result<(), AppError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{name}: {e}");
            1
        }
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP; returns the conventional exit code
async fn wait_for_signal() -> i32 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) => {
                tokio::select! {
                    _ = sigterm.recv() => 143,
                    _ = sigint.recv() => 130,
                    _ = sighup.recv() => 129,
                }
            }
            _ => {
                warn!("Unix signal handlers unavailable; only Ctrl+C is handled");
                ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> i32 {
    match tokio::signal::ctrl_c().await {
        Ok(()) => 130,
        Err(e) => {
            warn!(error = %e, "Ctrl+C handler unavailable; signals are not handled");
            std::future::pending().await
        }
    }
}
