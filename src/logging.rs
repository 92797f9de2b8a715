//! Tracing setup for the `cellrig` binary.
//!
//! Human-readable logs go to stderr, filtered by `RUST_LOG` (default `info`,
//! `debug` with `--verbose`). When the rig has a `.rig/logs` directory a
//! daily-rolling JSON-lines file is written there as well. Nothing is ever
//! written to stdout: hook subcommands reply on stdout.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "cellrig.log";

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so the file writer flushes.
///
/// `quiet` lowers the stderr default to `warn`, for commands whose output is
/// read by another program.
pub fn init(log_dir: Option<&Path>, verbose: bool, quiet: bool) -> Option<WorkerGuard> {
    let stderr_filter = if quiet && !verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    } else {
        filter(verbose)
    };
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_filter);

    let (file, guard) = match log_dir.filter(|d| d.is_dir()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter(verbose));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init();
    guard
}
