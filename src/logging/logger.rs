// file: src/logging/logger.rs
// version: 2.0.0
// guid: j0k1l2m3-n4o5-6789-0123-456789jklmno

//! Logger initialization and pipeline stage spans
//!
//! Log lines go to stderr so that `list-builds --json` and upload reports
//! on stdout stay machine readable.

use crate::error::CloudImagesError;
use crate::Result;
use tracing::Instrument;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HTTP stack crates, kept at `warn` unless `RUST_LOG` says otherwise
const NOISY_CRATES: [&str; 3] = ["hyper", "reqwest", "h2"];

/// Filter directives for the given verbosity
pub fn filter_directives(verbose: bool, quiet: bool) -> String {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, true) => "debug",
        (false, false) => "info",
    };
    std::iter::once(level.to_string())
        .chain(NOISY_CRATES.iter().map(|name| format!("{}=warn", name)))
        .collect::<Vec<_>>()
        .join(",")
}

fn install_error(e: impl std::fmt::Display) -> CloudImagesError {
    CloudImagesError::config(format!("Failed to initialize logger: {}", e))
}

/// Install the compact human-readable subscriber
pub fn init_logger(verbose: bool, quiet: bool) -> Result<()> {
    let filter = EnvFilter::try_new(filter_directives(verbose, quiet)).map_err(install_error)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .map_err(install_error)
}

/// Install a JSON subscriber filtered by `RUST_LOG`, for CI runs
pub fn init_json_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(false, false)))
        .map_err(install_error)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init()
        .map_err(install_error)
}

/// Run a synchronous step inside an `operation` span
pub fn with_operation_span<F, R>(operation: &str, f: F) -> R
where
    F: FnOnce() -> R,
{
    let span = tracing::info_span!("operation", name = operation);
    let _enter = span.enter();
    f()
}

/// Run a pipeline stage inside an `operation` span
pub async fn with_async_operation_span<F, Fut, R>(operation: &str, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let span = tracing::info_span!("operation", name = operation);
    f().instrument(span).await
}
