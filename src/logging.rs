//! Logging setup for the command line tool.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` for this crate
/// with `verbose`. Output goes to stderr so command summaries on stdout
/// stay clean.
pub fn init(verbose: bool) {
    let default = if verbose { "info,rpm_forge=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .without_time()
        .try_init();
}
