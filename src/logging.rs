//! Structured logging setup (SPEC_FULL.md §4.8).

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` subscriber. `debug` raises this
/// crate's own target to `DEBUG`; everything else stays at `INFO`. The
/// writer is stdout regardless of mode: daemonising only redirects stdout
/// to `/dev/null` after this subscriber is already installed and writing to
/// the original foreground terminal, so `--debug` output is visible there
/// for as long as the process stays in the foreground.
pub fn init(debug: bool) {
    let default_directive = if debug { "boosterd=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .init();
}
