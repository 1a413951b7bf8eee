use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset or unparsable. HTTP client internals stay
/// at `warn` so request plumbing does not drown out turn logs.
const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn";

static TRACING_INIT: Once = Once::new();

/// Install the global fmt subscriber on stderr, filtered by `RUST_LOG`
/// (e.g. `RUST_LOG=runtime=debug,info`).
///
/// Logs never go to stdout, which carries the streamed answer. Calls after
/// the first are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_ansi(false)
            .with_env_filter(filter)
            .try_init();
    });
}
