use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
///
/// Log lines go through the indicatif writer so they don't tear the
/// progress bars drawn for the scheduler spans.
pub fn init_logging(level: &str) -> Result<(), TryInitError> {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .with(filter)
        .try_init()
}
