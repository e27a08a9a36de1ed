//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Default directive when `FOLIO_LOG` is unset.
const DEFAULT_FILTER: &str = "folio_sync=info";

/// Install the global subscriber, honoring `FOLIO_LOG` (env-filter
/// syntax). Safe to call more than once; later calls are no-ops.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_env("FOLIO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Quiet subscriber for test binaries: warnings and up only, unless
/// `FOLIO_LOG` asks for more.
pub fn init_test_telemetry() {
    let filter =
        EnvFilter::try_from_env("FOLIO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false).with_test_writer())
        .try_init();
}
