//! Log output for the `linkchain` binary and for hosts embedding a chain.
//!
//! `RUST_LOG` wins when it is set and parses. Otherwise the level passed in
//! is used, which the CLI derives from `-v`. With `--json` every chain and
//! link event in [`crate::obs`] is written as one JSON object per line, so
//! a run can be piped into a log collector and filtered on `event`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the process-wide log subscriber.
///
/// Hosts that already installed their own subscriber keep it; the call then
/// only notes that at debug level.
pub fn init_tracing(json: bool, level: Level) {
    let registry = tracing_subscriber::registry().with(filter_for(level));
    let events = fmt::layer().with_target(false);

    let installed = if json {
        registry.with(events.json()).try_init()
    } else {
        registry.with(events.compact()).try_init()
    };

    if installed.is_err() {
        tracing::debug!("log subscriber already installed, keeping it");
    }
}
