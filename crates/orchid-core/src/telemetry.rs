//! Centralised tracing initialisation for Orchid binaries.
//!
//! Call [`init_tracing`] once at program start. `RUST_LOG` takes precedence
//! when set; otherwise the orchid crates log at the requested level and
//! everything else is capped at `warn`. Subsequent calls are silently
//! ignored (the global subscriber can only be installed once per process).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default directives when `RUST_LOG` is absent: orchid targets at `level`,
/// dependencies quieted to `warn`.
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    format!("warn,orchid={level},orchid_core={level},orchid_state={level}")
}

/// Install the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines instead of the human
///   format.
/// * `level`: verbosity for the orchid crates when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_target(false))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .ok();
    }
}
