//! Logging configuration for the tuner CLI.
//!
//! Pretty human-readable output by default; set `GTUNE_LOG_FORMAT=json` for
//! JSON logs. The level comes from `--log-level`, overridable with
//! `RUST_LOG`.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("GTUNE_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the logging subsystem with the given default level.
///
/// `RUST_LOG` takes precedence when set. A double-init (e.g. from tests) is
/// ignored.
pub fn init(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match LogFormat::from_env() {
        LogFormat::Pretty => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_file(false)
                        .with_line_number(false),
                )
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_target(true))
                .try_init();
        }
    }
}
