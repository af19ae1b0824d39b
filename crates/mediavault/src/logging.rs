//! Process-wide logging setup.
//!
//! Library code emits through `tracing` (and `log` in the database layer,
//! bridged by `tracing-log`). Binaries call [`init_logging`] once at startup.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "compact" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns false when a
/// subscriber was already installed by an earlier call.
pub fn init_logging(default_filter: &str, format: LogFormat) -> bool {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }

    // Route `log` records (rusqlite layer, dependencies) into tracing.
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_target(true).compact()),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(false)),
        ),
    };

    if let Err(e) = installed {
        eprintln!("Logging already initialized elsewhere: {}", e);
        return false;
    }

    tracing::debug!(filter = default_filter, ?format, "Logging initialized");
    true
}
