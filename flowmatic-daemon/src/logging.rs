//! Logging initialization for flowmatic-daemon.
//!
//! Events are emitted from two threads: the `flowmatic-input` reader and the
//! processing loop running on a blocking tokio worker. Thread names are
//! included in every record so the two can be told apart.

use anyhow::{Context, Result, bail};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use flowmatic_core::config::GeneralConfig;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `general.log_level`.
///
/// * `"json"` - one JSON object per line, event fields flattened
/// * `"pretty"` - multi-line human-readable output
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let output = format_layer(&config.log_format)?;

    tracing_subscriber::registry()
        .with(output)
        .with(build_filter(&config.log_level))
        .try_init()
        .context("failed to install tracing subscriber")
}

fn format_layer(format: &str) -> Result<Box<dyn Layer<Registry> + Send + Sync>> {
    let base = fmt::layer().with_thread_names(true);
    let layer = match format {
        "json" => base.json().flatten_event(true).boxed(),
        "pretty" => base.pretty().boxed(),
        other => bail!("unknown log format '{other}', expected 'json' or 'pretty'"),
    };
    Ok(layer)
}

/// `RUST_LOG` if set and valid, otherwise `level`.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
