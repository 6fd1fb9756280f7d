//! Prometheus scrape endpoint.
//!
//! The exporter's built-in HTTP listener serves every metric recorded by the
//! engine (`engine_*`) and the daemon itself (`daemon_*`).

use std::net::SocketAddr;

use anyhow::{Context, Result};
use flowmatic_core::config::MetricsConfig;
use flowmatic_core::metrics as m;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Install the global metrics recorder and start the HTTP listener.
///
/// Only one recorder can exist per process; a second call fails.
/// The frame processing histogram uses [`m::FRAME_DURATION_BUCKETS`].
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr = listen_addr(config)?;
    if addr.ip().is_unspecified() {
        tracing::warn!(listen_addr = %addr, "metrics endpoint listens on all interfaces");
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(m::ENGINE_FRAME_PROCESSING_DURATION_SECONDS.to_owned()),
            m::FRAME_DURATION_BUCKETS,
        )
        .context("invalid frame duration buckets")?
        .install()
        .context("failed to install metrics recorder")?;

    m::describe_all();
    tracing::info!(listen_addr = %addr, "metrics endpoint active");
    Ok(())
}

fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    format!("{}:{}", config.listen_addr, config.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid metrics listen address '{}:{}'",
                config.listen_addr, config.port
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_joins_host_and_port() {
        let config = MetricsConfig::default();
        let addr = listen_addr(&config).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9105");
    }

    #[test]
    fn listen_addr_rejects_hostnames() {
        let config = MetricsConfig {
            listen_addr: "metrics.local".to_owned(),
            ..MetricsConfig::default()
        };
        let err = listen_addr(&config).unwrap_err();
        assert!(err.to_string().contains("metrics.local:9105"));
    }
}
