//! Daemon orchestration -- engine assembly, input processing, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `flowmatic-daemon`.
//! It validates configuration, builds the engine, loads the rule set and
//! runs the input thread with its processing loop until the input ends or
//! a shutdown signal arrives.
//!
//! # Signals
//!
//! - `SIGTERM`, `SIGINT`: stop reading, drain the ring and shut down
//! - `SIGHUP`: forwarded to every target (reopen files and similar)

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use flowmatic_core::config::FlowmaticConfig;
use flowmatic_engine::{Engine, EngineConfig, Input, PcapFileInput, RuleLoader, RunReport, Runner};

use crate::health::{self, DaemonHealth};
use crate::metrics_server;

/// Seconds between health checks while running.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Seconds between uptime metric updates.
const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: FlowmaticConfig,
    engine: Arc<Engine>,
    /// Cancelled on shutdown; shared by the runner and every background task.
    cancel: CancellationToken,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded, or if
    /// [`Orchestrator::build_from_config`] fails.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = FlowmaticConfig::load(config_path)
            .await
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// This performs the following steps:
    /// 1. Validate the configuration
    /// 2. Install the metrics recorder (if enabled)
    /// 3. Create the engine with the built-in protocols, helpers and targets
    /// 4. Load every rule file in `engine.rules_dir`
    ///
    /// Rules that fail to parse are logged and skipped. A missing or
    /// unreadable rules directory is an error.
    pub async fn build_from_config(config: FlowmaticConfig) -> Result<Self> {
        config.validate().context("config validation failed")?;

        // Install metrics recorder before the engine records anything
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        let engine_config = EngineConfig::from_core(&config);
        let engine = Arc::new(Engine::new(engine_config).context("failed to build engine")?);

        let rules_dir = Path::new(&config.engine.rules_dir);
        let definitions = RuleLoader::load_directory(rules_dir)
            .await
            .with_context(|| format!("failed to load rules from {}", rules_dir.display()))?;
        let loaded = engine.add_rules(&definitions);
        if loaded < definitions.len() {
            tracing::warn!(
                loaded,
                rejected = definitions.len() - loaded,
                "some rules were rejected"
            );
        }

        tracing::info!(
            rules = loaded,
            protocols = engine.list_protocols().len(),
            helpers = ?engine.helper_names(),
            "orchestrator initialized"
        );

        if config.metrics.enabled {
            record_daemon_metrics(loaded);
        }

        Ok(Self {
            config,
            engine,
            cancel: CancellationToken::new(),
            start_time: Instant::now(),
        })
    }

    /// Run until the input ends or a shutdown signal is received.
    ///
    /// Installs the signal handlers, then delegates to [`Orchestrator::serve`].
    pub async fn run(&self) -> Result<RunReport> {
        let signals = spawn_signal_handler(Arc::clone(&self.engine), self.cancel.clone())?;
        let result = self.serve().await;
        signals.abort();
        result
    }

    /// Process the configured input until EOF or cancellation.
    ///
    /// The blocking [`Runner`] is moved onto tokio's blocking pool. On
    /// return every target has been closed, all connections have been
    /// destroyed and the PID file (if any) has been removed.
    pub async fn serve(&self) -> Result<RunReport> {
        let input = self.open_input()?;

        let pid_file = self.pid_file();
        if let Some(path) = pid_file {
            write_pid_file(path)?;
        }

        let health_task = health::spawn_health_check_task(
            Arc::clone(&self.engine),
            HEALTH_CHECK_INTERVAL,
            self.cancel.child_token(),
        );
        let uptime_task = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, self.cancel.child_token()));

        tracing::info!(input = %self.config.input.path, "processing input");
        let runner = Runner::with_cancel(Arc::clone(&self.engine), self.cancel.clone());
        let result = tokio::task::spawn_blocking(move || runner.run(input)).await;

        // Input finished or was cancelled; stop the background tasks either way
        self.cancel.cancel();
        let _ = health_task.await;
        if let Some(task) = uptime_task {
            let _ = task.await;
        }

        self.shutdown();
        if let Some(path) = pid_file {
            remove_pid_file(path);
        }

        let report = result
            .context("input task panicked")?
            .context("input processing failed")?;
        tracing::info!(
            frames_read = report.frames_read,
            ring_dropped = report.ring_dropped,
            cancelled = report.cancelled,
            frames_processed = report.stats.frames_processed,
            frames_dropped = report.stats.frames_dropped,
            "input processing finished"
        );
        Ok(report)
    }

    fn open_input(&self) -> Result<Box<dyn Input>> {
        let input = &self.config.input;
        if input.path.is_empty() {
            return Err(anyhow::anyhow!(
                "input.path is not set; configure a capture file or pass --input"
            ));
        }
        Ok(Box::new(
            PcapFileInput::new(&input.path, input.snaplen).live(input.live),
        ))
    }

    fn pid_file(&self) -> Option<&Path> {
        let path = self.config.general.pid_file.as_str();
        (!path.is_empty()).then(|| Path::new(path))
    }

    /// Close every target and destroy remaining connections.
    fn shutdown(&self) {
        tracing::info!("shutting down engine");
        self.engine.shutdown();
    }

    /// Get the current aggregated health status.
    pub fn health(&self) -> DaemonHealth {
        let uptime_secs = self.start_time.elapsed().as_secs();
        if self.config.metrics.enabled {
            use flowmatic_core::metrics as m;
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }
        health::check_engine(&self.engine, uptime_secs)
    }

    /// Token that stops [`Orchestrator::serve`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &FlowmaticConfig {
        &self.config
    }
}

/// Spawn the task that maps process signals onto the engine.
///
/// SIGTERM and SIGINT cancel `cancel`; SIGHUP calls [`Engine::sighup`].
/// The task ends after the first shutdown signal or when `cancel` fires.
///
/// # Errors
///
/// Returns an error if signal handlers cannot be installed.
fn spawn_signal_handler(
    engine: Arc<Engine>,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow::anyhow!("failed to install SIGHUP handler: {}", e))?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = sighup.recv() => {
                    let failed = engine.sighup();
                    tracing::info!(failed_targets = failed, "SIGHUP forwarded to targets");
                    continue;
                }
                _ = cancel.cancelled() => break,
            };
            tracing::info!(signal = name, "shutdown signal received");
            cancel.cancel();
            break;
        }
    }))
}

/// Write the current process PID to a file.
///
/// Used to prevent duplicate daemon instances.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create file (prevents TOCTOU races)
/// - Verifies the created file is a regular file (prevents symlink attacks)
/// - Creates parent directory with restrictive permissions (0o700)
///
/// # Errors
///
/// Returns an error if the PID file already exists or cannot be written.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file (possible symlink attack)",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{pid}")?;

    tracing::info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on daemon shutdown.
///
/// Logs a warning but does not fail if the file cannot be removed.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove PID file"
        );
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

/// Record daemon-level metrics (build info, rules loaded).
fn record_daemon_metrics(rules_loaded: usize) {
    use flowmatic_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::DAEMON_RULES_LOADED).set(rules_loaded as f64);

    tracing::debug!(
        rules_loaded,
        version = env!("CARGO_PKG_VERSION"),
        "daemon metrics recorded"
    );
}

/// Spawn a background task that periodically updates the uptime metric.
fn spawn_uptime_updater(
    start_time: Instant,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    use flowmatic_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let uptime_secs = start_time.elapsed().as_secs();
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uptime_updater_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = spawn_uptime_updater(Instant::now(), cancel.clone());

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), task).await;
        assert!(result.is_ok(), "uptime updater should stop after cancel");
    }

    #[tokio::test]
    async fn signal_handler_exits_when_cancelled() {
        let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
        let cancel = CancellationToken::new();
        let task = spawn_signal_handler(engine, cancel.clone()).unwrap();

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), task).await;
        assert!(result.is_ok(), "signal handler should stop after cancel");
    }
}
