/*!
Observability infrastructure for modvault.

This module provides:
- Structured logging setup (`tracing` + `tracing-subscriber`)
- Optional Prometheus counters for lifecycle operations (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::{Result, VaultError};

/// Default filter directive when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVE: &str = "modvault=info";

/// Lifecycle operations that are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Uninstall,
    Backup,
    Restore,
    SoundpackInstall,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Uninstall => "uninstall",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::SoundpackInstall => "soundpack_install",
        }
    }
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<VaultMetrics>> = OnceLock::new();

/// Metrics collection for modvault operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct VaultMetrics {
    pub installs_total: Counter,
    pub uninstalls_total: Counter,
    pub backups_total: Counter,
    pub restores_total: Counter,
    pub soundpack_installs_total: Counter,
    pub failures_total: Counter,
    pub bytes_copied: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl VaultMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help)
                .map_err(|e| VaultError::config(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| VaultError::config(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };

        let installs_total = counter("modvault_installs_total", "Packages installed or reinstalled")?;
        let uninstalls_total = counter("modvault_uninstalls_total", "Packages uninstalled")?;
        let backups_total = counter("modvault_backups_total", "Save snapshots created")?;
        let restores_total = counter("modvault_restores_total", "Save snapshots restored")?;
        let soundpack_installs_total =
            counter("modvault_soundpack_installs_total", "Soundpacks installed")?;
        let failures_total = counter("modvault_failures_total", "Failed lifecycle operations")?;

        let bytes_copied = Histogram::with_opts(prometheus::HistogramOpts::new(
            "modvault_bytes_copied",
            "Bytes written per archive or copy operation",
        ))
        .map_err(|e| VaultError::config(format!("Failed to create bytes_copied metric: {e}")))?;
        registry
            .register(Box::new(bytes_copied.clone()))
            .map_err(|e| VaultError::config(format!("Failed to register bytes_copied: {e}")))?;

        Ok(Self {
            installs_total,
            uninstalls_total,
            backups_total,
            restores_total,
            soundpack_installs_total,
            failures_total,
            bytes_copied,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// Returns `None` if the registry could not be built.
    pub fn global() -> Option<&'static VaultMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record(&self, operation: Operation, ok: bool) {
        if !ok {
            self.failures_total.inc();
            return;
        }
        match operation {
            Operation::Install => self.installs_total.inc(),
            Operation::Uninstall => self.uninstalls_total.inc(),
            Operation::Backup => self.backups_total.inc(),
            Operation::Restore => self.restores_total.inc(),
            Operation::SoundpackInstall => self.soundpack_installs_total.inc(),
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| VaultError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| VaultError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Count a finished operation; a no-op without the `metrics` feature
pub(crate) fn record_operation(operation: Operation, ok: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = VaultMetrics::global() {
        metrics.record(operation, ok);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, ok);
}

/// Record bytes moved by an archive or copy operation
pub(crate) fn record_bytes(bytes: u64) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = VaultMetrics::global() {
        metrics.bytes_copied.observe(bytes as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

/// Initialize the global tracing subscriber
///
/// # Arguments
/// * `json` - Emit JSON lines instead of human-readable output
///
/// # Returns
/// Error if a global subscriber is already installed
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    VaultMetrics::global();

    let directive = DEFAULT_DIRECTIVE
        .parse()
        .map_err(|e| VaultError::config(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            ),
        )
    } else {
        set_global_default(registry.with(fmt::layer().with_target(false)))
    };
    installed.map_err(|e| {
        VaultError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("modvault observability initialized");
    Ok(())
}
