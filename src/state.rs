//! Shared application state.

use crate::config::Config;
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::registry::GroupRegistry;
use crate::util::ShutdownSignal;
use std::sync::Arc;
use tracing::info;

/// Long-lived components shared by the control server, metrics server and
/// the health monitor.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<GroupRegistry>,
    monitor: Arc<HealthMonitor>,
    metrics: MetricsCollector,
    shutdown: ShutdownSignal,
}

impl AppState {
    /// Create the registry and attach a health monitor to it.
    pub fn new(config: &Config) -> Self {
        let metrics = MetricsCollector::new();
        let registry = GroupRegistry::new(config.registry_settings(), metrics.clone());
        let monitor = HealthMonitor::attach(&registry, config.health_settings(), metrics.clone());

        Self {
            registry,
            monitor,
            metrics,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Get the shutdown signal.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Signal servers to stop, cancel health checks and stop every group.
    pub fn trigger_shutdown(&self) {
        self.shutdown.shutdown();
        self.monitor.shutdown();
        self.registry.shutdown();
        info!("application state shut down");
    }
}
