//! Active health monitor.
//!
//! Runs one recurring probe task per registered backend and deregisters a
//! backend from the registry the first time its probe fails.

use crate::backend::BackendTarget;
use crate::error::LbError;
use crate::metrics::MetricsCollector;
use crate::registry::{GroupRegistry, RegistryListener};
use crate::util::ShutdownSignal;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Pause between consecutive probes of one backend.
    pub delay: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
        }
    }
}

struct HealthTask {
    id: u64,
    cancel: ShutdownSignal,
    handle: JoinHandle<()>,
}

impl HealthTask {
    fn cancel(self) {
        self.cancel.shutdown();
        drop(self.handle);
    }
}

/// Schedules health checks for every backend the registry reports.
pub struct HealthMonitor {
    registry: Weak<GroupRegistry>,
    tasks: DashMap<BackendTarget, HealthTask>,
    next_id: AtomicU64,
    delay: Duration,
    metrics: MetricsCollector,
    this: Weak<HealthMonitor>,
}

impl HealthMonitor {
    /// Create a monitor and subscribe it to `registry`.
    pub fn attach(
        registry: &Arc<GroupRegistry>,
        settings: HealthSettings,
        metrics: MetricsCollector,
    ) -> Arc<Self> {
        let monitor = Arc::new_cyclic(|this| Self {
            registry: Arc::downgrade(registry),
            tasks: DashMap::new(),
            next_id: AtomicU64::new(0),
            delay: settings.delay,
            metrics,
            this: this.clone(),
        });
        registry.subscribe(monitor.clone());

        info!(delay_ms = settings.delay.as_millis(), "health monitor attached");
        monitor
    }

    /// Whether a check task is scheduled for `target`.
    pub fn is_tracking(&self, target: &BackendTarget) -> bool {
        self.tasks.contains_key(target)
    }

    pub fn tracked_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every scheduled check.
    pub fn shutdown(&self) {
        let mut cancelled = 0;
        self.tasks.retain(|_, task| {
            task.cancel.shutdown();
            cancelled += 1;
            false
        });
        info!(cancelled, "health monitor shut down");
    }

    fn spawn_task(&self, target: BackendTarget, id: u64, cancel: &ShutdownSignal) -> JoinHandle<()> {
        let monitor = self.this.clone();
        let mut cancelled = cancel.subscribe();
        let delay = self.delay;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                // A probe in flight is allowed to finish
                let healthy = target.is_healthy().await;

                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.metrics.record_health_check(&target, healthy);

                if healthy {
                    debug!(backend = %target, "health check passed");
                    continue;
                }
                if cancelled.is_shutdown() {
                    break;
                }

                monitor.evict(&target, id);
                break;
            }
        })
    }

    /// Remove a failing backend. The task entry goes first, and only if it
    /// still belongs to task `id`.
    fn evict(&self, target: &BackendTarget, id: u64) {
        if self.tasks.remove_if(target, |_, task| task.id == id).is_none() {
            return;
        }

        warn!(backend = %target, "backend failed health check, deregistering");
        self.metrics.record_eviction(target);

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Err(e) = registry.unregister_target(target) {
            warn!(backend = %target, error = %e, "failed to deregister unhealthy backend");
        }
    }
}

impl RegistryListener for HealthMonitor {
    fn on_registered(&self, target: &BackendTarget) -> Result<(), LbError> {
        match self.tasks.entry(target.clone()) {
            Entry::Occupied(_) => Err(LbError::DuplicateHealthCheck(target.clone())),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let cancel = ShutdownSignal::new();
                let handle = self.spawn_task(target.clone(), id, &cancel);
                entry.insert(HealthTask { id, cancel, handle });
                debug!(backend = %target, "health check scheduled");
                Ok(())
            }
        }
    }

    fn on_unregistered(&self, target: &BackendTarget) {
        if let Some((_, task)) = self.tasks.remove(target) {
            task.cancel();
            debug!(backend = %target, "health check cancelled");
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("delay", &self.delay)
            .field("tracked", &self.tasks.len())
            .finish()
    }
}
