//! Metrics collector using prometheus-client.
//!
//! Provides metrics for forward units, group membership, health checks and
//! control requests.

use crate::backend::{BackendTarget, ForwardInfo};
use crate::proxy::{ForwardError, ProxyResult};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels identifying one forwarding group.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GroupLabels {
    pub protocol: String,
    pub port: String,
}

impl From<ForwardInfo> for GroupLabels {
    fn from(info: ForwardInfo) -> Self {
        Self {
            protocol: info.protocol.to_string(),
            port: info.port.to_string(),
        }
    }
}

/// Labels for forward unit outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ForwardLabels {
    pub protocol: String,
    pub port: String,
    pub result: Outcome,
}

/// Labels for bytes transferred metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub protocol: String,
    pub port: String,
    pub direction: Direction,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub protocol: String,
    pub backend: String,
    pub result: Outcome,
}

/// Labels for control request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControlLabels {
    pub cmd: String,
    pub result: Outcome,
}

/// Success or failure of an operation.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok { Outcome::Success } else { Outcome::Failure }
    }
}

/// Direction of bytes transfer.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    ToBackend,
    ToClient,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    forwards_total: Family<ForwardLabels, Counter>,
    forward_duration_seconds: Family<GroupLabels, Histogram>,
    bytes_total: Family<BytesLabels, Counter>,
    registered_backends: Family<GroupLabels, Gauge>,
    active_groups: Gauge,
    health_checks_total: Family<HealthCheckLabels, Counter>,
    evictions_total: Family<GroupLabels, Counter>,
    control_requests_total: Family<ControlLabels, Counter>,
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let forwards_total = Family::<ForwardLabels, Counter>::default();
        let forward_duration_seconds =
            Family::<GroupLabels, Histogram>::new_with_constructor(|| {
                // 1ms .. ~15s
                Histogram::new(exponential_buckets(0.001, 2.5, 12))
            });
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let registered_backends = Family::<GroupLabels, Gauge>::default();
        let active_groups = Gauge::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let evictions_total = Family::<GroupLabels, Counter>::default();
        let control_requests_total = Family::<ControlLabels, Counter>::default();

        registry.register(
            "dynlb_forwards",
            "Total number of forward units processed",
            forwards_total.clone(),
        );
        registry.register(
            "dynlb_forward_duration_seconds",
            "Forward unit duration in seconds",
            forward_duration_seconds.clone(),
        );
        registry.register(
            "dynlb_bytes",
            "Total bytes relayed",
            bytes_total.clone(),
        );
        registry.register(
            "dynlb_registered_backends",
            "Number of backends registered per forwarding group",
            registered_backends.clone(),
        );
        registry.register(
            "dynlb_active_groups",
            "Number of live forwarding groups",
            active_groups.clone(),
        );
        registry.register(
            "dynlb_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "dynlb_evictions",
            "Backends removed after a failed health check",
            evictions_total.clone(),
        );
        registry.register(
            "dynlb_control_requests",
            "Control protocol requests handled",
            control_requests_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                forwards_total,
                forward_duration_seconds,
                bytes_total,
                registered_backends,
                active_groups,
                health_checks_total,
                evictions_total,
                control_requests_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a completed forward unit.
    pub fn record_forward(
        &self,
        info: ForwardInfo,
        result: &Result<ProxyResult, ForwardError>,
        duration: Duration,
    ) {
        let group = GroupLabels::from(info);

        self.inner
            .forwards_total
            .get_or_create(&ForwardLabels {
                protocol: group.protocol.clone(),
                port: group.port.clone(),
                result: Outcome::from(result.is_ok()),
            })
            .inc();

        self.inner
            .forward_duration_seconds
            .get_or_create(&group)
            .observe(duration.as_secs_f64());

        if let Ok(bytes) = result {
            for (direction, count) in [
                (Direction::ToBackend, bytes.bytes_to_backend),
                (Direction::ToClient, bytes.bytes_to_client),
            ] {
                self.inner
                    .bytes_total
                    .get_or_create(&BytesLabels {
                        protocol: group.protocol.clone(),
                        port: group.port.clone(),
                        direction,
                    })
                    .inc_by(count);
            }
        }
    }

    /// Update the member count of a group.
    pub fn set_registered_backends(&self, info: ForwardInfo, count: usize) {
        self.inner
            .registered_backends
            .get_or_create(&GroupLabels::from(info))
            .set(count as i64);
    }

    pub fn group_created(&self) {
        self.inner.active_groups.inc();
    }

    pub fn group_removed(&self, info: ForwardInfo) {
        self.inner.active_groups.dec();
        self.inner
            .registered_backends
            .remove(&GroupLabels::from(info));
    }

    /// Record a health check result.
    pub fn record_health_check(&self, target: &BackendTarget, healthy: bool) {
        let labels = HealthCheckLabels {
            protocol: target.protocol().to_string(),
            backend: target.addr().to_string(),
            result: Outcome::from(healthy),
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Record a backend evicted by the health monitor.
    pub fn record_eviction(&self, target: &BackendTarget) {
        self.inner
            .evictions_total
            .get_or_create(&GroupLabels::from(ForwardInfo::of(target)))
            .inc();
    }

    /// Record a handled control request.
    pub fn record_control_request(&self, cmd: &str, success: bool) {
        let labels = ControlLabels {
            cmd: cmd.to_string(),
            result: Outcome::from(success),
        };
        self.inner.control_requests_total.get_or_create(&labels).inc();
    }

    /// Current value of the active groups gauge.
    pub fn active_groups(&self) -> i64 {
        self.inner.active_groups.get()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
