//! The registry of forwarding groups, keyed by (protocol, listen port).
//!
//! Registering the first backend for a key binds a new group and starts it;
//! unregistering the last one stops the group and drops it from the map. Both
//! paths hold the key's map entry, so they never interleave for one key.
//!
//! A dropped group stays in `draining` until its socket is closed; a new
//! registration for that key waits for it before binding the port again.

use crate::backend::{BackendTarget, ForwardInfo, Protocol};
use crate::error::LbError;
use crate::frontend::{ForwardingGroup, GroupSettings, LoopExit};
use crate::metrics::MetricsCollector;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Observer of registry membership changes.
///
/// Callbacks run synchronously on the registering task, in subscription
/// order, after the map entry lock has been released.
pub trait RegistryListener: Send + Sync {
    /// A backend joined a group. An error is returned to the registering
    /// caller.
    fn on_registered(&self, target: &BackendTarget) -> Result<(), LbError>;

    /// A backend left its group.
    fn on_unregistered(&self, target: &BackendTarget);
}

/// Settings applied to every group the registry creates.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Address groups listen on.
    pub bind_ip: IpAddr,
    pub worker_threads: usize,
    pub tcp_timeout: Duration,
    pub udp_timeout: Duration,
    pub udp_idle_timeout: Duration,
}

impl RegistrySettings {
    /// Forwarding and probe timeout for backends of `protocol`.
    pub fn io_timeout(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Tcp => self.tcp_timeout,
            Protocol::Udp => self.udp_timeout,
        }
    }

    fn group_settings(&self, protocol: Protocol) -> GroupSettings {
        GroupSettings {
            worker_threads: self.worker_threads,
            io_timeout: self.io_timeout(protocol),
            udp_idle_timeout: self.udp_idle_timeout,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            tcp_timeout: Duration::from_secs(5),
            udp_timeout: Duration::from_secs(5),
            udp_idle_timeout: Duration::from_secs(3),
        }
    }
}

/// Live forwarding groups and their subscribers.
pub struct GroupRegistry {
    settings: RegistrySettings,
    groups: DashMap<ForwardInfo, Arc<ForwardingGroup>>,
    draining: DashMap<ForwardInfo, Arc<ForwardingGroup>>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
    metrics: MetricsCollector,
    this: Weak<GroupRegistry>,
}

impl GroupRegistry {
    pub fn new(settings: RegistrySettings, metrics: MetricsCollector) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            settings,
            groups: DashMap::new(),
            draining: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            metrics,
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Add a listener for membership changes.
    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    /// Register the backend at `ip:port` for `protocol`.
    ///
    /// The group listens on the same port as the backend. Creates and starts
    /// the group if this is the first backend for the key, first waiting for
    /// a previous group on that port to release it.
    pub async fn register_backend(
        &self,
        protocol: Protocol,
        ip: IpAddr,
        port: u16,
    ) -> Result<(), LbError> {
        if port == 0 {
            return Err(LbError::InvalidState("backend port must be non-zero"));
        }

        let target = self.target(protocol, ip, port);
        let info = ForwardInfo::of(&target);

        loop {
            self.wait_released(info).await;
            if self.try_register(info, &target)? {
                break;
            }
        }

        info!(backend = %target, group = %info, "backend registered");
        self.notify_registered(&target)
    }

    /// Join or create the group for `info`. Returns `false` if a previous
    /// group for the key is still draining.
    fn try_register(&self, info: ForwardInfo, target: &BackendTarget) -> Result<bool, LbError> {
        match self.groups.entry(info) {
            Entry::Occupied(entry) => entry.get().add_backend(target.clone())?,
            Entry::Vacant(entry) => {
                if self.draining.contains_key(&info) {
                    return Ok(false);
                }

                let protocol = info.protocol;
                let listen = SocketAddr::new(self.settings.bind_ip, info.port);
                let group = ForwardingGroup::bind(
                    protocol,
                    listen,
                    &self.settings.group_settings(protocol),
                    self.metrics.clone(),
                )?;

                let handle = match group
                    .add_backend(target.clone())
                    .and_then(|()| group.start())
                {
                    Ok(handle) => handle,
                    Err(e) => {
                        group.stop();
                        return Err(e);
                    }
                };

                self.supervise(Arc::clone(&group), handle);
                self.metrics.group_created();
                info!(group = %info, local = %group.local_addr(), "forwarding group created");
                entry.insert(group);
            }
        }
        Ok(true)
    }

    async fn wait_released(&self, info: ForwardInfo) {
        let pending = self.draining.get(&info).map(|group| Arc::clone(group.value()));
        if let Some(group) = pending {
            debug!(group = %info, "waiting for previous group to release its port");
            group.closed().await;
            self.draining
                .remove_if(&info, |_, draining| Arc::ptr_eq(draining, &group));
        }
    }

    /// Unregister the backend at `ip:port` for `protocol`.
    ///
    /// Drops the group once its last backend is gone.
    pub fn unregister_backend(
        &self,
        protocol: Protocol,
        ip: IpAddr,
        port: u16,
    ) -> Result<(), LbError> {
        let target = self.target(protocol, ip, port);
        let info = ForwardInfo::of(&target);

        match self.groups.entry(info) {
            Entry::Vacant(_) => return Err(LbError::GroupNotFound(info)),
            Entry::Occupied(entry) => {
                entry.get().remove_backend(&target)?;
                if entry.get().is_empty() {
                    self.retire(Arc::clone(entry.get()));
                    entry.remove();
                    self.metrics.group_removed(info);
                    info!(group = %info, "forwarding group removed");
                }
            }
        }

        info!(backend = %target, group = %info, "backend unregistered");
        self.notify_unregistered(&target);
        Ok(())
    }

    /// Unregister a backend by its target identity.
    pub fn unregister_target(&self, target: &BackendTarget) -> Result<(), LbError> {
        self.unregister_backend(target.protocol(), target.ip(), target.port())
    }

    pub fn group(&self, info: ForwardInfo) -> Option<Arc<ForwardingGroup>> {
        self.groups.get(&info).map(|group| Arc::clone(group.value()))
    }

    pub fn contains_backend(&self, target: &BackendTarget) -> bool {
        self.groups
            .get(&ForwardInfo::of(target))
            .is_some_and(|group| group.contains(target))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Stop every group and clear the map. Subscribers are not notified.
    pub fn shutdown(&self) {
        let mut stopped = Vec::new();
        self.groups.retain(|_, group| {
            stopped.push(Arc::clone(group));
            false
        });

        for group in &stopped {
            group.stop();
            self.metrics.group_removed(group.info());
        }
        info!(groups = stopped.len(), "registry shut down");
    }

    fn target(&self, protocol: Protocol, ip: IpAddr, port: u16) -> BackendTarget {
        BackendTarget::new(
            protocol,
            SocketAddr::new(ip, port),
            self.settings.io_timeout(protocol),
        )
    }

    /// Track a group until its socket is closed. Called before the group
    /// leaves `groups` so a concurrent registration always sees one of them.
    fn retire(&self, group: Arc<ForwardingGroup>) {
        let info = group.info();
        self.draining.insert(info, Arc::clone(&group));

        let registry = self.this.clone();
        tokio::spawn(async move {
            group.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry
                    .draining
                    .remove_if(&info, |_, draining| Arc::ptr_eq(draining, &group));
            }
            debug!(group = %info, "port released for new registrations");
        });
    }

    /// Watch a group's loop and evict the group if its listener fails.
    fn supervise(&self, group: Arc<ForwardingGroup>, handle: JoinHandle<LoopExit>) {
        let registry = self.this.clone();
        tokio::spawn(async move {
            let exit = handle.await.unwrap_or_else(|e| LoopExit::Failed(io::Error::other(e)));
            if let LoopExit::Failed(e) = exit {
                error!(group = %group.info(), error = %e, "listener loop failed");
                if let Some(registry) = registry.upgrade() {
                    registry.evict_group(&group);
                }
            }
        });
    }

    /// Drop a group whose listener died and deregister all its backends.
    fn evict_group(&self, group: &Arc<ForwardingGroup>) {
        let info = group.info();
        let removed = match self.groups.entry(info) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), group) => {
                self.retire(Arc::clone(group));
                entry.remove();
                true
            }
            _ => false,
        };

        let drained = group.drain_backends();
        group.stop();
        if removed {
            self.metrics.group_removed(info);
        }

        warn!(group = %info, backends = drained.len(), "evicted forwarding group");
        for target in &drained {
            self.notify_unregistered(target);
        }
    }

    fn notify_registered(&self, target: &BackendTarget) -> Result<(), LbError> {
        let listeners = self.listeners.read().clone();
        let mut first_error = None;
        for listener in &listeners {
            if let Err(e) = listener.on_registered(target) {
                debug!(backend = %target, error = %e, "registration listener failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn notify_unregistered(&self, target: &BackendTarget) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_unregistered(target);
        }
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("settings", &self.settings)
            .field("groups", &self.groups.len())
            .finish()
    }
}
