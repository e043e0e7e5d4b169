//! One listening endpoint and the backends it forwards to.

use super::listener::{run_tcp_loop, run_udp_loop, BoundListener, LoopExit};
use super::worker_pool::WorkerPool;
use crate::backend::{BackendTarget, ForwardInfo, Protocol, RoundRobinQueue};
use crate::error::LbError;
use crate::metrics::MetricsCollector;
use crate::proxy::{tcp_proxy, udp_proxy, InboundUnit};
use crate::util::{ShutdownSignal, UnitId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Per-group tuning.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    /// Number of workers forwarding units concurrently.
    pub worker_threads: usize,
    /// Timeout for the error reply sent when no backend is available.
    pub io_timeout: Duration,
    /// Receive window after which an idle UDP loop re-checks its state.
    pub udp_idle_timeout: Duration,
}

enum GroupState {
    /// Bound but not looping; holds the listener until `start`.
    Idle(BoundListener),
    Running,
    /// Terminal.
    Stopped,
}

/// A listening endpoint plus its round-robin set of backends.
///
/// The loop runs iff the backend set is non-empty: removing the last backend
/// stops the group for good.
pub struct ForwardingGroup {
    info: ForwardInfo,
    local_addr: SocketAddr,
    // Lock order: backends, then state.
    backends: Mutex<RoundRobinQueue>,
    state: Mutex<GroupState>,
    running: AtomicBool,
    shutdown: ShutdownSignal,
    // Fires once the listener loop has returned and dropped its socket
    loop_done: ShutdownSignal,
    // Fires once the listening socket is closed and the pool has drained
    released: ShutdownSignal,
    pool: Arc<WorkerPool>,
    io_timeout: Duration,
    udp_idle_timeout: Duration,
    metrics: MetricsCollector,
}

impl ForwardingGroup {
    /// Bind the listening socket and spawn the worker pool.
    ///
    /// The group's key is taken from the bound address, so binding port 0
    /// yields a group keyed by the ephemeral port.
    pub fn bind(
        protocol: Protocol,
        addr: SocketAddr,
        settings: &GroupSettings,
        metrics: MetricsCollector,
    ) -> Result<Arc<Self>, LbError> {
        let listener = BoundListener::bind(protocol, addr)?;
        let local_addr = listener.local_addr().map_err(|source| LbError::Bind {
            protocol,
            addr,
            source,
        })?;
        let info = ForwardInfo::new(protocol, local_addr.port());
        let pool = WorkerPool::new(info.to_string(), settings.worker_threads);

        info!(
            group = %info,
            local = %local_addr,
            workers = pool.size(),
            "forwarding group bound"
        );

        Ok(Arc::new(Self {
            info,
            local_addr,
            backends: Mutex::new(RoundRobinQueue::new()),
            state: Mutex::new(GroupState::Idle(listener)),
            running: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            loop_done: ShutdownSignal::new(),
            released: ShutdownSignal::new(),
            pool: Arc::new(pool),
            io_timeout: settings.io_timeout,
            udp_idle_timeout: settings.udp_idle_timeout,
            metrics,
        }))
    }

    /// Start the listener loop.
    ///
    /// Fails when there are no backends or the group is not idle. The returned
    /// handle resolves when the loop exits.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<LoopExit>, LbError> {
        let backends = self.backends.lock();
        if backends.is_empty() {
            return Err(LbError::InvalidState(
                "cannot start forwarding without backends",
            ));
        }

        let mut state = self.state.lock();
        let listener = match std::mem::replace(&mut *state, GroupState::Running) {
            GroupState::Idle(listener) => listener,
            GroupState::Running => {
                return Err(LbError::InvalidState("forwarding is already running"));
            }
            GroupState::Stopped => {
                *state = GroupState::Stopped;
                return Err(LbError::InvalidState("group has been shut down"));
            }
        };
        self.running.store(true, Ordering::SeqCst);
        drop(state);
        drop(backends);

        let group = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        let loop_done = SignalOnDrop(self.loop_done.clone());
        let idle_timeout = self.udp_idle_timeout;
        let handle = tokio::spawn(async move {
            let _loop_done = loop_done;
            match listener {
                BoundListener::Tcp(listener) => run_tcp_loop(group, listener, shutdown).await,
                BoundListener::Udp(socket) => {
                    run_udp_loop(group, socket, shutdown, idle_timeout).await
                }
            }
        });

        Ok(handle)
    }

    /// Append a backend at the tail of the round-robin order.
    pub fn add_backend(&self, target: BackendTarget) -> Result<(), LbError> {
        if target.protocol() != self.info.protocol {
            return Err(LbError::ProtocolMismatch {
                expected: self.info.protocol,
                target,
            });
        }

        let mut backends = self.backends.lock();
        if matches!(*self.state.lock(), GroupState::Stopped) {
            return Err(LbError::InvalidState("group has been shut down"));
        }
        if !backends.push(target.clone()) {
            return Err(LbError::DuplicateBackend(target));
        }
        let count = backends.len();
        drop(backends);

        self.metrics.set_registered_backends(self.info, count);
        debug!(group = %self.info, backend = %target, backends = count, "backend added");
        Ok(())
    }

    /// Remove a backend; removing the last one stops the group.
    pub fn remove_backend(&self, target: &BackendTarget) -> Result<(), LbError> {
        let mut backends = self.backends.lock();
        if !backends.remove(target) {
            return Err(LbError::BackendNotFound(target.clone()));
        }
        let remaining = backends.len();
        if remaining == 0 {
            self.stop();
        }
        drop(backends);

        self.metrics.set_registered_backends(self.info, remaining);
        debug!(group = %self.info, backend = %target, backends = remaining, "backend removed");
        Ok(())
    }

    /// Take every backend out of the group, leaving it empty.
    ///
    /// Used when a group is torn down from outside; does not stop the group.
    pub fn drain_backends(&self) -> Vec<BackendTarget> {
        let drained = self.backends.lock().drain();
        self.metrics.set_registered_backends(self.info, 0);
        drained
    }

    /// Stop the loop and drain the worker pool in the background.
    ///
    /// Runs once; later calls are no-ops. Never blocks on in-flight forwards;
    /// await [`closed`](Self::closed) for the teardown to finish. Must be
    /// called inside a Tokio runtime.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), GroupState::Stopped);
        let looping = match previous {
            GroupState::Stopped => return,
            GroupState::Running => true,
            // An idle listener is released right here
            GroupState::Idle(listener) => {
                drop(listener);
                false
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.shutdown();

        let pool = Arc::clone(&self.pool);
        let mut loop_done = self.loop_done.subscribe();
        let released = self.released.clone();
        let info = self.info;
        tokio::spawn(async move {
            pool.shutdown().await;
            if looping {
                loop_done.recv().await;
            }
            released.shutdown();
            debug!(group = %info, "forwarding group released");
        });

        info!(group = %self.info, "forwarding group stopped");
    }

    /// Resolve once a stopped group has closed its listening socket and
    /// finished every queued forward. The port can be bound again after this.
    pub async fn closed(&self) {
        self.released.subscribe().recv().await;
    }

    pub fn is_closed(&self) -> bool {
        self.released.is_shutdown()
    }

    /// Pick the next backend in round-robin order.
    pub fn select_backend(&self) -> Option<BackendTarget> {
        self.backends.lock().next()
    }

    /// Hand one inbound unit to the worker pool.
    pub(crate) fn dispatch(&self, unit: InboundUnit) {
        let id = UnitId::next();
        let client = unit.client();

        let Some(target) = self.select_backend() else {
            debug!(unit = %id, client = %client, group = %self.info, "no backend available");
            if let Err(e) = self.pool.execute(reject(unit, self.io_timeout)) {
                debug!(unit = %id, client = %client, error = %e, "inbound unit dropped");
            }
            return;
        };

        let info = self.info;
        let metrics = self.metrics.clone();
        let span = info_span!("forward", unit = %id, group = %info, client = %client);
        let job = async move {
            let started = Instant::now();
            let result = target.forward(unit).await;
            let elapsed = started.elapsed();
            metrics.record_forward(info, &result, elapsed);

            if let Ok(bytes) = result {
                debug!(
                    backend = %target,
                    bytes_to_backend = bytes.bytes_to_backend,
                    bytes_to_client = bytes.bytes_to_client,
                    duration_ms = elapsed.as_millis(),
                    "forward unit completed"
                );
            }
        }
        .instrument(span);

        if let Err(e) = self.pool.execute(job) {
            warn!(unit = %id, client = %client, group = %self.info, error = %e, "inbound unit dropped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*self.state.lock(), GroupState::Stopped)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.lock().len()
    }

    /// Snapshot of the backends in round-robin order.
    pub fn backends(&self) -> Vec<BackendTarget> {
        self.backends.lock().snapshot()
    }

    pub fn contains(&self, target: &BackendTarget) -> bool {
        self.backends.lock().contains(target)
    }

    pub fn info(&self) -> ForwardInfo {
        self.info
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl std::fmt::Debug for ForwardingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingGroup")
            .field("info", &self.info)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .field("backends", &self.len())
            .finish()
    }
}

/// Triggers its signal when dropped, including on unwind.
struct SignalOnDrop(ShutdownSignal);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Answer a unit that arrived while no backend was available.
async fn reject(unit: InboundUnit, io_timeout: Duration) {
    let result = match unit {
        InboundUnit::Tcp { mut stream, client } => {
            tcp_proxy::send_error_reply(&mut stream, client, io_timeout).await
        }
        InboundUnit::Udp { socket, client, .. } => udp_proxy::send_error_reply(&socket, client).await,
    };
    if let Err(e) = result {
        debug!(error = %e, "failed to send error reply");
    }
}
