//! TCP server accepting register/unregister requests from backends.
//!
//! One request per connection: the backend writes a JSON record and
//! half-closes; the server answers with one record and closes. The backend's
//! address is the peer address of the connection.

use super::message::{Command, ControlRequest, ControlResponse};
use super::ControlError;
use crate::metrics::MetricsCollector;
use crate::proxy::tcp_proxy;
use crate::registry::GroupRegistry;
use crate::util::ShutdownListener;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Upper bound on one request record.
const MAX_REQUEST_SIZE: usize = 4096;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next accept after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Control server bound to its listening address.
pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<GroupRegistry>,
    io_timeout: Duration,
    metrics: MetricsCollector,
}

impl ControlServer {
    pub async fn bind(
        address: SocketAddr,
        registry: Arc<GroupRegistry>,
        io_timeout: Duration,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            registry,
            io_timeout,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept control connections until shutdown, each on its own task.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(
            address = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "control server started"
        );

        let mut failures = 0u32;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("control server shutting down");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        failures = 0;
                        let registry = Arc::clone(&self.registry);
                        let metrics = self.metrics.clone();
                        let io_timeout = self.io_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer, &registry, io_timeout, &metrics).await
                            {
                                warn!(peer = %peer, error = %e, "control connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let backoff = accept_backoff(failures);
                        error!(
                            error = %e,
                            backoff = ?backoff,
                            "failed to accept control connection"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                },
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: &GroupRegistry,
    io_timeout: Duration,
    metrics: &MetricsCollector,
) -> Result<(), ControlError> {
    let request =
        tcp_proxy::read_to_end(&mut stream, peer, io_timeout, Some(MAX_REQUEST_SIZE)).await?;

    let response = process_request(registry, peer.ip().to_canonical(), &request, metrics).await;

    tcp_proxy::write_all(&mut stream, &response.encode()?, peer, io_timeout).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Decode one request, apply it to the registry and build the reply.
pub async fn process_request(
    registry: &GroupRegistry,
    backend_ip: IpAddr,
    data: &[u8],
    metrics: &MetricsCollector,
) -> ControlResponse {
    let request = match ControlRequest::decode(data) {
        Ok(request) => request,
        Err(e) => {
            info!(backend = %backend_ip, error = %e, "rejected control request");
            metrics.record_control_request("malformed", false);
            return ControlResponse::failed(e.to_string());
        }
    };

    let command = match request.command() {
        Ok(command) => command,
        Err(e) => {
            info!(backend = %backend_ip, error = %e, "rejected control request");
            metrics.record_control_request("unknown", false);
            return ControlResponse::failed(e.to_string());
        }
    };

    let result = match command {
        Command::Register => {
            registry
                .register_backend(request.protocol, backend_ip, request.port)
                .await
        }
        Command::Unregister => {
            registry.unregister_backend(request.protocol, backend_ip, request.port)
        }
    };
    metrics.record_control_request(command.as_str(), result.is_ok());

    match result {
        Ok(()) => {
            debug!(
                cmd = %command,
                backend = %backend_ip,
                protocol = %request.protocol,
                port = request.port,
                "control request applied"
            );
            ControlResponse::successful()
        }
        Err(e) => {
            warn!(
                cmd = %command,
                backend = %backend_ip,
                protocol = %request.protocol,
                port = request.port,
                error = %e,
                "control request failed"
            );
            ControlResponse::rejected(command)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ForwardInfo, Protocol};
    use crate::control::message::{REGISTRATION_FAILED, UNREGISTRATION_FAILED};
    use crate::registry::RegistrySettings;
    use crate::util::ShutdownSignal;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn registry() -> Arc<GroupRegistry> {
        GroupRegistry::new(
            RegistrySettings {
                bind_ip: LOCALHOST,
                worker_threads: 1,
                tcp_timeout: Duration::from_secs(1),
                udp_timeout: Duration::from_secs(1),
                udp_idle_timeout: Duration::from_millis(100),
            },
            MetricsCollector::new(),
        )
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn request(cmd: Command, protocol: Protocol, port: u16) -> Vec<u8> {
        ControlRequest::new(cmd, protocol, port).encode().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = registry();
        let metrics = MetricsCollector::new();
        let port = free_port();

        let response = process_request(
            &registry,
            LOCALHOST,
            &request(Command::Register, Protocol::Tcp, port),
            &metrics,
        )
        .await;
        assert!(response.is_successful());
        assert!(registry.group(ForwardInfo::new(Protocol::Tcp, port)).is_some());

        let response = process_request(
            &registry,
            LOCALHOST,
            &request(Command::Unregister, Protocol::Tcp, port),
            &metrics,
        )
        .await;
        assert!(response.is_successful());
        assert_eq!(registry.group_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_map_to_messages() {
        let registry = registry();
        let metrics = MetricsCollector::new();
        let port = free_port();

        let response = process_request(
            &registry,
            LOCALHOST,
            &request(Command::Unregister, Protocol::Udp, port),
            &metrics,
        )
        .await;
        assert_eq!(response.msg.as_deref(), Some(UNREGISTRATION_FAILED));

        let register = request(Command::Register, Protocol::Udp, port);
        let response = process_request(&registry, LOCALHOST, &register, &metrics).await;
        assert!(response.is_successful());
        let response = process_request(&registry, LOCALHOST, &register, &metrics).await;
        assert_eq!(response.msg.as_deref(), Some(REGISTRATION_FAILED));

        let response = process_request(&registry, LOCALHOST, b"garbage", &metrics).await;
        assert!(!response.is_successful());

        registry.shutdown();
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let registry = registry();
        let server = ControlServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&registry),
            Duration::from_secs(1),
            MetricsCollector::new(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let signal = ShutdownSignal::new();
        let handle = tokio::spawn(server.run(signal.subscribe()));

        let port = free_port();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&request(Command::Register, Protocol::Tcp, port))
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(ControlResponse::decode(&reply).unwrap().is_successful());
        assert!(registry.contains_backend(&crate::backend::BackendTarget::new(
            Protocol::Tcp,
            SocketAddr::new(LOCALHOST, port),
            Duration::from_secs(1),
        )));

        signal.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        registry.shutdown();
    }
}
