//! A registered backend destination.

use super::Protocol;
use crate::proxy::{
    tcp_proxy, udp_proxy, ForwardError, HealthCheckRequest, HealthCheckResponse, InboundUnit,
    ProxyResult,
};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One backend traffic may be forwarded to.
///
/// Identity is the (protocol, ip, port) triple; the I/O timeout is not part of
/// equality or hashing.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    protocol: Protocol,
    addr: SocketAddr,
    io_timeout: Duration,
}

impl BackendTarget {
    /// Create a target with the timeout used for every connect/read/receive.
    pub fn new(protocol: Protocol, addr: SocketAddr, io_timeout: Duration) -> Self {
        Self {
            protocol,
            addr,
            io_timeout,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Run one health probe.
    ///
    /// Never fails: connect errors, timeouts and undecodable replies all
    /// resolve to `false`.
    pub async fn is_healthy(&self) -> bool {
        match self.probe().await {
            Ok(true) => true,
            Ok(false) => {
                info!(backend = %self, "health check answered with unexpected ack");
                false
            }
            Err(e) => {
                warn!(backend = %self, error = %e, "health check failed");
                false
            }
        }
    }

    async fn probe(&self) -> Result<bool, ForwardError> {
        let request = HealthCheckRequest::hello().encode()?;

        let reply = match self.protocol {
            Protocol::Tcp => {
                tcp_proxy::exchange(
                    self.addr,
                    &request,
                    self.io_timeout,
                    Some(self.protocol.read_buffer_size()),
                )
                .await?
            }
            Protocol::Udp => udp_proxy::exchange(self.addr, &request, self.io_timeout).await?,
        };

        Ok(HealthCheckResponse::decode(&reply)?.is_success())
    }

    /// Forward one inbound unit and relay the backend's reply to the client.
    ///
    /// On failure the client has already been sent the fixed error reply by
    /// the time this returns; the error is only informational.
    pub async fn forward(&self, unit: InboundUnit) -> Result<ProxyResult, ForwardError> {
        let result = match unit {
            InboundUnit::Tcp { mut stream, client } => {
                let result = if self.protocol == Protocol::Tcp {
                    tcp_proxy::relay_connection(&mut stream, client, self.addr, self.io_timeout)
                        .await
                } else {
                    Err(self.mismatch(Protocol::Tcp))
                };
                if result.is_err() {
                    if let Err(e) =
                        tcp_proxy::send_error_reply(&mut stream, client, self.io_timeout).await
                    {
                        debug!(client = %client, error = %e, "failed to send error reply");
                    }
                }
                result
            }
            InboundUnit::Udp {
                socket,
                client,
                payload,
            } => {
                let result = if self.protocol == Protocol::Udp {
                    udp_proxy::relay_datagram(&socket, client, self.addr, &payload, self.io_timeout)
                        .await
                } else {
                    Err(self.mismatch(Protocol::Udp))
                };
                if result.is_err() {
                    if let Err(e) = udp_proxy::send_error_reply(&socket, client).await {
                        debug!(client = %client, error = %e, "failed to send error reply");
                    }
                }
                result
            }
        };

        if let Err(ref e) = result {
            warn!(backend = %self, error = %e, "forwarding failed, sent error reply");
        }

        result
    }

    fn mismatch(&self, unit: Protocol) -> ForwardError {
        ForwardError::ProtocolMismatch {
            unit,
            target: self.protocol,
        }
    }
}

impl PartialEq for BackendTarget {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.addr == other.addr
    }
}

impl Eq for BackendTarget {}

impl Hash for BackendTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.addr.hash(state);
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::FORWARD_ERROR_MESSAGE;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// TCP backend answering every connection with a fixed reply after EOF.
    async fn start_tcp_backend(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = Vec::new();
                let _ = stream.read_to_end(&mut request).await;
                let _ = stream.write_all(reply).await;
            }
        });
        addr
    }

    /// UDP backend answering every datagram with a zero-padded reply.
    async fn start_udp_backend(reply: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let mut padded = reply.to_vec();
                padded.resize(4096, 0);
                let _ = socket.send_to(&padded, peer).await;
            }
        });
        addr
    }

    fn free_local_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_identity_ignores_timeout() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let a = BackendTarget::new(Protocol::Tcp, addr, Duration::from_secs(1));
        let b = BackendTarget::new(Protocol::Tcp, addr, Duration::from_secs(30));
        let c = BackendTarget::new(Protocol::Udp, addr, Duration::from_secs(1));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        assert!(set.insert(a));
        assert!(!set.insert(b));
        assert!(set.insert(c));
    }

    #[test]
    fn test_display() {
        let target = BackendTarget::new(
            Protocol::Tcp,
            "10.0.0.1:9000".parse().unwrap(),
            TIMEOUT,
        );
        assert_eq!(target.to_string(), "TCP 10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_tcp_healthy() {
        let addr = start_tcp_backend(br#"{"ack":"hello"}"#).await;
        let target = BackendTarget::new(Protocol::Tcp, addr, TIMEOUT);
        assert!(target.is_healthy().await);
    }

    #[tokio::test]
    async fn test_tcp_wrong_ack_is_unhealthy() {
        let addr = start_tcp_backend(br#"{"ack":"nope"}"#).await;
        let target = BackendTarget::new(Protocol::Tcp, addr, TIMEOUT);
        assert!(!target.is_healthy().await);
    }

    #[tokio::test]
    async fn test_tcp_garbage_is_unhealthy() {
        let addr = start_tcp_backend(b"<html>").await;
        let target = BackendTarget::new(Protocol::Tcp, addr, TIMEOUT);
        assert!(!target.is_healthy().await);
    }

    #[tokio::test]
    async fn test_tcp_refused_is_unhealthy() {
        let target = BackendTarget::new(Protocol::Tcp, free_local_addr(), TIMEOUT);
        assert!(!target.is_healthy().await);
    }

    #[tokio::test]
    async fn test_udp_healthy_with_padding() {
        let addr = start_udp_backend(br#"{"ack":"hello"}"#).await;
        let target = BackendTarget::new(Protocol::Udp, addr, TIMEOUT);
        assert!(target.is_healthy().await);
    }

    #[tokio::test]
    async fn test_udp_silent_is_unhealthy() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = BackendTarget::new(
            Protocol::Udp,
            silent.local_addr().unwrap(),
            Duration::from_millis(100),
        );
        assert!(!target.is_healthy().await);
    }

    #[tokio::test]
    async fn test_tcp_forward_unreachable_sends_error_reply() {
        let target = BackendTarget::new(Protocol::Tcp, free_local_addr(), TIMEOUT);

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let forward = tokio::spawn(async move {
            let (stream, client) = front.accept().await.unwrap();
            target.forward(InboundUnit::Tcp { stream, client }).await
        });

        let started = Instant::now();
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(TIMEOUT * 2, client.read_to_end(&mut reply))
            .await
            .expect("client left hanging")
            .unwrap();

        assert_eq!(reply, FORWARD_ERROR_MESSAGE);
        assert!(started.elapsed() < TIMEOUT * 2);
        assert!(forward.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_udp_forward_strips_padding() {
        let backend = start_udp_backend(b"short reply").await;
        let target = BackendTarget::new(Protocol::Udp, backend, TIMEOUT);

        let listen = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = target
            .forward(InboundUnit::Udp {
                socket: Arc::clone(&listen),
                client: client.local_addr().unwrap(),
                payload: Bytes::from_static(b"query"),
            })
            .await
            .unwrap();
        assert_eq!(result.bytes_to_backend, 5);

        let mut buf = vec![0u8; 65535];
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"short reply");
    }

    #[tokio::test]
    async fn test_udp_forward_timeout_sends_error_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = BackendTarget::new(
            Protocol::Udp,
            silent.local_addr().unwrap(),
            Duration::from_millis(100),
        );

        let listen = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = target
            .forward(InboundUnit::Udp {
                socket: listen,
                client: client.local_addr().unwrap(),
                payload: Bytes::from_static(b"query"),
            })
            .await;
        assert!(result.is_err());

        let mut buf = [0u8; 128];
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], FORWARD_ERROR_MESSAGE);
    }
}
