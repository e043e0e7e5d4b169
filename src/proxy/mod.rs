//! Per-unit forwarding and probe I/O for TCP and UDP.
//!
//! Errors raised here are transient: callers resolve them to an unhealthy
//! verdict or to the fixed error reply, and never propagate them further.

pub mod message;
pub mod tcp_proxy;
pub mod udp_proxy;

pub use message::{FORWARD_ERROR_MESSAGE, HealthCheckRequest, HealthCheckResponse};

use crate::backend::Protocol;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};

/// Bytes moved by one successful forward unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyResult {
    /// Bytes sent from client to backend.
    pub bytes_to_backend: u64,
    /// Bytes sent from backend to client.
    pub bytes_to_client: u64,
}

/// Transient forwarding or probe failure.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to connect to backend {0}: {1}")]
    Connect(SocketAddr, io::Error),

    #[error("connection timeout to backend {0}")]
    ConnectTimeout(SocketAddr),

    #[error("timed out {stage} with {peer}")]
    Timeout {
        peer: SocketAddr,
        stage: &'static str,
    },

    #[error("malformed health check reply: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{unit} unit cannot be forwarded to a {target} backend")]
    ProtocolMismatch { unit: Protocol, target: Protocol },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One unit of inbound traffic handed from a listener loop to a backend.
#[derive(Debug)]
pub enum InboundUnit {
    /// An accepted client connection; the request is read by the worker.
    Tcp { stream: TcpStream, client: SocketAddr },
    /// One received datagram plus the shared socket to answer through.
    Udp {
        socket: Arc<UdpSocket>,
        client: SocketAddr,
        payload: Bytes,
    },
}

impl InboundUnit {
    pub fn client(&self) -> SocketAddr {
        match self {
            InboundUnit::Tcp { client, .. } | InboundUnit::Udp { client, .. } => *client,
        }
    }
}
