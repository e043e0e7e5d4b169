//! Listening sockets and the per-group accept/receive loops.
//!
//! A loop never awaits a forward: every inbound unit is handed to
//! [`ForwardingGroup::dispatch`], which queues it on the group's worker pool.

use super::group::ForwardingGroup;
use crate::backend::Protocol;
use crate::error::LbError;
use crate::proxy::InboundUnit;
use crate::util::ShutdownListener;
use bytes::Bytes;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Backlog for TCP listening sockets.
const TCP_BACKLOG: i32 = 1024;

/// A bound listening socket that has not started looping yet.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl BoundListener {
    /// Bind a listening socket for `protocol` on `addr`.
    ///
    /// TCP sockets set `SO_REUSEADDR` so a port can be rebound right after a
    /// group is torn down. Must be called inside a Tokio runtime.
    pub fn bind(protocol: Protocol, addr: SocketAddr) -> Result<Self, LbError> {
        let bind_error = |source| LbError::Bind {
            protocol,
            addr,
            source,
        };

        match protocol {
            Protocol::Tcp => {
                let socket = tcp_socket(addr).map_err(bind_error)?;
                let listener = TcpListener::from_std(socket.into()).map_err(bind_error)?;
                Ok(BoundListener::Tcp(listener))
            }
            Protocol::Udp => {
                let socket = udp_socket(addr).map_err(bind_error)?;
                let socket = UdpSocket::from_std(socket.into()).map_err(bind_error)?;
                Ok(BoundListener::Udp(Arc::new(socket)))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BoundListener::Tcp(listener) => listener.local_addr(),
            BoundListener::Udp(socket) => socket.local_addr(),
        }
    }
}

fn tcp_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(TCP_BACKLOG)?;
    Ok(socket)
}

fn udp_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// How a listener loop ended.
#[derive(Debug)]
pub enum LoopExit {
    /// The group was stopped.
    Stopped,
    /// The listening socket failed; the group can no longer receive traffic.
    Failed(io::Error),
}

/// Errors after which the loop keeps going.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Accept connections until the group stops or the listener fails.
pub(crate) async fn run_tcp_loop(
    group: Arc<ForwardingGroup>,
    listener: TcpListener,
    mut shutdown: ShutdownListener,
) -> LoopExit {
    info!(group = %group.info(), local = %group.local_addr(), "TCP listener loop started");

    let exit = loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break LoopExit::Stopped,

            accepted = listener.accept() => match accepted {
                Ok((stream, client)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(client = %client, error = %e, "failed to set TCP_NODELAY");
                    }
                    group.dispatch(InboundUnit::Tcp { stream, client });
                }
                Err(_) if !group.is_running() => break LoopExit::Stopped,
                Err(e) if is_transient(&e) => {
                    warn!(group = %group.info(), error = %e, "transient accept error");
                }
                Err(e) => {
                    error!(group = %group.info(), error = %e, "TCP listener failed");
                    break LoopExit::Failed(e);
                }
            },
        }
    };

    info!(group = %group.info(), "TCP listener loop exited");
    exit
}

/// Receive datagrams until the group stops or the socket fails.
///
/// `idle_timeout` bounds each receive so the running flag is re-checked
/// during quiet periods.
pub(crate) async fn run_udp_loop(
    group: Arc<ForwardingGroup>,
    socket: Arc<UdpSocket>,
    mut shutdown: ShutdownListener,
    idle_timeout: Duration,
) -> LoopExit {
    info!(group = %group.info(), local = %group.local_addr(), "UDP listener loop started");

    let mut buf = vec![0u8; Protocol::Udp.read_buffer_size()];
    let exit = loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break LoopExit::Stopped,

            received = timeout(idle_timeout, socket.recv_from(&mut buf)) => match received {
                Ok(Ok((n, client))) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    group.dispatch(InboundUnit::Udp {
                        socket: Arc::clone(&socket),
                        client,
                        payload,
                    });
                }
                Err(_) => {
                    if !group.is_running() {
                        break LoopExit::Stopped;
                    }
                    debug!(group = %group.info(), "no datagram within idle window");
                }
                Ok(Err(_)) if !group.is_running() => break LoopExit::Stopped,
                Ok(Err(e)) if is_transient(&e) => {
                    warn!(group = %group.info(), error = %e, "transient receive error");
                }
                Ok(Err(e)) => {
                    error!(group = %group.info(), error = %e, "UDP listener failed");
                    break LoopExit::Failed(e);
                }
            },
        }
    };

    info!(group = %group.info(), "UDP listener loop exited");
    exit
}
