//! UDP exchange primitives.
//!
//! Each forward unit uses a fresh ephemeral socket towards the backend. The
//! reply is relayed through the group's listening socket so the client sees it
//! come from the address it sent to.

use super::message::{trim_trailing_zeros, FORWARD_ERROR_MESSAGE};
use super::{ForwardError, ProxyResult};
use crate::backend::UDP_MAX_DATAGRAM;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Bind an ephemeral socket of the same address family as `peer`.
async fn ephemeral_socket(peer: SocketAddr) -> Result<UdpSocket, ForwardError> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

/// Send one datagram to `backend` and wait for one reply.
///
/// The reply is read into a buffer sized to the largest datagram and trimmed
/// of trailing zero bytes.
pub async fn exchange(
    backend: SocketAddr,
    payload: &[u8],
    recv_timeout: Duration,
) -> Result<Vec<u8>, ForwardError> {
    let socket = ephemeral_socket(backend).await?;
    socket.send(payload).await?;

    let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
    let n = match timeout(recv_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(ForwardError::Io(e)),
        Err(_) => {
            return Err(ForwardError::Timeout {
                peer: backend,
                stage: "receiving",
            });
        }
    };

    Ok(trim_trailing_zeros(&buf[..n]).to_vec())
}

/// Relay one client datagram through `backend`, answering via `listen_socket`.
#[instrument(skip_all, fields(client = %client, backend = %backend))]
pub async fn relay_datagram(
    listen_socket: &UdpSocket,
    client: SocketAddr,
    backend: SocketAddr,
    payload: &[u8],
    recv_timeout: Duration,
) -> Result<ProxyResult, ForwardError> {
    let reply = exchange(backend, payload, recv_timeout).await?;
    listen_socket.send_to(&reply, client).await?;

    debug!(
        bytes_to_backend = payload.len(),
        bytes_to_client = reply.len(),
        "UDP relay completed"
    );

    Ok(ProxyResult {
        bytes_to_backend: payload.len() as u64,
        bytes_to_client: reply.len() as u64,
    })
}

/// Send the fixed error payload to `client` via the listening socket.
pub async fn send_error_reply(
    listen_socket: &UdpSocket,
    client: SocketAddr,
) -> Result<(), ForwardError> {
    listen_socket.send_to(FORWARD_ERROR_MESSAGE, client).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that answers every datagram with `reply` zero-padded to `pad_to`.
    async fn start_padded_backend(reply: &'static [u8], pad_to: usize) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let mut padded = reply.to_vec();
                padded.resize(pad_to.max(reply.len()), 0);
                let _ = socket.send_to(&padded, peer).await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_exchange_trims_padding() {
        let backend = start_padded_backend(b"pong", 512).await;

        let reply = exchange(backend, b"ping", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let result = exchange(addr, b"ping", Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(ForwardError::Timeout { .. }) | Err(ForwardError::Io(_))
        ));
        drop(silent);
    }

    #[tokio::test]
    async fn test_relay_datagram_replies_from_listen_socket() {
        let backend = start_padded_backend(b"hello client", 1024).await;
        let listen = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let result = relay_datagram(
            &listen,
            client_addr,
            backend,
            b"hi",
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(result.bytes_to_client, 12);

        let mut buf = [0u8; 2048];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello client");
        assert_eq!(from, listen_addr);
    }

    #[tokio::test]
    async fn test_send_error_reply() {
        let listen = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send_error_reply(&listen, client.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 128];
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], FORWARD_ERROR_MESSAGE);
    }
}
