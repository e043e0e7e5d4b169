//! TCP exchange primitives.
//!
//! A TCP forward unit is framed by EOF: the request is everything the client
//! writes before half-closing, the reply is everything the backend writes
//! before closing. Every connect, read and write is bounded by a timeout.

use super::message::FORWARD_ERROR_MESSAGE;
use super::{ForwardError, ProxyResult};
use crate::backend::TCP_READ_CHUNK;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Connect to a backend server with timeout.
#[instrument(skip_all, fields(backend = %addr))]
pub async fn connect_to_backend(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, ForwardError> {
    debug!("connecting to backend");

    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY on backend connection");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(ForwardError::Connect(addr, e)),
        Err(_) => Err(ForwardError::ConnectTimeout(addr)),
    }
}

/// Read until the peer closes its write side.
///
/// Each individual read is bounded by `io_timeout`. When `budget` is set,
/// reading stops once that many bytes have arrived.
pub async fn read_to_end<R>(
    reader: &mut R,
    peer: SocketAddr,
    io_timeout: Duration,
    budget: Option<usize>,
) -> Result<Vec<u8>, ForwardError>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut chunk = vec![0u8; TCP_READ_CHUNK];

    loop {
        let want = match budget {
            Some(limit) if data.len() >= limit => break,
            Some(limit) => (limit - data.len()).min(chunk.len()),
            None => chunk.len(),
        };

        let n = match timeout(io_timeout, reader.read(&mut chunk[..want])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ForwardError::Io(e)),
            Err(_) => {
                return Err(ForwardError::Timeout {
                    peer,
                    stage: "reading",
                });
            }
        };

        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
    }

    Ok(data)
}

/// Write the whole buffer, bounded by `io_timeout`.
pub async fn write_all<W>(
    writer: &mut W,
    data: &[u8],
    peer: SocketAddr,
    io_timeout: Duration,
) -> Result<(), ForwardError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(io_timeout, async {
        writer.write_all(data).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => result.map_err(ForwardError::Io),
        Err(_) => Err(ForwardError::Timeout {
            peer,
            stage: "writing",
        }),
    }
}

/// One request/reply round trip on a fresh backend connection.
///
/// The write side is shut down after the request so the backend sees EOF.
pub async fn exchange(
    backend: SocketAddr,
    request: &[u8],
    io_timeout: Duration,
    budget: Option<usize>,
) -> Result<Vec<u8>, ForwardError> {
    let mut stream = connect_to_backend(backend, io_timeout).await?;

    write_all(&mut stream, request, backend, io_timeout).await?;
    stream.shutdown().await?;

    read_to_end(&mut stream, backend, io_timeout, budget).await
}

/// Relay one client connection through `backend`.
///
/// Reads the full request from the client, runs the backend exchange, writes
/// the reply back and shuts down the client's write side.
#[instrument(skip_all, fields(client = %client_addr, backend = %backend))]
pub async fn relay_connection(
    client: &mut TcpStream,
    client_addr: SocketAddr,
    backend: SocketAddr,
    io_timeout: Duration,
) -> Result<ProxyResult, ForwardError> {
    let request = read_to_end(client, client_addr, io_timeout, None).await?;
    let reply = exchange(backend, &request, io_timeout, None).await?;

    write_all(client, &reply, client_addr, io_timeout).await?;
    client.shutdown().await?;

    debug!(
        bytes_to_backend = request.len(),
        bytes_to_client = reply.len(),
        "TCP relay completed"
    );

    Ok(ProxyResult {
        bytes_to_backend: request.len() as u64,
        bytes_to_client: reply.len() as u64,
    })
}

/// Send the fixed error payload and close the client's write side.
pub async fn send_error_reply(
    client: &mut TcpStream,
    client_addr: SocketAddr,
    io_timeout: Duration,
) -> Result<(), ForwardError> {
    write_all(client, FORWARD_ERROR_MESSAGE, client_addr, io_timeout).await?;
    client.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Backend that reads to EOF and answers with `prefix` + request.
    async fn start_prefix_backend(prefix: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let _ = stream.read_to_end(&mut request).await;
                    let mut reply = prefix.to_vec();
                    reply.extend_from_slice(&request);
                    let _ = stream.write_all(&reply).await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_to_backend_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = connect_to_backend(addr, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_backend_unroutable() {
        // Non-routable: either times out or fails fast, depending on the host
        let addr: SocketAddr = "10.255.255.1:12345".parse().unwrap();

        let result = connect_to_backend(addr, Duration::from_millis(100)).await;
        match result.unwrap_err() {
            ForwardError::ConnectTimeout(_) | ForwardError::Connect(_, _) => {}
            e => panic!("expected connect failure, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_connect_to_backend_refused() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let result = connect_to_backend(addr, Duration::from_secs(5)).await;
        match result.unwrap_err() {
            ForwardError::Connect(_, _) => {}
            e => panic!("expected connect error, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_exchange_reads_until_close() {
        let backend = start_prefix_backend(b"re:").await;

        let reply = exchange(backend, b"ping", Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(reply, b"re:ping");
    }

    #[tokio::test]
    async fn test_exchange_budget_truncates() {
        let backend = start_prefix_backend(b"0123456789").await;

        let reply = exchange(backend, b"", Duration::from_secs(5), Some(4))
            .await
            .unwrap();
        assert_eq!(reply, b"0123");
    }

    #[tokio::test]
    async fn test_read_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and hold the connection open without writing
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result = exchange(addr, b"ping", Duration::from_millis(100), None).await;
        match result.unwrap_err() {
            ForwardError::Timeout { stage, .. } => assert_eq!(stage, "reading"),
            e => panic!("expected read timeout, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_relay_connection_round_trip() {
        let backend = start_prefix_backend(b"echo:").await;
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (mut client, client_addr) = front.accept().await.unwrap();
            relay_connection(&mut client, client_addr, backend, Duration::from_secs(5)).await
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"echo:abc");

        let result = relay.await.unwrap().unwrap();
        assert_eq!(result.bytes_to_backend, 3);
        assert_eq!(result.bytes_to_client, 8);
    }
}
