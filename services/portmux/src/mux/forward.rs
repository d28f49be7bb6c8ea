//! Backend connection and bidirectional splicing.
//!
//! The buffered payload is replayed to the backend before any further client
//! bytes, then both directions are copied without interpretation until each
//! side has closed. An I/O error in either direction tears down both.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::debug;

use super::classify::Target;
use crate::error::{MuxError, Result};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default idle timeout (none for raw TCP).
///
/// When set, the deadline is shared by both directions: traffic either way
/// keeps the connection alive.
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Copy buffer size per direction.
const SPLICE_BUF_SIZE: usize = 8192;

/// The two backend listeners a connection can be forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backends {
    /// Plaintext application listener.
    pub plain: SocketAddr,
    /// TLS-terminating application listener.
    pub tls: SocketAddr,
}

impl Backends {
    /// Backends listening on IPv4 loopback.
    pub fn loopback(plain_port: u16, tls_port: u16) -> Self {
        Self::on_host(IpAddr::V4(Ipv4Addr::LOCALHOST), plain_port, tls_port)
    }

    /// Backends listening on the given host.
    pub fn on_host(host: IpAddr, plain_port: u16, tls_port: u16) -> Self {
        Self {
            plain: SocketAddr::new(host, plain_port),
            tls: SocketAddr::new(host, tls_port),
        }
    }

    /// Address of the listener for `target`.
    pub fn addr_for(&self, target: Target) -> SocketAddr {
        match target {
            Target::Plain => self.plain,
            Target::Tls => self.tls,
        }
    }
}

/// Bytes moved over a forwarded connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Client to backend, including the replayed payload.
    pub bytes_to_backend: u64,
    /// Backend to client.
    pub bytes_from_backend: u64,
}

/// Connect to a backend within `connect_timeout`.
pub async fn connect_backend(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    debug!(backend_addr = %addr, "Connecting to backend");

    let result = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    };

    result.map_err(|source| MuxError::BackendUnreachable { addr, source })
}

/// Forward a classified client connection to `backend_addr`.
///
/// `payload` holds the bytes already read from the client after header
/// stripping; they reach the backend first, in order. If the backend cannot
/// be reached the error is returned and the caller drops the client.
pub async fn forward(
    client: &mut TcpStream,
    backend_addr: SocketAddr,
    payload: &[u8],
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
) -> Result<SpliceStats> {
    let mut backend = connect_backend(backend_addr, connect_timeout).await?;
    debug!(backend_addr = %backend_addr, "Connected to backend");

    if !payload.is_empty() {
        backend.write_all(payload).await?;
    }

    let (to_backend, from_backend) = splice(client, &mut backend, idle_timeout).await?;

    Ok(SpliceStats {
        bytes_to_backend: payload.len() as u64 + to_backend,
        bytes_from_backend: from_backend,
    })
}

/// Copy data bidirectionally between two streams.
///
/// Returns (bytes_to_b, bytes_from_b). End-of-stream on one side shuts down
/// the write half of the other; the first error aborts both directions.
/// With `idle_timeout` set, the connection is torn down once neither
/// direction has moved a byte for that long.
pub async fn splice(
    a: &mut TcpStream,
    b: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)> {
    let (mut a_read, mut a_write) = a.split();
    let (mut b_read, mut b_write) = b.split();
    let activity = Activity::new();

    let copies = async {
        tokio::try_join!(
            copy_half(&mut a_read, &mut b_write, &activity),
            copy_half(&mut b_read, &mut a_write, &activity),
        )
    };

    match idle_timeout {
        Some(idle) => tokio::select! {
            result = copies => result,
            err = activity.expired(idle) => Err(err),
        },
        None => copies.await,
    }
}

/// Last time either splice direction moved bytes.
struct Activity {
    start: Instant,
    /// Milliseconds after `start`.
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Resolves once no bytes have moved for `idle`.
    async fn expired(&self, idle: Duration) -> io::Error {
        loop {
            let last = self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = last + idle;
            if Instant::now() >= deadline {
                return io::Error::new(io::ErrorKind::TimedOut, "idle timeout");
            }
            sleep_until(deadline).await;
        }
    }
}

/// Copy one direction until EOF, then shut down the writer.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; SPLICE_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    // Peer may already be gone; the other direction reports its own errors.
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_backends_loopback() {
        let backends = Backends::loopback(4001, 4002);
        assert_eq!(backends.addr_for(Target::Plain).to_string(), "127.0.0.1:4001");
        assert_eq!(backends.addr_for(Target::Tls).to_string(), "127.0.0.1:4002");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let temp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = temp.local_addr().unwrap();
        drop(temp);

        let err = connect_backend(dead_addr, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            MuxError::BackendUnreachable { addr, .. } => assert_eq!(addr, dead_addr),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_replayed_before_client_bytes() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            received
        });

        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(front_addr).await.unwrap();
            stream.write_all(b" world").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (mut client, _) = front.accept().await.unwrap();
        let stats = forward(
            &mut client,
            backend_addr,
            b"hello",
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_IDLE_TIMEOUT,
        )
        .await
        .unwrap();
        drop(client);

        assert_eq!(backend_task.await.unwrap(), b"hello world");
        assert_eq!(client_task.await.unwrap(), b"pong");
        assert_eq!(
            stats,
            SpliceStats {
                bytes_to_backend: 11,
                bytes_from_backend: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        // Both peers stay silent and open
        let _backend_task = tokio::spawn(async move {
            let (stream, _) = backend.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let _client = TcpStream::connect(front_addr).await.unwrap();

        let (mut client, _) = front.accept().await.unwrap();
        let err = forward(
            &mut client,
            backend_addr,
            b"",
            DEFAULT_CONNECT_TIMEOUT,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

        match err {
            MuxError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_one_way_traffic_keeps_connection_alive() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        // Backend only consumes; it never writes
        let backend_task = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received.len()
        });

        // Upload outlasts the idle timeout several times over
        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(front_addr).await.unwrap();
            for _ in 0..10 {
                stream.write_all(&[0xAB; 100]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            stream.shutdown().await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (mut client, _) = front.accept().await.unwrap();
        let stats = forward(
            &mut client,
            backend_addr,
            b"",
            DEFAULT_CONNECT_TIMEOUT,
            Some(Duration::from_millis(150)),
        )
        .await
        .unwrap();
        drop(client);

        assert_eq!(stats.bytes_to_backend, 1000);
        assert_eq!(stats.bytes_from_backend, 0);
        assert_eq!(backend_task.await.unwrap(), 1000);
        assert!(client_task.await.unwrap().is_empty());
    }
}
