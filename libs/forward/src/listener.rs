//! Listener abstraction for listener-mode forwarding.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::session::DuplexStream;

/// A bound listener the forwarder can accept connections from.
///
/// The forwarder only borrows the listener; closing it stays with the caller.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Stream type of an accepted connection.
    type Conn: DuplexStream;

    /// Accept the next connection, returning it with a printable peer label.
    async fn accept(&self) -> io::Result<(Self::Conn, String)>;
}

#[async_trait]
impl ConnectionListener for TcpListener {
    type Conn = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Conn, String)> {
        let (stream, peer_addr) = TcpListener::accept(self).await?;
        Ok((stream, peer_addr.to_string()))
    }
}

#[cfg(unix)]
#[async_trait]
impl ConnectionListener for tokio::net::UnixListener {
    type Conn = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<(Self::Conn, String)> {
        let (stream, peer_addr) = tokio::net::UnixListener::accept(self).await?;
        let peer = peer_addr
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_accept_labels_peer_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut conn, peer) = ConnectionListener::accept(&listener).await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap().to_string());

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_accept_labels_unnamed_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forward.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (mut conn, peer) = ConnectionListener::accept(&listener).await.unwrap();
        assert_eq!(peer, "unnamed");

        conn.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
