/// Byte-stream transport for the command socket
///
/// Moves whole buffers across the connection in chunks of at most
/// `NET_MAX_LENGTH` bytes. Reads are bounded by the receive timeout and every
/// failure is final for the connection: the protocol has no way to resume a
/// half-transferred exchange.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpSocket;

use crate::wire::NET_MAX_LENGTH;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connecting to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("no data received within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by the peer")]
    Closed,
    #[error("send made no progress")]
    NoProgress,
    #[error("previous exchange was abandoned mid-transfer")]
    Desynchronized,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Anything the command channel can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub struct Transport {
    stream: Box<dyn ByteStream>,
    recv_timeout: Duration,
}

impl Transport {
    /// Open the command connection.
    pub async fn connect(
        endpoint: SocketAddr,
        connect_timeout: Duration,
        recv_timeout: Duration,
    ) -> Result<Self> {
        log::debug!("Connecting to debug stub at {}", endpoint);

        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_recv_buffer_size(NET_MAX_LENGTH as u32)?;
        socket.set_send_buffer_size(NET_MAX_LENGTH as u32)?;

        let stream = tokio::time::timeout(connect_timeout, socket.connect(endpoint))
            .await
            .map_err(|_| TransportError::ConnectTimeout(endpoint))??;
        stream.set_nodelay(true)?;

        log::debug!("Connected to {}", endpoint);
        Ok(Self::from_stream(stream, recv_timeout))
    }

    pub fn from_stream<S: ByteStream + 'static>(stream: S, recv_timeout: Duration) -> Self {
        Self {
            stream: Box::new(stream),
            recv_timeout,
        }
    }

    /// Write all of `data`, at most `NET_MAX_LENGTH` bytes per write.
    pub async fn send_exact(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + NET_MAX_LENGTH).min(data.len());
            let sent = self.stream.write(&data[offset..end]).await?;
            if sent == 0 {
                return Err(TransportError::NoProgress);
            }
            offset += sent;
        }
        self.stream.flush().await?;
        log::trace!("SEND: {} bytes", data.len());
        Ok(())
    }

    /// Read exactly `len` bytes, failing if any single read exceeds the receive timeout.
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let limit = self.recv_timeout;
        self.recv_with(len, Some(limit)).await
    }

    /// Like [`Transport::recv_exact`] but without a timeout, for responses
    /// whose arrival time depends on work done by the stub.
    pub async fn recv_exact_unbounded(&mut self, len: usize) -> Result<Vec<u8>> {
        self.recv_with(len, None).await
    }

    /// `len` comes from the peer, so the buffer grows with what actually
    /// arrives instead of being allocated up front.
    async fn recv_with(&mut self, len: usize, limit: Option<Duration>) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(NET_MAX_LENGTH));
        let mut chunk = vec![0u8; len.min(NET_MAX_LENGTH)];
        while buf.len() < len {
            let want = (len - buf.len()).min(NET_MAX_LENGTH);
            let read = self.stream.read(&mut chunk[..want]);
            let received = match limit {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| TransportError::Timeout(limit))??,
                None => read.await?,
            };
            if received == 0 {
                return Err(TransportError::Closed);
            }
            buf.extend_from_slice(&chunk[..received]);
        }
        log::trace!("RECV: {} bytes", len);
        Ok(buf)
    }

    pub async fn recv_u32(&mut self) -> Result<u32> {
        let bytes = self.recv_exact(4).await?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub async fn recv_i32(&mut self) -> Result<i32> {
        Ok(self.recv_u32().await? as i32)
    }

    /// Orderly shutdown of the write side; the socket closes on drop.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn send_exact_survives_partial_writes() {
        // A 64-byte pipe forces many short writes.
        let (client, mut peer) = duplex(64);
        let mut transport = Transport::from_stream(client, TIMEOUT);
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; expected.len()];
            peer.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        });

        transport.send_exact(&payload).await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn recv_exact_collects_fragments() {
        let (client, mut peer) = duplex(16);
        let mut transport = Transport::from_stream(client, TIMEOUT);

        tokio::spawn(async move {
            for chunk in (0u8..100).collect::<Vec<_>>().chunks(7) {
                peer.write_all(chunk).await.unwrap();
            }
        });

        let got = transport.recv_exact(100).await.unwrap();
        assert_eq!(got, (0u8..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, _peer) = duplex(16);
        let mut transport = Transport::from_stream(client, Duration::from_millis(50));

        let err = transport.recv_exact(4).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (client, mut peer) = duplex(16);
        let mut transport = Transport::from_stream(client, TIMEOUT);
        peer.write_all(&[1, 2]).await.unwrap();
        drop(peer);

        let err = transport.recv_exact(4).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn huge_length_from_a_closed_peer_fails_cleanly() {
        let (client, mut peer) = duplex(16);
        let mut transport = Transport::from_stream(client, TIMEOUT);
        peer.write_all(&[7; 10]).await.unwrap();
        drop(peer);

        let err = transport.recv_exact(usize::MAX / 2).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn refused_connection_is_an_io_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Transport::connect(addr, TIMEOUT, TIMEOUT).await.err().unwrap();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
