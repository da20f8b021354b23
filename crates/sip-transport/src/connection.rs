//! # Connections
//!
//! A [`Connection`] wraps one socket: a UDP socket (datagram semantics), a
//! plain or TLS byte stream, or a WebSocket carrying SIP in text frames. The
//! rest of the stack only sees `read`/`write` for streams and
//! `read_from`/`write_to` for datagrams.
//!
//! Every I/O error is wrapped in [`Error::Connection`] with the network and
//! both addresses. [`Connection::close`] is idempotent and unblocks pending
//! reads, so a handler task waiting on the socket exits promptly.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(feature = "ws")]
use bytes::BytesMut;
#[cfg(feature = "ws")]
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
#[cfg(feature = "ws")]
use tokio_tungstenite::{WebSocketStream, tungstenite::Message as WsMessage};

use crate::error::{Error, Result};
use crate::network::Network;

/// Byte stream usable as a connection: TCP, TLS over TCP, ...
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[cfg(feature = "ws")]
pub type WsStream = WebSocketStream<BoxedStream>;

/// Unique key of a pooled connection or listener, `network:addr`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(network: Network, addr: impl fmt::Display) -> Self {
        ConnectionKey(format!("{}:{}", network, addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionKey {
    fn from(key: String) -> Self {
        ConnectionKey(key)
    }
}

impl From<&str> for ConnectionKey {
    fn from(key: &str) -> Self {
        ConnectionKey(key.to_string())
    }
}

enum Io {
    Datagram(UdpSocket),
    Stream {
        reader: Mutex<ReadHalf<BoxedStream>>,
        writer: Mutex<WriteHalf<BoxedStream>>,
    },
    #[cfg(feature = "ws")]
    WebSocket {
        reader: Mutex<WsReader>,
        writer: Mutex<SplitSink<WsStream, WsMessage>>,
    },
}

/// Frame reader presenting WebSocket messages as a byte stream.
#[cfg(feature = "ws")]
struct WsReader {
    stream: SplitStream<WsStream>,
    pending: BytesMut,
}

#[cfg(feature = "ws")]
impl WsReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                let chunk = self.pending.split_to(n);
                buf[..n].copy_from_slice(&chunk);
                return Ok(n);
            }

            match self.stream.next().await {
                None | Some(Ok(WsMessage::Close(_))) => return Ok(0),
                Some(Ok(WsMessage::Text(text))) => self.pending.extend_from_slice(text.as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => self.pending.extend_from_slice(&data),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
    }
}

/// One socket owned by a connection handler.
pub struct Connection {
    key: ConnectionKey,
    network: Network,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    io: Io,
    closed: CancellationToken,
}

impl Connection {
    /// Wraps a bound UDP socket. The key is `udp:<local addr>`.
    pub fn datagram(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Connection {
            key: ConnectionKey::new(Network::Udp, local_addr),
            network: Network::Udp,
            local_addr,
            remote_addr: None,
            io: Io::Datagram(socket),
            closed: CancellationToken::new(),
        })
    }

    /// Wraps a TCP or TLS stream. The key is `<network>:<remote addr>`.
    pub fn stream<S>(stream: S, network: Network, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self
    where
        S: AsyncStream + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        Connection {
            key: ConnectionKey::new(network, remote_addr),
            network,
            local_addr,
            remote_addr: Some(remote_addr),
            io: Io::Stream {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
            },
            closed: CancellationToken::new(),
        }
    }

    /// Wraps an upgraded WebSocket. The key is `<network>:<remote addr>`.
    #[cfg(feature = "ws")]
    pub fn websocket(ws: WsStream, network: Network, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (writer, reader) = ws.split();
        Connection {
            key: ConnectionKey::new(network, remote_addr),
            network,
            local_addr,
            remote_addr: Some(remote_addr),
            io: Io::WebSocket {
                reader: Mutex::new(WsReader {
                    stream: reader,
                    pending: BytesMut::new(),
                }),
                writer: Mutex::new(writer),
            },
            closed: CancellationToken::new(),
        }
    }

    /// Replaces the generated key.
    pub fn with_key(mut self, key: ConnectionKey) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn streamed(&self) -> bool {
        !matches!(self.io, Io::Datagram(_))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address; `None` for datagram sockets.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Reads stream data. `Ok(0)` means the peer closed the stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error("read")),
            result = self.read_inner(buf) => result,
        };
        result.map_err(|e| self.io_error("read", e))
    }

    async fn read_inner(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.io {
            Io::Datagram(socket) => socket.recv_from(buf).await.map(|(n, _)| n),
            Io::Stream { reader, .. } => reader.lock().await.read(buf).await,
            #[cfg(feature = "ws")]
            Io::WebSocket { reader, .. } => reader.lock().await.read(buf).await,
        }
    }

    /// Reads one datagram and its source address.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        match &self.io {
            Io::Datagram(socket) => {
                let result = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(self.closed_error("read")),
                    result = socket.recv_from(buf) => result,
                };
                result.map_err(|e| self.io_error("read", e))
            }
            _ => {
                let n = self.read(buf).await?;
                let remote = self
                    .remote_addr
                    .ok_or_else(|| self.closed_error("read"))?;
                Ok((n, remote))
            }
        }
    }

    /// Writes to the connected peer.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(self.closed_error("write"));
        }

        let result = match &self.io {
            Io::Datagram(socket) => match self.remote_addr {
                Some(addr) => socket.send_to(data, addr).await,
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "datagram connection has no remote address",
                )),
            },
            Io::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                match writer.write_all(data).await {
                    Ok(()) => writer.flush().await.map(|_| data.len()),
                    Err(e) => Err(e),
                }
            }
            #[cfg(feature = "ws")]
            Io::WebSocket { writer, .. } => {
                let text = String::from_utf8_lossy(data).into_owned();
                writer
                    .lock()
                    .await
                    .send(WsMessage::Text(text))
                    .await
                    .map(|_| data.len())
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            }
        };

        result.map_err(|e| self.io_error("write", e))
    }

    /// Writes a datagram to `addr`. Stream connections ignore `addr`.
    pub async fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        match &self.io {
            Io::Datagram(socket) => {
                if self.is_closed() {
                    return Err(self.closed_error("write"));
                }
                socket
                    .send_to(data, addr)
                    .await
                    .map_err(|e| self.io_error("write", e))
            }
            _ => self.write(data).await,
        }
    }

    /// Closes the connection and unblocks pending reads.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            debug!(key = %self.key, network = %self.network, "connection closed");
        }
    }

    fn remote_string(&self) -> String {
        self.remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "<nil>".to_string())
    }

    fn io_error(&self, op: &'static str, source: io::Error) -> Error {
        Error::Connection {
            op,
            network: self.network.to_string(),
            local: self.local_addr.to_string(),
            remote: self.remote_string(),
            source,
        }
    }

    fn closed_error(&self, op: &'static str) -> Error {
        self.io_error(
            op,
            io::Error::new(io::ErrorKind::NotConnected, "use of closed connection"),
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("network", &self.network)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("streamed", &self.streamed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.network, self.local_addr, self.remote_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_connection_key() {
        let addr: SocketAddr = "10.0.0.1:5060".parse().unwrap();
        assert_eq!(ConnectionKey::new(Network::Tcp, addr).as_str(), "tcp:10.0.0.1:5060");
        assert!(ConnectionKey::default().is_empty());
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let a = Connection::datagram(UdpSocket::bind("127.0.0.1:0").await.unwrap()).unwrap();
        let b = Connection::datagram(UdpSocket::bind("127.0.0.1:0").await.unwrap()).unwrap();
        assert!(!a.streamed());
        assert_eq!(a.key().as_str(), format!("udp:{}", a.local_addr()));

        a.write_to(b"ping", b.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr());
    }

    #[tokio::test]
    async fn test_stream_read_write_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();

        let conn = Connection::stream(server, Network::Tcp, addr, remote);
        assert!(conn.streamed());
        assert_eq!(conn.key().as_str(), format!("tcp:{}", remote));

        let mut client = client;
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        conn.write(b"world").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        drop(client);
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let conn = std::sync::Arc::new(
            Connection::datagram(UdpSocket::bind("127.0.0.1:0").await.unwrap()).unwrap(),
        );
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.read_from(&mut buf).await
            })
        };

        tokio::task::yield_now().await;
        conn.close();
        conn.close();

        let err = reader.await.unwrap().unwrap_err();
        assert!(err.is_network());
        assert!(conn.write_to(b"x", conn.local_addr()).await.is_err());
    }
}
