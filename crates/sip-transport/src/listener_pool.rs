//! # Listener pool
//!
//! A [`ListenerHandler`] runs the accept loop of one [`Listener`]. Each
//! accepted socket is upgraded (TLS handshake, WebSocket handshake, or
//! nothing) in its own tracked task and the resulting [`Connection`] is sent
//! to the pool output, where the owning protocol registers it in its
//! connection pool.
//!
//! An accept error ends the handler. The pool drops it and propagates the
//! error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, trace, warn};

#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

use crate::connection::{BoxedStream, Connection, ConnectionKey};
use crate::error::{Error, ErrorKind, Result};
use crate::network::Network;

/// Upper bound for the TLS and WebSocket handshakes of an accepted socket.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound TCP socket accepting connections of one network.
pub struct Listener {
    inner: TcpListener,
    network: Network,
    local_addr: SocketAddr,
    key: ConnectionKey,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
    closed: CancellationToken,
}

impl Listener {
    pub async fn bind(network: Network, addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Self::new(inner, network)
    }

    /// Wraps a bound listener. The key is `<network>:<local addr>`.
    pub fn new(inner: TcpListener, network: Network) -> Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Listener {
            inner,
            network,
            local_addr,
            key: ConnectionKey::new(network, local_addr),
            #[cfg(feature = "tls")]
            tls: None,
            closed: CancellationToken::new(),
        })
    }

    /// Runs a TLS handshake on every accepted socket.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            debug!(key = %self.key, "listener closed");
        }
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "use of closed listener",
            )),
            result = self.inner.accept() => result,
        };

        result.map_err(|source| Error::Connection {
            op: "accept",
            network: self.network.to_string(),
            local: self.local_addr.to_string(),
            remote: "<nil>".to_string(),
            source,
        })
    }

    /// Runs the handshakes of this listener's network on an accepted socket.
    pub async fn upgrade(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<Connection> {
        let local_addr = stream.local_addr().unwrap_or(self.local_addr);
        let stream = self.secure(stream).await?;

        if self.network.is_websocket() {
            return websocket_accept(stream, self.network, local_addr, remote_addr).await;
        }
        Ok(Connection::stream(stream, self.network, local_addr, remote_addr))
    }

    #[cfg(feature = "tls")]
    async fn secure(&self, stream: TcpStream) -> Result<BoxedStream> {
        match &self.tls {
            Some(acceptor) => {
                let stream: BoxedStream = Box::new(acceptor.accept(stream).await.map_err(Error::tls)?);
                Ok(stream)
            }
            None if self.network.secure() => Err(Error::tls(format!(
                "{} listener has no TLS configuration",
                self.network
            ))),
            None => {
                let stream: BoxedStream = Box::new(stream);
                Ok(stream)
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn secure(&self, stream: TcpStream) -> Result<BoxedStream> {
        if self.network.secure() {
            return Err(Error::UnsupportedProtocol(self.network.to_string()));
        }
        let stream: BoxedStream = Box::new(stream);
        Ok(stream)
    }
}

#[cfg(feature = "ws")]
async fn websocket_accept(
    stream: BoxedStream,
    network: Network,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) -> Result<Connection> {
    use http::HeaderValue;
    use http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    let negotiate = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
        let offers_sip = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|protocol| protocol.trim().eq_ignore_ascii_case("sip"));
        if offers_sip {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("sip"));
        }
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, negotiate)
        .await
        .map_err(Error::websocket)?;
    Ok(Connection::websocket(ws, network, local_addr, remote_addr))
}

#[cfg(not(feature = "ws"))]
async fn websocket_accept(
    _stream: BoxedStream,
    network: Network,
    _local_addr: SocketAddr,
    _remote_addr: SocketAddr,
) -> Result<Connection> {
    Err(Error::UnsupportedProtocol(network.to_string()))
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("key", &self.key)
            .field("network", &self.network)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serves one pooled listener.
#[derive(Debug)]
pub struct ListenerHandler {
    listener: Arc<Listener>,
    canceled: CancellationToken,
}

impl ListenerHandler {
    pub fn key(&self) -> &ConnectionKey {
        self.listener.key()
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn cancel(&self) {
        self.canceled.cancel();
        self.listener.close();
    }

    async fn accept_loop(
        self: Arc<Self>,
        tracker: TaskTracker,
        output: mpsc::Sender<Connection>,
        herrs: mpsc::Sender<Error>,
    ) {
        debug!("begin accepting connections");

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    if !self.canceled.is_cancelled() {
                        let err = self.handler_error(err);
                        tokio::select! {
                            _ = self.canceled.cancelled() => {}
                            _ = herrs.send(err) => {}
                        }
                    }
                    break;
                }
            };

            trace!(remote = %remote_addr, "connection accepted");

            let listener = self.listener.clone();
            let output = output.clone();
            let canceled = self.canceled.clone();
            tracker.spawn(
                async move {
                    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, listener.upgrade(stream, remote_addr));
                    let conn = tokio::select! {
                        _ = canceled.cancelled() => {
                            trace!(remote = %remote_addr, "handshake aborted");
                            return;
                        }
                        result = handshake => match result {
                            Ok(Ok(conn)) => conn,
                            Ok(Err(err)) => {
                                warn!(remote = %remote_addr, error = %err, "connection handshake failed");
                                return;
                            }
                            Err(_) => {
                                warn!(remote = %remote_addr, "connection handshake timed out");
                                return;
                            }
                        },
                    };
                    // a pending send dropped on cancel drops the connection with it
                    tokio::select! {
                        _ = canceled.cancelled() => {}
                        result = output.send(conn) => if let Err(mpsc::error::SendError(conn)) = result {
                            conn.close();
                        },
                    }
                }
                .in_current_span(),
            );
        }

        self.listener.close();
        debug!("stop accepting connections");
    }

    fn handler_error(&self, err: Error) -> Error {
        Error::ListenerHandler {
            key: self.key().clone(),
            network: self.listener.network().to_string(),
            addr: self.listener.local_addr().to_string(),
            source: Box::new(err),
        }
    }
}

struct PoolInner {
    store: RwLock<HashMap<ConnectionKey, Arc<ListenerHandler>>>,
    output: mpsc::Sender<Connection>,
    herrs: mpsc::Sender<Error>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    done: CancellationToken,
}

/// Keyed set of served listeners.
#[derive(Clone)]
pub struct ListenerPool {
    inner: Arc<PoolInner>,
}

impl ListenerPool {
    /// Creates the pool and starts its dispatcher. Accepted connections go to `output`.
    pub fn new(
        output: mpsc::Sender<Connection>,
        errs: mpsc::Sender<Error>,
        cancel: CancellationToken,
    ) -> Self {
        let (herrs, herrs_rx) = mpsc::channel(1);
        let pool = ListenerPool {
            inner: Arc::new(PoolInner {
                store: RwLock::new(HashMap::new()),
                output,
                herrs,
                cancel,
                tracker: TaskTracker::new(),
                done: CancellationToken::new(),
            }),
        };

        let dispatcher = pool.clone();
        tokio::spawn(
            dispatcher
                .serve(herrs_rx, errs)
                .instrument(info_span!("listener_pool")),
        );

        pool
    }

    async fn serve(self, mut herrs: mpsc::Receiver<Error>, errs: mpsc::Sender<Error>) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(err) = herrs.recv() => {
                    if let Some(err) = self.triage(err) {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = errs.send(err) => if result.is_err() {
                                trace!("error output closed, error dropped");
                            },
                        }
                    }
                }
            }
        }

        debug!("disposing listener pool");
        self.drop_all();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.done.cancel();
        debug!("listener pool disposed");
    }

    fn triage(&self, err: Error) -> Option<Error> {
        let key = err.handler_key()?.clone();
        if self.handler(&key).is_none() {
            trace!(%key, error = %err, "ignore error of a dropped listener handler");
            return None;
        }

        // the accept loop has ended either way
        self.remove(&key);
        match err.kind() {
            ErrorKind::Network | ErrorKind::Timeout => {
                debug!(%key, error = %err, "listener failed, dropped")
            }
            _ => trace!(%key, error = %err, "listener stopped, dropped"),
        }
        Some(err)
    }

    /// Registers a listener and starts its accept loop.
    pub fn put(&self, listener: Listener) -> Result<Arc<Listener>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::pool("put listener", "listener pool closed"));
        }
        if listener.key().is_empty() {
            return Err(Error::pool("put listener", "empty listener key"));
        }

        let listener = Arc::new(listener);
        let handler = {
            let mut store = self.inner.store.write();
            if store.contains_key(listener.key()) {
                return Err(Error::pool(
                    "put listener",
                    format!("key {} already exists in the pool", listener.key()),
                ));
            }
            let handler = Arc::new(ListenerHandler {
                listener: listener.clone(),
                canceled: self.inner.cancel.child_token(),
            });
            store.insert(listener.key().clone(), handler.clone());
            handler
        };

        let span = info_span!(
            "listener_handler",
            key = %listener.key(),
            network = %listener.network(),
        );
        self.inner.tracker.spawn(
            handler
                .accept_loop(
                    self.inner.tracker.clone(),
                    self.inner.output.clone(),
                    self.inner.herrs.clone(),
                )
                .instrument(span),
        );

        debug!(key = %listener.key(), "listener added to the pool");
        Ok(listener)
    }

    pub fn get(&self, key: &ConnectionKey) -> Result<Arc<Listener>> {
        self.handler(key)
            .map(|handler| handler.listener().clone())
            .ok_or_else(|| {
                Error::pool(
                    "get listener",
                    format!("listener {} not found in the pool", key),
                )
            })
    }

    fn handler(&self, key: &ConnectionKey) -> Option<Arc<ListenerHandler>> {
        self.inner.store.read().get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Listener>> {
        self.inner
            .store
            .read()
            .values()
            .map(|handler| handler.listener().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.read().is_empty()
    }

    pub fn drop_listener(&self, key: &ConnectionKey) -> Result<()> {
        if self.remove(key) {
            Ok(())
        } else {
            Err(Error::pool(
                "drop listener",
                format!("listener {} not found in the pool", key),
            ))
        }
    }

    fn remove(&self, key: &ConnectionKey) -> bool {
        let handler = self.inner.store.write().remove(key);
        match handler {
            Some(handler) => {
                handler.cancel();
                debug!(%key, "listener dropped from the pool");
                true
            }
            None => false,
        }
    }

    pub fn drop_all(&self) {
        let handlers: Vec<_> = self.inner.store.write().drain().collect();
        for (key, handler) in handlers {
            handler.cancel();
            trace!(%key, "listener dropped from the pool");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }
}

impl std::fmt::Debug for ListenerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerPool")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn pool() -> (ListenerPool, mpsc::Receiver<Connection>, CancellationToken) {
        let (ctx, crx) = mpsc::channel(10);
        let (etx, _erx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        (ListenerPool::new(ctx, etx, cancel.clone()), crx, cancel)
    }

    #[tokio::test]
    async fn test_accepted_connection_is_emitted() {
        let (pool, mut conns, _cancel) = pool();
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listener = pool.put(listener).unwrap();
        assert_eq!(listener.key().as_str(), format!("tcp:{}", listener.local_addr()));

        let client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let conn = conns.recv().await.unwrap();
        assert_eq!(conn.network(), Network::Tcp);
        assert_eq!(conn.remote_addr(), Some(client.local_addr().unwrap()));
        assert_eq!(
            conn.key().as_str(),
            format!("tcp:{}", client.local_addr().unwrap())
        );
    }

    #[tokio::test]
    async fn test_duplicate_listener_key() {
        let (pool, _conns, _cancel) = pool();
        let first = Listener::bind(Network::Tcp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = first.local_addr();
        pool.put(first).unwrap();

        // same key, different socket
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let mut second = Listener::new(TcpListener::from_std(std_listener).unwrap(), Network::Tcp).unwrap();
        second.key = ConnectionKey::new(Network::Tcp, addr);

        let err = pool.put(second).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        pool.drop_listener(&ConnectionKey::new(Network::Tcp, addr)).unwrap();
        assert!(pool.is_empty());
        assert!(pool.drop_listener(&ConnectionKey::new(Network::Tcp, addr)).is_err());
    }

    #[tokio::test]
    async fn test_cancel_closes_listeners() {
        let (pool, _conns, cancel) = pool();
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listener = pool.put(listener).unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool.done())
            .await
            .unwrap();
        assert!(listener.is_closed());
        assert!(pool.is_empty());
    }

    #[cfg(feature = "ws")]
    #[tokio::test]
    async fn test_cancel_aborts_stalled_handshake() {
        let (pool, mut conns, cancel) = pool();
        let listener = Listener::bind(Network::Ws, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listener = pool.put(listener).unwrap();

        // connects but never sends the HTTP upgrade
        let mut idle = TcpStream::connect(listener.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conns.try_recv().is_err());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool.done())
            .await
            .unwrap();
        assert!(pool.is_empty());
        let _ = idle.shutdown().await;
    }
}
