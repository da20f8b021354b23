//! # Connection pool
//!
//! Every pooled [`Connection`] is served by a [`ConnectionHandler`] running two
//! tasks: a read loop feeding a [`Parser`] and a pipe loop that annotates
//! parsed messages and forwards them. All handlers fan in to one dispatcher
//! task per pool, which forwards messages verbatim and triages handler errors:
//!
//! | Error kind        | Handler        | Upward           |
//! |-------------------|----------------|------------------|
//! | expired           | dropped if the lease really ran out | never |
//! | eof               | dropped        | never            |
//! | network, timeout  | dropped        | propagated       |
//! | anything else     | kept           | propagated       |
//!
//! Handlers with a non-zero TTL hold a sliding lease: every delivered message
//! pushes the expiry to `now + ttl`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sipflow_sip_core::{Message, Parser};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::config::{MapperDebug, MessageMapper};
use crate::connection::{Connection, ConnectionKey};
use crate::error::{Error, ErrorKind, Result};

/// Read buffer of a connection handler; large enough for any UDP datagram
const READ_BUFFER_SIZE: usize = 65535;

enum Incoming {
    Message(Message, Option<SocketAddr>),
    Error(Error),
}

/// Serves one pooled connection.
pub struct ConnectionHandler {
    connection: Arc<Connection>,
    ttl: Duration,
    expiry: Mutex<Option<Instant>>,
    canceled: CancellationToken,
}

impl ConnectionHandler {
    fn new(connection: Arc<Connection>, ttl: Duration, canceled: CancellationToken) -> Self {
        let expiry = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        ConnectionHandler {
            connection,
            ttl,
            expiry: Mutex::new(expiry),
            canceled,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        self.connection.key()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current lease deadline; `None` when the handler never expires.
    pub fn expiry(&self) -> Option<Instant> {
        *self.expiry.lock()
    }

    pub fn expired(&self) -> bool {
        self.expiry().is_some_and(|expiry| expiry <= Instant::now())
    }

    /// Stops both loops and closes the connection. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.canceled.cancel();
        self.connection.close();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_cancelled()
    }

    fn serve(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        hmess: mpsc::Sender<Message>,
        herrs: mpsc::Sender<Error>,
        mapper: Option<MessageMapper>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let span = info_span!(
            "connection_handler",
            key = %self.key(),
            network = %self.connection.network(),
        );

        tracker.spawn(self.clone().read_loop(tx).instrument(span.clone()));
        tracker.spawn(
            self.clone()
                .pipe_loop(rx, hmess, herrs, mapper)
                .instrument(span),
        );
    }

    async fn read_loop(self: Arc<Self>, tx: mpsc::Sender<Incoming>) {
        let conn = self.connection.clone();
        let streamed = conn.streamed();
        let mut parser = Parser::new(streamed);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        debug!("begin reading connection");

        'read: loop {
            let result = if streamed {
                conn.read(&mut buf).await.map(|n| (n, conn.remote_addr()))
            } else {
                conn.read_from(&mut buf)
                    .await
                    .map(|(n, addr)| (n, Some(addr)))
            };

            let (n, raddr) = match result {
                Ok(read) => read,
                Err(err) => {
                    if !self.is_canceled() {
                        self.forward(&tx, Incoming::Error(err)).await;
                    }
                    break;
                }
            };

            if n == 0 {
                if streamed {
                    let err = Error::Eof {
                        network: conn.network().to_string(),
                        key: conn.key().clone(),
                    };
                    self.forward(&tx, Incoming::Error(err)).await;
                    break;
                }
                continue;
            }

            let data = &buf[..n];
            if data.iter().all(|b| *b == 0) {
                trace!("skip empty data");
                continue;
            }
            if !streamed && data.iter().all(|b| *b == 0 || b.is_ascii_whitespace()) {
                trace!("skip keep-alive datagram");
                continue;
            }

            trace!(size = n, remote = ?raddr, "data received");

            if let Err(err) = parser.write(data) {
                if !self.forward(&tx, Incoming::Error(err.into())).await {
                    break;
                }
                continue;
            }

            while let Some(result) = parser.next_message() {
                let incoming = match result {
                    Ok(msg) => Incoming::Message(msg, raddr),
                    Err(err) => Incoming::Error(err.into()),
                };
                if !self.forward(&tx, incoming).await {
                    break 'read;
                }
            }
        }

        parser.stop();
        conn.close();
        debug!("stop reading connection");
    }

    async fn forward(&self, tx: &mpsc::Sender<Incoming>, incoming: Incoming) -> bool {
        tokio::select! {
            biased;
            _ = self.canceled.cancelled() => false,
            result = tx.send(incoming) => result.is_ok(),
        }
    }

    async fn pipe_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Incoming>,
        hmess: mpsc::Sender<Message>,
        herrs: mpsc::Sender<Error>,
        mapper: Option<MessageMapper>,
    ) {
        let deadline = self.expiry().unwrap_or_else(Instant::now);
        let mut armed = !self.ttl.is_zero();
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = self.canceled.cancelled() => break,
                _ = &mut timer, if armed => {
                    armed = false;
                    trace!("connection lease timer fired");
                    let err = self.handler_error(Error::Expired(self.key().clone()));
                    if !self.send(&herrs, err).await {
                        break;
                    }
                }
                incoming = rx.recv() => match incoming {
                    None => break,
                    Some(Incoming::Message(msg, raddr)) => {
                        let Some(msg) = self.annotate(msg, raddr, mapper.as_ref()) else {
                            continue;
                        };
                        trace!(message = %msg.short(), "message received");
                        if !self.send(&hmess, msg).await {
                            break;
                        }
                        if !self.ttl.is_zero() {
                            let deadline = Instant::now() + self.ttl;
                            *self.expiry.lock() = Some(deadline);
                            timer.as_mut().reset(deadline);
                            armed = true;
                        }
                    }
                    Some(Incoming::Error(err)) => {
                        let err = self.handler_error(err);
                        if !self.send(&herrs, err).await {
                            break;
                        }
                    }
                },
            }
        }

        debug!("stop piping connection");
    }

    async fn send<T>(&self, tx: &mpsc::Sender<T>, item: T) -> bool {
        tokio::select! {
            biased;
            _ = self.canceled.cancelled() => false,
            result = tx.send(item) => result.is_ok(),
        }
    }

    /// Attaches transport metadata and, for requests, fixes up the top Via hop.
    fn annotate(
        &self,
        mut msg: Message,
        raddr: Option<SocketAddr>,
        mapper: Option<&MessageMapper>,
    ) -> Option<Message> {
        let conn = &self.connection;
        msg.set_destination(conn.local_addr().to_string());

        let mut source = raddr.map(|addr| addr.to_string()).unwrap_or_default();
        if msg.is_request() {
            let Some(hop) = msg.via_hop_mut() else {
                warn!(message = %msg.short(), "ignore message without 'Via' header");
                return None;
            };

            if let Some(raddr) = raddr {
                let rhost = raddr.ip().to_string();
                if hop.host != rhost {
                    hop.params.add("received", Some(rhost));
                }
                if hop.params.has("rport") {
                    hop.params.add("rport", Some(raddr.port().to_string()));
                } else if !conn.streamed() {
                    let port = hop.port.unwrap_or_else(|| conn.network().default_port());
                    source = SocketAddr::new(raddr.ip(), port).to_string();
                }
            }
        }

        msg.set_transport(conn.network().as_via_transport());
        msg.set_source(source);

        Some(match mapper {
            Some(mapper) => mapper(msg),
            None => msg,
        })
    }

    fn handler_error(&self, err: Error) -> Error {
        let conn = &self.connection;
        Error::ConnectionHandler {
            key: conn.key().clone(),
            network: conn.network().to_string(),
            local: conn.local_addr().to_string(),
            remote: conn
                .remote_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "<nil>".to_string()),
            source: Box::new(err),
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("connection", &self.connection)
            .field("ttl", &self.ttl)
            .field("expiry", &self.expiry())
            .finish()
    }
}

struct PoolInner {
    store: RwLock<HashMap<ConnectionKey, Arc<ConnectionHandler>>>,
    mapper: Option<MessageMapper>,
    hmess: mpsc::Sender<Message>,
    herrs: mpsc::Sender<Error>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    done: CancellationToken,
}

/// Keyed set of served connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool and starts its dispatcher.
    ///
    /// Parsed messages go to `output`, triaged errors to `errs`. Canceling
    /// `cancel` drops every handler; [`ConnectionPool::done`] resolves once
    /// all handler tasks have exited.
    pub fn new(
        output: mpsc::Sender<Message>,
        errs: mpsc::Sender<Error>,
        cancel: CancellationToken,
        mapper: Option<MessageMapper>,
    ) -> Self {
        let (hmess, hmess_rx) = mpsc::channel(1);
        let (herrs, herrs_rx) = mpsc::channel(1);

        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                store: RwLock::new(HashMap::new()),
                mapper,
                hmess,
                herrs,
                cancel,
                tracker: TaskTracker::new(),
                done: CancellationToken::new(),
            }),
        };

        let dispatcher = pool.clone();
        tokio::spawn(
            dispatcher
                .serve(hmess_rx, herrs_rx, output, errs)
                .instrument(info_span!("connection_pool")),
        );

        pool
    }

    async fn serve(
        self,
        mut hmess: mpsc::Receiver<Message>,
        mut herrs: mpsc::Receiver<Error>,
        output: mpsc::Sender<Message>,
        errs: mpsc::Sender<Error>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(msg) = hmess.recv() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = output.send(msg) => if result.is_err() {
                            trace!("message output closed, message dropped");
                        },
                    }
                }
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

        self.dispose().await;
    }

    async fn dispose(&self) {
        debug!("disposing connection pool");
        self.drop_all();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.done.cancel();
        debug!("connection pool disposed");
    }

    /// Decides what to do with a handler error and returns it if it goes upward.
    fn triage(&self, err: Error) -> Option<Error> {
        let Some(key) = err.handler_key().cloned() else {
            trace!(error = %err, "ignore non-handler error");
            return None;
        };
        let Some(handler) = self.handler(&key) else {
            trace!(%key, error = %err, "ignore error of a dropped connection handler");
            return None;
        };

        match err.kind() {
            ErrorKind::Expired => {
                if handler.expired() {
                    debug!(%key, "connection expired, dropping");
                    self.remove(&key);
                } else {
                    trace!(%key, "ignore spurious expiry");
                }
                None
            }
            ErrorKind::Eof => {
                if self.inner.cancel.is_cancelled() {
                    return None;
                }
                debug!(%key, "connection closed by remote side, dropping");
                self.remove(&key);
                None
            }
            ErrorKind::Network | ErrorKind::Timeout => {
                debug!(%key, error = %err, "connection failed, dropping");
                self.remove(&key);
                Some(err)
            }
            _ => Some(err),
        }
    }

    /// Registers and starts serving a connection.
    ///
    /// `ttl` of zero means the connection never expires.
    pub fn put(&self, connection: Connection, ttl: Duration) -> Result<Arc<Connection>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::pool("put connection", "connection pool closed"));
        }
        if connection.key().is_empty() {
            return Err(Error::pool("put connection", "empty connection key"));
        }

        let connection = Arc::new(connection);
        let handler = {
            let mut store = self.inner.store.write();
            if store.contains_key(connection.key()) {
                return Err(Error::pool(
                    "put connection",
                    format!("key {} already exists in the pool", connection.key()),
                ));
            }
            let handler = Arc::new(ConnectionHandler::new(
                connection.clone(),
                ttl,
                self.inner.cancel.child_token(),
            ));
            store.insert(connection.key().clone(), handler.clone());
            handler
        };

        handler.serve(
            &self.inner.tracker,
            self.inner.hmess.clone(),
            self.inner.herrs.clone(),
            self.inner.mapper.clone(),
        );

        debug!(key = %connection.key(), ?ttl, "connection added to the pool");
        Ok(connection)
    }

    pub fn get(&self, key: &ConnectionKey) -> Result<Arc<Connection>> {
        self.handler(key)
            .map(|handler| handler.connection().clone())
            .ok_or_else(|| {
                Error::pool(
                    "get connection",
                    format!("connection {} not found in the pool", key),
                )
            })
    }

    pub fn handler(&self, key: &ConnectionKey) -> Option<Arc<ConnectionHandler>> {
        self.inner.store.read().get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner
            .store
            .read()
            .values()
            .map(|handler| handler.connection().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.read().is_empty()
    }

    /// Cancels and removes a handler.
    pub fn drop_connection(&self, key: &ConnectionKey) -> Result<()> {
        if self.remove(key) {
            Ok(())
        } else {
            Err(Error::pool(
                "drop connection",
                format!("connection {} not found in the pool", key),
            ))
        }
    }

    fn remove(&self, key: &ConnectionKey) -> bool {
        let handler = self.inner.store.write().remove(key);
        match handler {
            Some(handler) => {
                handler.cancel();
                debug!(%key, "connection dropped from the pool");
                true
            }
            None => false,
        }
    }

    pub fn drop_all(&self) {
        let handlers: Vec<_> = self.inner.store.write().drain().collect();
        for (key, handler) in handlers {
            handler.cancel();
            trace!(%key, "connection dropped from the pool");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the pool has been canceled and every handler task has exited.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("len", &self.len())
            .field("mapper", &MapperDebug(&self.inner.mapper))
            .field("closed", &self.is_closed())
            .finish()
    }
}
