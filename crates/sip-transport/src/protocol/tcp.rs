use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sipflow_sip_core::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

#[cfg(feature = "tls")]
use tokio_rustls::TlsConnector;

use super::{Protocol, ProtocolContext, resolve_listen_addr, resolve_send_addr};
use crate::config::{ListenOptions, TransportConfig};
use crate::connection::{BoxedStream, Connection, ConnectionKey};
use crate::connection_pool::ConnectionPool;
use crate::error::{Error, Result};
use crate::listener_pool::{Listener, ListenerPool};
use crate::network::Network;
use crate::target::Target;

/// Pools and dial/listen plumbing shared by the connection-oriented protocols.
pub(crate) struct StreamCore {
    network: Network,
    config: Arc<TransportConfig>,
    connections: ConnectionPool,
    listeners: ListenerPool,
    #[cfg(feature = "tls")]
    connector: Option<TlsConnector>,
    done: CancellationToken,
}

impl StreamCore {
    pub(crate) fn new(network: Network, ctx: ProtocolContext) -> Result<Self> {
        #[cfg(feature = "tls")]
        let connector = if network.secure() {
            Some(crate::tls::connector(&ctx.config.tls)?)
        } else {
            None
        };
        if cfg!(not(feature = "tls")) && network.secure() {
            return Err(Error::UnsupportedProtocol(network.to_string()));
        }

        let cancel = ctx.cancel.child_token();
        let (accepted, accepted_rx) = mpsc::channel(1);
        let connections = ConnectionPool::new(ctx.output, ctx.errs.clone(), cancel.clone(), ctx.mapper);
        let listeners = ListenerPool::new(accepted, ctx.errs, cancel.clone());
        let done = CancellationToken::new();

        tokio::spawn(
            relay(
                accepted_rx,
                connections.clone(),
                listeners.clone(),
                ctx.config.connection_ttl,
                cancel,
                done.clone(),
            )
            .instrument(info_span!("protocol", %network)),
        );

        Ok(StreamCore {
            network,
            config: ctx.config,
            connections,
            listeners,
            #[cfg(feature = "tls")]
            connector,
            done,
        })
    }

    pub(crate) fn network(&self) -> Network {
        self.network
    }

    pub(crate) async fn listen(&self, target: &Target, options: &ListenOptions) -> Result<SocketAddr> {
        let addr = resolve_listen_addr(self.network, target).await?;

        #[cfg(feature = "tls")]
        let acceptor = if self.network.secure() {
            let tls = options.tls.as_ref().ok_or_else(|| {
                Error::tls(format!("{} listener requires a certificate and a key", self.network))
            })?;
            Some(crate::tls::acceptor(tls)?)
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        let _ = options;

        let listener = Listener::bind(self.network, addr).await?;
        #[cfg(feature = "tls")]
        let listener = match acceptor {
            Some(acceptor) => listener.with_tls(acceptor),
            None => listener,
        };

        let listener = self.listeners.put(listener)?;
        info!(local = %listener.local_addr(), network = %self.network, "begin listening");
        Ok(listener.local_addr())
    }

    pub(crate) async fn resolve(&self, target: &Target) -> Result<SocketAddr> {
        resolve_send_addr(self.network, target).await
    }

    /// Pooled connection to `addr`, if any.
    pub(crate) fn pooled(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.get(&ConnectionKey::new(self.network, addr)).ok()
    }

    /// Opens a TCP connection to `addr`, wrapped in TLS for secure networks.
    /// Returns the stream and its local address.
    pub(crate) async fn connect(&self, addr: SocketAddr, target: &Target) -> Result<(BoxedStream, SocketAddr)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::Connection {
                op: "dial",
                network: self.network.to_string(),
                local: "<nil>".to_string(),
                remote: addr.to_string(),
                source,
            })?;
        let local_addr = stream.local_addr()?;
        debug!(%local_addr, remote = %addr, network = %self.network, "connection dialed");

        Ok((self.secure(stream, target).await?, local_addr))
    }

    #[cfg(feature = "tls")]
    async fn secure(&self, stream: TcpStream, target: &Target) -> Result<BoxedStream> {
        let Some(connector) = &self.connector else {
            let stream: BoxedStream = Box::new(stream);
            return Ok(stream);
        };
        let name = self
            .config
            .tls
            .server_name
            .as_deref()
            .unwrap_or(target.host.as_str());
        let stream = connector
            .connect(crate::tls::server_name(name)?, stream)
            .await
            .map_err(Error::tls)?;
        let stream: BoxedStream = Box::new(stream);
        Ok(stream)
    }

    #[cfg(not(feature = "tls"))]
    async fn secure(&self, stream: TcpStream, _target: &Target) -> Result<BoxedStream> {
        let stream: BoxedStream = Box::new(stream);
        Ok(stream)
    }

    /// Pools a dialed connection with the configured lease.
    pub(crate) fn register(&self, connection: Connection) -> Result<Arc<Connection>> {
        let key = connection.key().clone();
        match self.connections.put(connection, self.config.connection_ttl) {
            Ok(conn) => Ok(conn),
            // a concurrent send dialed the same address first
            Err(err) => self.connections.get(&key).map_err(|_| err),
        }
    }

    pub(crate) async fn write(&self, conn: &Connection, message: &Message) -> Result<()> {
        trace!(key = %conn.key(), message = %message.short(), "sending message");
        conn.write(&message.to_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn done(&self) {
        self.done.cancelled().await
    }
}

impl fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCore")
            .field("network", &self.network)
            .field("connections", &self.connections)
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Registers accepted connections until canceled, then waits for both pools.
async fn relay(
    mut accepted: mpsc::Receiver<Connection>,
    connections: ConnectionPool,
    listeners: ListenerPool,
    ttl: std::time::Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            conn = accepted.recv() => match conn {
                Some(conn) => {
                    let key = conn.key().clone();
                    if let Err(err) = connections.put(conn, ttl) {
                        warn!(%key, error = %err, "accepted connection rejected");
                    }
                }
                None => break,
            },
        }
    }

    accepted.close();
    while let Some(conn) = accepted.recv().await {
        conn.close();
    }

    listeners.done().await;
    connections.done().await;
    done.cancel();
    debug!("protocol disposed");
}

/// SIP over TCP, or over TLS for [`Network::Tls`].
#[derive(Debug)]
pub struct TcpProtocol {
    core: StreamCore,
}

impl TcpProtocol {
    pub fn new(network: Network, ctx: ProtocolContext) -> Result<Self> {
        match network {
            Network::Tcp | Network::Tls => Ok(TcpProtocol {
                core: StreamCore::new(network, ctx)?,
            }),
            _ => Err(Error::UnsupportedProtocol(network.to_string())),
        }
    }
}

#[async_trait]
impl Protocol for TcpProtocol {
    fn network(&self) -> Network {
        self.core.network()
    }

    async fn listen(&self, target: &Target, options: &ListenOptions) -> Result<SocketAddr> {
        self.core.listen(target, options).await
    }

    async fn send(&self, target: &Target, message: &Message) -> Result<()> {
        let addr = self.core.resolve(target).await?;
        let conn = match self.core.pooled(addr) {
            Some(conn) => conn,
            None => {
                let (stream, local_addr) = self.core.connect(addr, target).await?;
                self.core
                    .register(Connection::stream(stream, self.core.network(), local_addr, addr))?
            }
        };
        self.core.write(&conn, message).await
    }

    async fn done(&self) {
        self.core.done().await
    }
}
