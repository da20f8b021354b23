//! # Protocols
//!
//! One [`Protocol`] per network. Each owns its connection pool (and, for
//! connection-oriented networks, a listener pool) and writes parsed messages
//! and triaged errors into the channels of its [`ProtocolContext`].
//!
//! | Network | Type            | Listen              | Send                          |
//! |---------|-----------------|---------------------|-------------------------------|
//! | udp     | [`UdpProtocol`] | bound socket        | bound socket with source port |
//! | tcp/tls | [`TcpProtocol`] | listener pool       | pooled or dialed connection   |
//! | ws/wss  | [`WsProtocol`]  | listener pool + upgrade | pooled or dialed connection |

mod tcp;
mod udp;
#[cfg(feature = "ws")]
mod ws;

pub use tcp::TcpProtocol;
pub use udp::UdpProtocol;
#[cfg(feature = "ws")]
pub use ws::WsProtocol;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sipflow_sip_core::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ListenOptions, MapperDebug, MessageMapper, TransportConfig};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::target::Target;

/// Transport of one network.
#[async_trait]
pub trait Protocol: Send + Sync + fmt::Debug {
    fn network(&self) -> Network;

    /// The transport itself retransmits and orders data
    fn reliable(&self) -> bool {
        self.network().reliable()
    }

    fn streamed(&self) -> bool {
        self.network().streamed()
    }

    /// Starts listening on `target` and returns the bound address.
    async fn listen(&self, target: &Target, options: &ListenOptions) -> Result<SocketAddr>;

    /// Sends a message to `target`, reusing a pooled connection when possible.
    async fn send(&self, target: &Target, message: &Message) -> Result<()>;

    /// Resolves once the protocol has been canceled and fully shut down.
    async fn done(&self);
}

/// Everything a protocol shares with the transport layer.
#[derive(Clone)]
pub struct ProtocolContext {
    pub output: mpsc::Sender<Message>,
    pub errs: mpsc::Sender<Error>,
    pub cancel: CancellationToken,
    pub mapper: Option<MessageMapper>,
    pub config: Arc<TransportConfig>,
}

impl fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("mapper", &MapperDebug(&self.mapper))
            .field("config", &self.config)
            .finish()
    }
}

/// Creates the protocol of `network`.
pub fn new_protocol(network: Network, ctx: ProtocolContext) -> Result<Arc<dyn Protocol>> {
    match network {
        Network::Udp => Ok(Arc::new(UdpProtocol::new(ctx))),
        Network::Tcp | Network::Tls => Ok(Arc::new(TcpProtocol::new(network, ctx)?)),
        #[cfg(feature = "ws")]
        Network::Ws | Network::Wss => Ok(Arc::new(WsProtocol::new(network, ctx)?)),
        #[cfg(not(feature = "ws"))]
        Network::Ws | Network::Wss => Err(Error::UnsupportedProtocol(network.to_string())),
    }
}

/// Address to bind for `target`; empty host and port take the network defaults.
pub(crate) async fn resolve_listen_addr(network: Network, target: &Target) -> Result<SocketAddr> {
    let target = target.clone().fill_defaults(network);
    resolve(&target).await
}

/// Address to send to; the host is required, a missing port takes the network default.
pub(crate) async fn resolve_send_addr(network: Network, target: &Target) -> Result<SocketAddr> {
    if target.host.is_empty() {
        return Err(Error::InvalidTarget(format!("{} target without host", network)));
    }
    let mut target = target.clone();
    target.port.get_or_insert(network.default_port());
    resolve(&target).await
}

async fn resolve(target: &Target) -> Result<SocketAddr> {
    if let (Some(ip), Some(port)) = (target.ip(), target.port) {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host(target.addr())
        .await
        .map_err(|e| Error::InvalidTarget(format!("resolve {}: {}", target, e)))?
        .next()
        .ok_or_else(|| Error::InvalidTarget(format!("resolve {}: no address found", target)))
}
