use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sipflow_sip_core::Message;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::{Protocol, ProtocolContext, resolve_listen_addr, resolve_send_addr};
use crate::config::ListenOptions;
use crate::connection::Connection;
use crate::connection_pool::ConnectionPool;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::target::Target;

/// SIP over UDP. Every listened socket is both the receive and the send socket.
#[derive(Debug)]
pub struct UdpProtocol {
    connections: ConnectionPool,
}

impl UdpProtocol {
    pub fn new(ctx: ProtocolContext) -> Self {
        UdpProtocol {
            connections: ConnectionPool::new(ctx.output, ctx.errs, ctx.cancel.child_token(), ctx.mapper),
        }
    }

    /// Port the message declares it is sent from: its source metadata, else the top Via.
    fn declared_port(message: &Message) -> Option<u16> {
        message
            .source()
            .parse::<SocketAddr>()
            .ok()
            .map(|addr| addr.port())
            .or_else(|| message.via_hop().and_then(|hop| hop.port))
    }

    fn socket_for(&self, message: &Message) -> Result<Arc<Connection>> {
        let sockets = self.connections.all();
        let port = Self::declared_port(message);

        if let Some(port) = port {
            if let Some(conn) = sockets.iter().find(|conn| conn.local_addr().port() == port) {
                return Ok(conn.clone());
            }
        }
        if let [conn] = sockets.as_slice() {
            return Ok(conn.clone());
        }

        Err(Error::pool(
            "get connection",
            match port {
                Some(port) => format!("connection on port {} not found", port),
                None => "no connection to send from".to_string(),
            },
        ))
    }
}

#[async_trait]
impl Protocol for UdpProtocol {
    fn network(&self) -> Network {
        Network::Udp
    }

    async fn listen(&self, target: &Target, _options: &ListenOptions) -> Result<SocketAddr> {
        let addr = resolve_listen_addr(Network::Udp, target).await?;
        let socket = UdpSocket::bind(addr).await?;
        let conn = self.connections.put(Connection::datagram(socket)?, Duration::ZERO)?;

        info!(local = %conn.local_addr(), "begin listening on udp");
        Ok(conn.local_addr())
    }

    async fn send(&self, target: &Target, message: &Message) -> Result<()> {
        let raddr = resolve_send_addr(Network::Udp, target).await?;
        let conn = self.socket_for(message)?;

        trace!(local = %conn.local_addr(), remote = %raddr, message = %message.short(), "sending message");
        conn.write_to(&message.to_bytes(), raddr).await?;
        Ok(())
    }

    async fn done(&self) {
        self.connections.done().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::{Header, Method, Request, SipUri, Via, ViaHop};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn request(via_port: Option<u16>) -> Message {
        Request::new(Method::Options, SipUri::new("example.com").into())
            .with_header(Header::Via(Via(vec![ViaHop::new("UDP", "127.0.0.1", via_port)])))
            .into()
    }

    #[tokio::test]
    async fn test_socket_selection_by_port() {
        let (output, _) = mpsc::channel(1);
        let (errs, _) = mpsc::channel(1);
        let protocol = UdpProtocol::new(ProtocolContext {
            output,
            errs,
            cancel: CancellationToken::new(),
            mapper: None,
            config: Default::default(),
        });

        assert!(protocol.socket_for(&request(None)).is_err());

        let options = ListenOptions::default();
        let first = protocol
            .listen(&Target::new("127.0.0.1", Some(0)), &options)
            .await
            .unwrap();
        // single socket is used whatever the declared port
        assert_eq!(protocol.socket_for(&request(Some(1))).unwrap().local_addr(), first);

        let second = protocol
            .listen(&Target::new("127.0.0.1", Some(0)), &options)
            .await
            .unwrap();
        let chosen = protocol.socket_for(&request(Some(second.port()))).unwrap();
        assert_eq!(chosen.local_addr(), second);

        let mut msg = request(Some(second.port()));
        msg.set_source(first.to_string());
        assert_eq!(protocol.socket_for(&msg).unwrap().local_addr(), first);

        let err = protocol.socket_for(&request(Some(1))).unwrap_err();
        assert_eq!(err.to_string(), "get connection: connection on port 1 not found");
    }
}
