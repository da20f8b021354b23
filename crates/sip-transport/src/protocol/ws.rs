use std::net::SocketAddr;

use async_trait::async_trait;
use http::HeaderValue;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use sipflow_sip_core::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::debug;

use super::tcp::StreamCore;
use super::{Protocol, ProtocolContext};
use crate::config::ListenOptions;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::target::Target;

/// SIP over WebSocket (RFC 7118), or over secure WebSocket for [`Network::Wss`].
///
/// Both sides negotiate the `sip` subprotocol and exchange text frames.
#[derive(Debug)]
pub struct WsProtocol {
    core: StreamCore,
}

impl WsProtocol {
    pub fn new(network: Network, ctx: ProtocolContext) -> Result<Self> {
        match network {
            Network::Ws | Network::Wss => Ok(WsProtocol {
                core: StreamCore::new(network, ctx)?,
            }),
            _ => Err(Error::UnsupportedProtocol(network.to_string())),
        }
    }

    async fn dial(&self, addr: SocketAddr, target: &Target) -> Result<Connection> {
        let network = self.core.network();
        let (stream, local_addr) = self.core.connect(addr, target).await?;

        let scheme = if network.secure() { "wss" } else { "ws" };
        let mut request = format!("{}://{}", scheme, target.addr())
            .into_client_request()
            .map_err(Error::websocket)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("sip"));

        let (ws, response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(Error::websocket)?;
        debug!(remote = %addr, status = %response.status(), "websocket handshake done");

        Ok(Connection::websocket(ws, network, local_addr, addr))
    }
}

#[async_trait]
impl Protocol for WsProtocol {
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
            None => self.core.register(self.dial(addr, target).await?)?,
        };
        self.core.write(&conn, message).await
    }

    async fn done(&self) {
        self.core.done().await
    }
}
