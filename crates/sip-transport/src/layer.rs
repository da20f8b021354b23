//! # Transport layer
//!
//! [`TransportLayer`] is the surface a SIP user agent talks to. It creates one
//! [`Protocol`] per network on first use, fans their messages and errors in
//! to two public channels, and rewrites the top Via of outgoing requests.
//!
//! ```rust,no_run
//! use sipflow_sip_transport::{ListenOptions, TransportConfig, TransportLayer};
//!
//! # async fn run() -> sipflow_sip_transport::Result<()> {
//! let layer = TransportLayer::new(TransportConfig::new("192.168.1.10".parse().unwrap()));
//! layer.listen("udp", "0.0.0.0:5060", ListenOptions::default()).await?;
//!
//! let mut messages = layer.messages().unwrap();
//! while let Some(message) = messages.recv().await {
//!     println!("{}", message.short());
//! }
//!
//! layer.cancel();
//! layer.done().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use sipflow_sip_core::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::{ListenOptions, MapperDebug, MessageMapper, TransportConfig};
use crate::dns::{DnsResolver, HickoryResolver};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::protocol::{Protocol, ProtocolContext, new_protocol};
use crate::target::Target;

struct LayerInner {
    config: Arc<TransportConfig>,
    protocols: RwLock<HashMap<Network, Arc<dyn Protocol>>>,
    listen_ports: RwLock<HashMap<Network, Vec<u16>>>,
    resolver: RwLock<Arc<dyn DnsResolver>>,
    mapper: RwLock<Option<MessageMapper>>,
    pmsgs: mpsc::Sender<Message>,
    perrs: mpsc::Sender<Error>,
    msgs: Mutex<Option<mpsc::Receiver<Message>>>,
    errs: Mutex<Option<mpsc::Receiver<Error>>>,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Entry point of the SIP transport.
///
/// Must be created inside a tokio runtime. Dropping the layer cancels it.
pub struct TransportLayer {
    inner: Arc<LayerInner>,
}

impl TransportLayer {
    pub fn new(config: TransportConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (pmsgs, pmsgs_rx) = mpsc::channel(capacity);
        let (perrs, perrs_rx) = mpsc::channel(capacity);
        let (msgs, msgs_rx) = mpsc::channel(capacity);
        let (errs, errs_rx) = mpsc::channel(capacity);

        let inner = Arc::new(LayerInner {
            config: Arc::new(config),
            protocols: RwLock::new(HashMap::new()),
            listen_ports: RwLock::new(HashMap::new()),
            resolver: RwLock::new(Arc::new(HickoryResolver::new())),
            mapper: RwLock::new(None),
            pmsgs,
            perrs,
            msgs: Mutex::new(Some(msgs_rx)),
            errs: Mutex::new(Some(errs_rx)),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        tokio::spawn(
            serve(inner.clone(), pmsgs_rx, perrs_rx, msgs, errs)
                .instrument(info_span!("transport_layer")),
        );

        TransportLayer { inner }
    }

    /// Replaces the DNS resolver used for SRV lookups.
    pub fn with_resolver(self, resolver: Arc<dyn DnsResolver>) -> Self {
        *self.inner.resolver.write() = resolver;
        self
    }

    /// Sets the hook applied to every inbound message. Only protocols created
    /// afterwards use it, so set it before the first `listen` or `send`.
    pub fn with_message_mapper(self, mapper: MessageMapper) -> Self {
        *self.inner.mapper.write() = Some(mapper);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Inbound messages. The receiver can be taken only once.
    pub fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.msgs.lock().take()
    }

    /// Connection and parse errors. The receiver can be taken only once.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.inner.errs.lock().take()
    }

    /// Starts listening and returns the bound address.
    ///
    /// `addr` may be `host:port`, `host`, `:port` or empty; missing parts
    /// take the wildcard address and the network default port.
    pub async fn listen(&self, network: &str, addr: &str, options: ListenOptions) -> Result<SocketAddr> {
        self.check_canceled()?;

        let network: Network = network.parse()?;
        let target = Target::from_addr(addr)?;
        let protocol = self.protocol(network)?;
        let bound = protocol.listen(&target, &options).await?;

        self.inner
            .listen_ports
            .write()
            .entry(network)
            .or_insert_with(|| vec![bound.port()]);

        info!(%network, %bound, "listening");
        Ok(bound)
    }

    /// Sends a message to its `destination`.
    ///
    /// Requests go out on the network of their transport metadata, or of
    /// their top Via when it is unset. The top Via is rewritten to that
    /// network, the local host and a listening port. Responses go out on the
    /// network of their transport metadata.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        self.check_canceled()?;

        let network = if message.is_request() {
            self.prepare_request(&mut message)?
        } else {
            response_network(&message)?
        };

        let mut target = Target::from_addr(message.destination())?;
        if message.is_request() {
            target = self.lookup_srv(network, target).await;
        }

        let protocol = self.protocol(network)?;
        debug!(%network, %target, message = %message.short(), "sending message");

        protocol
            .send(&target, &message)
            .await
            .map_err(|err| Error::Send {
                network: network.to_string(),
                target: target.to_string(),
                source: Box::new(err),
            })
    }

    /// The outgoing network is the message transport, else the top Via transport.
    fn prepare_request(&self, message: &mut Message) -> Result<Network> {
        let short = message.short();
        let transport = message.transport().to_string();
        let hop = message.via_hop_mut().ok_or(Error::MissingVia(short))?;
        let network: Network = if transport.is_empty() {
            hop.transport.parse()?
        } else {
            transport.parse()?
        };

        hop.transport = network.as_via_transport().to_string();
        hop.host = self.inner.config.host_ip.to_string();
        hop.port = Some(self.via_port(network));
        Ok(network)
    }

    fn via_port(&self, network: Network) -> u16 {
        self.inner
            .listen_ports
            .read()
            .get(&network)
            .and_then(|ports| ports.choose(&mut rand::thread_rng()).copied())
            .unwrap_or_else(|| network.default_port())
    }

    /// Follows `_sip._<network>.<host>` for host names. A failed lookup keeps the target.
    async fn lookup_srv(&self, network: Network, target: Target) -> Target {
        if target.host.is_empty() || target.ip().is_some() {
            return target;
        }

        let resolver = self.inner.resolver.read().clone();
        let record = match resolver.lookup_srv("sip", network.as_str(), &target.host).await {
            Ok(records) => match records.into_iter().next() {
                Some(record) => record,
                None => return target,
            },
            Err(err) => {
                trace!(error = %err, host = %target.host, "SRV lookup failed, using target as is");
                return target;
            }
        };

        match resolver.lookup_ip(&record.target).await {
            Ok(ips) if !ips.is_empty() => Target::new(ips[0].to_string(), Some(record.port)),
            _ => Target::new(record.target, Some(record.port)),
        }
    }

    fn protocol(&self, network: Network) -> Result<Arc<dyn Protocol>> {
        if let Some(protocol) = self.inner.protocols.read().get(&network) {
            return Ok(protocol.clone());
        }

        let mut protocols = self.inner.protocols.write();
        if let Some(protocol) = protocols.get(&network) {
            return Ok(protocol.clone());
        }
        self.check_canceled()?;

        let protocol = new_protocol(
            network,
            ProtocolContext {
                output: self.inner.pmsgs.clone(),
                errs: self.inner.perrs.clone(),
                cancel: self.inner.cancel.child_token(),
                mapper: self.inner.mapper.read().clone(),
                config: self.inner.config.clone(),
            },
        )?;
        protocols.insert(network, protocol.clone());
        debug!(%network, "protocol created");
        Ok(protocol)
    }

    /// True if the protocol of `network` exists and is reliable.
    pub fn is_reliable(&self, network: &str) -> bool {
        self.existing(network).is_some_and(|protocol| protocol.reliable())
    }

    /// True if the protocol of `network` exists and is streamed.
    pub fn is_streamed(&self, network: &str) -> bool {
        self.existing(network).is_some_and(|protocol| protocol.streamed())
    }

    fn existing(&self, network: &str) -> Option<Arc<dyn Protocol>> {
        let network: Network = network.parse().ok()?;
        self.inner.protocols.read().get(&network).cloned()
    }

    fn check_canceled(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            Err(Error::Canceled("transport layer"))
        } else {
            Ok(())
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stops every protocol. Safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!("canceling transport layer");
            self.inner.cancel.cancel();
        }
    }

    /// Resolves once every protocol has shut down and both public channels are closed.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }
}

fn response_network(message: &Message) -> Result<Network> {
    if !message.transport().is_empty() {
        return message.transport().parse();
    }
    message
        .via_hop()
        .ok_or_else(|| Error::MissingVia(message.short()))?
        .transport
        .parse()
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<Network> = self.inner.protocols.read().keys().copied().collect();
        f.debug_struct("TransportLayer")
            .field("config", &self.inner.config)
            .field("protocols", &protocols)
            .field("mapper", &MapperDebug(&*self.inner.mapper.read()))
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

async fn serve(
    inner: Arc<LayerInner>,
    mut pmsgs: mpsc::Receiver<Message>,
    mut perrs: mpsc::Receiver<Error>,
    msgs: mpsc::Sender<Message>,
    errs: mpsc::Sender<Error>,
) {
    let cancel = inner.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(msg) = pmsgs.recv() => {
                debug!(message = %msg.short(), "message received");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = msgs.send(msg) => if result.is_err() {
                        trace!("message receiver dropped, message discarded");
                    },
                }
            }
            Some(err) = perrs.recv() => {
                warn!(error = %err, "transport error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = errs.send(err) => if result.is_err() {
                        trace!("error receiver dropped, error discarded");
                    },
                }
            }
        }
    }

    debug!("disposing transport layer");
    let protocols: Vec<Arc<dyn Protocol>> = inner.protocols.read().values().cloned().collect();
    for protocol in protocols {
        protocol.done().await;
        trace!(network = %protocol.network(), "protocol done");
    }

    drop(msgs);
    drop(errs);
    inner.done.cancel();
    debug!("transport layer disposed");
}
