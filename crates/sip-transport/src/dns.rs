//! DNS lookups used when sending to host names.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target host without the trailing dot
    pub target: String,
}

/// Name resolution seam of the transport layer.
#[async_trait]
pub trait DnsResolver: Send + Sync + fmt::Debug {
    /// Looks up `_<service>._<proto>.<host>`. Records come back by ascending
    /// priority, then descending weight.
    async fn lookup_srv(&self, service: &str, proto: &str, host: &str) -> Result<Vec<SrvRecord>>;

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

fn srv_name(service: &str, proto: &str, host: &str) -> String {
    format!("_{}._{}.{}", service, proto, host.trim_end_matches('.'))
}

fn sort_records(records: &mut [SrvRecord]) {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
}

/// System resolver, created on first use.
#[derive(Default)]
pub struct HickoryResolver {
    resolver: OnceCell<TokioAsyncResolver>,
}

impl HickoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> &TokioAsyncResolver {
        self.resolver
            .get_or_init(|| async {
                TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                    warn!("system resolver configuration unavailable ({}), using defaults", e);
                    TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
                })
            })
            .await
    }
}

impl fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HickoryResolver")
            .field("initialized", &self.resolver.initialized())
            .finish()
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn lookup_srv(&self, service: &str, proto: &str, host: &str) -> Result<Vec<SrvRecord>> {
        let name = srv_name(service, proto, host);
        let lookup = self
            .resolver()
            .await
            .srv_lookup(name.as_str())
            .await
            .map_err(|e| Error::Dns(format!("SRV lookup {}: {}", name, e)))?;

        let mut records: Vec<SrvRecord> = lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
            })
            .collect();
        sort_records(&mut records);

        debug!(%name, count = records.len(), "SRV lookup done");
        Ok(records)
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .resolver()
            .await
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Dns(format!("IP lookup {}: {}", host, e)))?;
        Ok(lookup.iter().collect())
    }
}

/// Fixed answers, for tests and closed networks.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    srv: HashMap<String, Vec<SrvRecord>>,
    ips: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_srv(mut self, service: &str, proto: &str, host: &str, records: Vec<SrvRecord>) -> Self {
        self.srv.insert(srv_name(service, proto, host), records);
        self
    }

    pub fn with_ip(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.ips.insert(host.to_string(), ips);
        self
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn lookup_srv(&self, service: &str, proto: &str, host: &str) -> Result<Vec<SrvRecord>> {
        let name = srv_name(service, proto, host);
        let mut records = self
            .srv
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::Dns(format!("SRV lookup {}: no records found", name)))?;
        sort_records(&mut records);
        Ok(records)
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.ips
            .get(host)
            .cloned()
            .ok_or_else(|| Error::Dns(format!("IP lookup {}: no records found", host)))
    }
}
