//! Endpoint resolution.

use crate::error::{LinkError, Result};
use crate::types::Endpoint;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::net::ToSocketAddrs;

/// Turns a host specification into the set of endpoints the pool should hold.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, hosts: &str) -> Result<BTreeSet<Endpoint>>;
}

/// Resolves a comma separated list of `host:port` entries through the
/// system resolver. Any entry failing fails the whole resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsResolver;

impl EndpointResolver for DnsResolver {
    fn resolve(&self, hosts: &str) -> Result<BTreeSet<Endpoint>> {
        let mut endpoints = BTreeSet::new();
        for entry in hosts.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let addrs = entry
                .to_socket_addrs()
                .map_err(|e| LinkError::Resolve(format!("{}: {}", entry, e)))?;
            endpoints.extend(addrs.map(|addr| Endpoint::new(addr.to_string())));
        }
        Ok(endpoints)
    }
}

/// A fixed, replaceable endpoint set. The host specification is ignored.
#[derive(Debug, Default)]
pub struct StaticResolver {
    endpoints: RwLock<BTreeSet<Endpoint>>,
}

impl StaticResolver {
    pub fn new<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        Self {
            endpoints: RwLock::new(endpoints.into_iter().map(Into::into).collect()),
        }
    }

    /// Replace the endpoint set seen by the next resolution.
    pub fn set<I, E>(&self, endpoints: I)
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        *self.endpoints.write() = endpoints.into_iter().map(Into::into).collect();
    }
}

impl EndpointResolver for StaticResolver {
    fn resolve(&self, _hosts: &str) -> Result<BTreeSet<Endpoint>> {
        Ok(self.endpoints.read().clone())
    }
}
