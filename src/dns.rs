//! The DNS resolution seam.
//!
//! Reuse decisions only ever need an ordered list of addresses for a
//! hostname; the [`Resolve`] trait keeps the actual resolver out of the
//! picture. [`GaiResolver`] delegates to the operating system through
//! `getaddrinfo`, and [`StaticDns`] serves scripted answers for tests and
//! simulations.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

/// Resolves hostnames to ordered IP lists.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    /// Resolve a hostname.
    ///
    /// The order of the returned addresses is meaningful: the first entry is
    /// the one a fresh connection dials.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, LookupError>;
}

/// A hostname could not be resolved to any dialable address.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LookupError {
    /// The resolver has no answer for the host.
    #[error("failed to resolve host {0}")]
    Unresolvable(String),

    /// The resolver answered, but with no addresses.
    #[error("no addresses for host {0}")]
    NoAddresses(String),

    /// The underlying lookup failed.
    #[error("lookup io: {0}")]
    Io(#[from] io::Error),
}

/// Resolver backed by the operating system's `getaddrinfo`.
///
/// The blocking system call runs on the blocking thread pool.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

#[async_trait]
impl Resolve for GaiResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();

        let lookup = host.clone();
        let addrs = tokio::task::spawn_blocking(move || {
            trace!(host = %lookup, "dns resolution starting");
            (lookup.as_str(), 0u16).to_socket_addrs()
        })
        .await
        .map_err(io::Error::other)?;

        let ips: Vec<IpAddr> = addrs?.map(|addr| addr.ip()).collect();
        if ips.is_empty() {
            return Err(LookupError::NoAddresses(host));
        }
        Ok(ips)
    }
}

/// Programmable resolver for tests and simulations.
///
/// Hosts that were never configured fail as unresolvable. A host configured
/// with an empty list fails with a no-addresses error, which simulates a
/// name that exists but cannot be reached.
#[derive(Debug, Default)]
pub struct StaticDns {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl StaticDns {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the answer for a host, replacing any previous entry.
    pub fn set(&self, host: impl Into<String>, ips: Vec<IpAddr>) {
        self.hosts.lock().insert(host.into(), ips);
    }
}

#[async_trait]
impl Resolve for StaticDns {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        let hosts = self.hosts.lock();
        match hosts.get(host) {
            None => Err(LookupError::Unresolvable(host.to_owned())),
            Some(ips) if ips.is_empty() => Err(LookupError::NoAddresses(host.to_owned())),
            Some(ips) => Ok(ips.clone()),
        }
    }
}
