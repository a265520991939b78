//! Establishing fresh connections.
//!
//! The pool never dials. When it reports a miss the caller turns to a
//! [`Dialer`], which resolves the host, hands the route to the TLS
//! collaborator, and then applies the hostname verification and pinning
//! policy the connection will be pooled under. Nothing is registered in the
//! pool before all of that succeeds, so an abandoned dial leaves no
//! pool-visible trace.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::address::{Address, Route};
use crate::conn::Connection;
use crate::dns::{LookupError, Resolve};
use crate::events::{EventListener, NoopListener};
use crate::tls::{HandshakeError, TlsConnector};

/// Dials fresh connections for addresses the pool cannot serve.
pub struct Dialer {
    resolver: Arc<dyn Resolve>,
    connector: Arc<dyn TlsConnector>,
    listener: Arc<dyn EventListener>,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer").finish_non_exhaustive()
    }
}

impl Dialer {
    /// Create a dialer over the given collaborators.
    pub fn new(resolver: Arc<dyn Resolve>, connector: Arc<dyn TlsConnector>) -> Self {
        Self {
            resolver,
            connector,
            listener: Arc::new(NoopListener),
        }
    }

    /// Attach an event listener.
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Establish and authenticate a connection for `address`.
    ///
    /// The first resolved IP is dialed; a failed route is surfaced, not
    /// retried. After the handshake the address's hostname verifier and
    /// certificate pinner are applied, so a connection that comes back is
    /// fully authorized for its own host.
    pub async fn dial(&self, address: &Address) -> Result<Connection, ConnectError> {
        let ips = self.resolver.resolve(address.host()).await?;
        let ip = ips
            .first()
            .copied()
            .ok_or_else(|| LookupError::NoAddresses(address.host().to_owned()))?;

        let route = Route::new(address.clone(), ip);
        self.listener.connect_start(&route);

        let stream = self.connector.connect(&route).await?;

        let host = address.host();
        if !address.tls().verifier().verify(host, &stream.session) {
            stream.socket.close();
            return Err(HandshakeError::Unverified(host.to_owned()).into());
        }
        if !address
            .tls()
            .pinner()
            .check(host, stream.session.peer_certificates())
        {
            stream.socket.close();
            return Err(HandshakeError::PinMismatch(host.to_owned()).into());
        }

        self.listener.connect_end(&route);
        debug!(host = %host, ip = %ip, "connection established");
        Ok(Connection::new(
            route,
            stream.protocol,
            stream.session,
            stream.socket,
        ))
    }
}

/// Failure to produce a usable connection for an address.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The hostname did not resolve to a dialable address.
    #[error("lookup: {0}")]
    Lookup(#[from] LookupError),

    /// The connection could not be established or authenticated.
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::cert::{CertificatePinner, Pin};
    use crate::dns::StaticDns;
    use crate::mock::{certificate, MockTls};
    use crate::tls::{HostnameVerifier, TlsContext};

    assert_impl_all!(ConnectError: std::error::Error, Send, Sync);

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    fn dialer_for(sans: &[&str]) -> (Dialer, Arc<StaticDns>) {
        let _ = tracing_subscriber::fmt::try_init();
        let dns = Arc::new(StaticDns::new());
        let tls = Arc::new(MockTls::new(vec![certificate("leaf", sans)]));
        (Dialer::new(dns.clone(), tls), dns)
    }

    #[tokio::test]
    async fn dial_uses_the_first_resolved_address() {
        let (dialer, dns) = dialer_for(&["a.example.com"]);
        dns.set("a.example.com", ips(&["192.0.2.1", "192.0.2.2"]));

        let address = Address::new("a.example.com", 443, TlsContext::new());
        let connection = dialer.dial(&address).await.unwrap();

        assert_eq!(connection.route().ip(), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn dial_surfaces_lookup_failures() {
        let (dialer, dns) = dialer_for(&["a.example.com"]);
        dns.set("unreachable.com", vec![]);

        let unknown = Address::new("a.example.com", 443, TlsContext::new());
        assert!(matches!(
            dialer.dial(&unknown).await,
            Err(ConnectError::Lookup(LookupError::Unresolvable(_)))
        ));

        let unreachable = Address::new("unreachable.com", 443, TlsContext::new());
        assert!(matches!(
            dialer.dial(&unreachable).await,
            Err(ConnectError::Lookup(LookupError::NoAddresses(_)))
        ));
    }

    #[tokio::test]
    async fn dial_rejects_hosts_the_certificate_does_not_name() {
        let (dialer, dns) = dialer_for(&["a.example.com"]);
        dns.set("nonsan.com", ips(&["192.0.2.1"]));

        let address = Address::new("nonsan.com", 443, TlsContext::new());
        assert!(matches!(
            dialer.dial(&address).await,
            Err(ConnectError::Handshake(HandshakeError::Unverified(host))) if host == "nonsan.com"
        ));
    }

    #[tokio::test]
    async fn dial_defers_to_a_custom_verifier() {
        let (dialer, dns) = dialer_for(&[]);
        dns.set("anything.com", ips(&["192.0.2.1"]));

        let permissive = TlsContext::new().with_verifier(HostnameVerifier::custom(|_, _| true));
        let address = Address::new("anything.com", 443, permissive);

        assert!(dialer.dial(&address).await.is_ok());
    }

    #[tokio::test]
    async fn dial_enforces_certificate_pins() {
        let presented = certificate("leaf", &["pinned.com"]);
        let stranger = certificate("stranger", &[]);

        let (dialer, dns) = dialer_for(&["pinned.com"]);
        dns.set("pinned.com", ips(&["192.0.2.1"]));

        let mismatched = TlsContext::new()
            .with_pinner(CertificatePinner::new().add(Pin::of("pinned.com", &stranger)));
        let address = Address::new("pinned.com", 443, mismatched);
        assert!(matches!(
            dialer.dial(&address).await,
            Err(ConnectError::Handshake(HandshakeError::PinMismatch(_)))
        ));

        let matching = TlsContext::new()
            .with_pinner(CertificatePinner::new().add(Pin::of("pinned.com", &presented)));
        let address = Address::new("pinned.com", 443, matching);
        assert!(dialer.dial(&address).await.is_ok());
    }

    #[tokio::test]
    async fn dial_notifies_the_listener() {
        #[derive(Debug, Default)]
        struct Counting {
            starts: AtomicUsize,
            ends: AtomicUsize,
        }

        impl EventListener for Counting {
            fn connect_start(&self, _route: &Route) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }

            fn connect_end(&self, _route: &Route) {
                self.ends.fetch_add(1, Ordering::SeqCst);
            }
        }

        let listener = Arc::new(Counting::default());
        let (dialer, dns) = dialer_for(&["a.example.com"]);
        let dialer = dialer.with_listener(listener.clone());
        dns.set("a.example.com", ips(&["192.0.2.1"]));
        dns.set("nonsan.com", ips(&["192.0.2.1"]));

        let address = Address::new("a.example.com", 443, TlsContext::new());
        dialer.dial(&address).await.unwrap();
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
        assert_eq!(listener.ends.load(Ordering::SeqCst), 1);

        // A failed dial starts but never ends.
        let rejected = Address::new("nonsan.com", 443, TlsContext::new());
        let _ = dialer.dial(&rejected).await;
        assert_eq!(listener.starts.load(Ordering::SeqCst), 2);
        assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
    }
}
