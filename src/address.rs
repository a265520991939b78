//! Addresses and routes.
//!
//! An [`Address`] describes everything required to open a connection to an
//! origin except which IP the dial lands on; a [`Route`] is an address bound
//! to the one IP actually dialed. Compatibility between addresses
//! deliberately ignores the hostname, and that omission is what makes
//! cross-host reuse possible at all.

use std::net::{IpAddr, SocketAddr};

use http::uri::Scheme;

use crate::cert::CertificatePinner;
use crate::conn::HttpProtocol;
use crate::tls::{ConfigToken, TlsContext};

/// Connection requirements for an origin host.
///
/// Immutable once constructed. Equality covers every field, with the
/// hostname verifier compared by identity token, so a pooled connection can
/// be matched exactly against a later request for the same host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    scheme: Scheme,
    host: String,
    port: u16,
    proxy: Option<SocketAddr>,
    tls: TlsContext,
    protocols: Vec<HttpProtocol>,
}

impl Address {
    /// An HTTPS address for the given host and port, offering HTTP/2 with an
    /// HTTP/1.1 fallback.
    pub fn new(host: impl Into<String>, port: u16, tls: TlsContext) -> Self {
        Self {
            scheme: Scheme::HTTPS,
            host: host.into(),
            port,
            proxy: None,
            tls,
            protocols: vec![HttpProtocol::Http2, HttpProtocol::Http1],
        }
    }

    /// Route requests through an HTTP proxy.
    pub fn with_proxy(mut self, proxy: SocketAddr) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Restrict or reorder the application protocols offered.
    pub fn with_protocols(mut self, protocols: Vec<HttpProtocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// The same connection requirements, aimed at a different hostname.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        let mut address = self.clone();
        address.host = host.into();
        address
    }

    /// The URI scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The hostname requests under this address are addressed to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The HTTP proxy to dial through, if any.
    pub fn proxy(&self) -> Option<SocketAddr> {
        self.proxy
    }

    /// The TLS configuration this address was built under.
    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }

    /// The application protocols offered, in preference order.
    pub fn protocols(&self) -> &[HttpProtocol] {
        &self.protocols
    }

    /// Whether a connection opened for `other` could in principle serve this
    /// address.
    ///
    /// True when every field except the hostname is equal and both hostname
    /// verifiers are the built-in one. A custom verifier is opaque toward
    /// hostnames it has not seen, so it is compatible with nothing, itself
    /// included; connections under one are still reusable for their own
    /// host through exact matching.
    pub fn is_compatible(&self, other: &Address) -> bool {
        self.tls.verifier().is_default()
            && other.tls.verifier().is_default()
            && self.scheme == other.scheme
            && self.port == other.port
            && self.proxy == other.proxy
            && self.tls == other.tls
            && self.protocols == other.protocols
    }

    pub(crate) fn class_key(&self) -> ClassKey {
        ClassKey {
            scheme: self.scheme.clone(),
            port: self.port,
            proxy: self.proxy,
            factory: self.tls.factory(),
            verifier: self.tls.verifier().token(),
            pinner: self.tls.pinner().clone(),
            protocols: self.protocols.clone(),
        }
    }
}

/// Pool bucket key: every address field except the hostname.
///
/// Carries the verifier token rather than requiring it to be the default, so
/// custom-verifier addresses still bucket deterministically for same-host
/// reuse even though they never coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ClassKey {
    scheme: Scheme,
    port: u16,
    proxy: Option<SocketAddr>,
    factory: ConfigToken,
    verifier: Option<ConfigToken>,
    pinner: CertificatePinner,
    protocols: Vec<HttpProtocol>,
}

/// An address bound to the single IP address actually dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    address: Address,
    ip: IpAddr,
}

impl Route {
    /// Bind an address to the IP being dialed.
    pub fn new(address: Address, ip: IpAddr) -> Self {
        Self { address, ip }
    }

    /// The address this route was planned from.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The resolved peer IP.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The proxy in use, if any.
    pub fn proxy(&self) -> Option<SocketAddr> {
        self.address.proxy()
    }

    /// The socket address dialed: the proxy when one is configured, the
    /// origin otherwise.
    pub fn socket_addr(&self) -> SocketAddr {
        self.proxy()
            .unwrap_or_else(|| SocketAddr::new(self.ip, self.address.port()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{Certificate, CertificatePinner, Pin};
    use crate::tls::HostnameVerifier;

    fn address(host: &str, tls: &TlsContext) -> Address {
        Address::new(host, 443, tls.clone())
    }

    #[test]
    fn compatibility_ignores_the_host() {
        let tls = TlsContext::new();
        let a = address("a.example.com", &tls);
        let b = address("b.example.com", &tls);

        assert_ne!(a, b);
        assert!(a.is_compatible(&b));
        assert!(b.is_compatible(&a));
    }

    #[test]
    fn compatibility_requires_equal_ports_and_proxies() {
        let tls = TlsContext::new();
        let a = address("a.example.com", &tls);

        assert!(!a.is_compatible(&Address::new("b.example.com", 8443, tls.clone())));
        assert!(!a.is_compatible(
            &address("b.example.com", &tls).with_proxy("10.0.0.1:3128".parse().unwrap())
        ));
    }

    #[test]
    fn compatibility_requires_the_same_configuration() {
        let a = address("a.example.com", &TlsContext::new());
        let b = address("b.example.com", &TlsContext::new());

        // Distinct contexts mean distinct socket factory identity.
        assert!(!a.is_compatible(&b));
    }

    #[test]
    fn compatibility_requires_equal_pins() {
        let certificate = Certificate::new("leaf", vec!["a.example.com".into()], &b"key"[..]);
        let pinned =
            TlsContext::new().with_pinner(CertificatePinner::new().add(Pin::of("a.example.com", &certificate)));

        let a = address("a.example.com", &pinned);
        let b = address("b.example.com", &TlsContext::new());
        assert!(!a.is_compatible(&b));
        assert!(a.is_compatible(&address("b.example.com", &pinned)));
    }

    #[test]
    fn custom_verifier_is_compatible_with_nothing() {
        let tls = TlsContext::new().with_verifier(HostnameVerifier::custom(|_, _| true));
        let a = address("a.example.com", &tls);
        let b = address("b.example.com", &tls);

        assert!(!a.is_compatible(&b));
        assert!(!a.is_compatible(&a.clone()));
        // Exact equality still holds for same-host reuse.
        assert_eq!(a, a.clone());
    }

    #[test]
    fn compatibility_requires_equal_protocol_lists() {
        let tls = TlsContext::new();
        let a = address("a.example.com", &tls);
        let b = address("b.example.com", &tls).with_protocols(vec![HttpProtocol::Http1]);

        assert!(!a.is_compatible(&b));
    }

    #[test]
    fn class_keys_group_by_everything_but_host() {
        let tls = TlsContext::new();
        let a = address("a.example.com", &tls);
        let b = address("b.example.com", &tls);

        assert_eq!(a.class_key(), b.class_key());
        assert_ne!(
            a.class_key(),
            Address::new("a.example.com", 8443, tls).class_key()
        );
    }

    #[test]
    fn route_prefers_the_proxy_socket_address() {
        let tls = TlsContext::new();
        let direct = Route::new(address("a.example.com", &tls), "192.0.2.7".parse().unwrap());
        assert_eq!(direct.socket_addr(), "192.0.2.7:443".parse().unwrap());

        let proxied = Route::new(
            address("a.example.com", &tls).with_proxy("10.0.0.1:3128".parse().unwrap()),
            "192.0.2.7".parse().unwrap(),
        );
        assert_eq!(proxied.socket_addr(), "10.0.0.1:3128".parse().unwrap());
    }
}
