//! TLS configuration identity and the handshake seam.
//!
//! Nothing in this crate performs a handshake. The [`TlsConnector`] trait is
//! the narrow seam to a real TLS stack; the types around it carry two kinds
//! of facts the pool needs for reuse decisions: which client configuration a
//! connection was opened under, and what the completed session looks like.
//!
//! Configuration identity is explicit. Where a client would normally compare
//! socket factories or hostname verifiers by object identity, addresses here
//! carry [`ConfigToken`]s minted once per configured instance, so equality is
//! a plain value comparison.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::address::Route;
use crate::cert::{chain_covers, Certificate, CertificatePinner};
use crate::conn::{HttpProtocol, Socket};

static TOKEN: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity token for a piece of client configuration.
///
/// Two addresses share a socket factory or a hostname verifier exactly when
/// they carry equal tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigToken(u64);

impl ConfigToken {
    /// Mint a fresh token, unequal to every token minted before it.
    pub fn new() -> Self {
        Self(TOKEN.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConfigToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{}", self.0)
    }
}

/// Hostname verification policy carried by an address.
///
/// The built-in policy checks the peer chain's subject alternative names.
/// A custom policy is opaque: there is no way to know what it would say
/// about a hostname it has not seen, so its presence disables cross-host
/// reuse entirely (see [`Address::is_compatible`][crate::Address::is_compatible]).
#[derive(Clone)]
pub enum HostnameVerifier {
    /// The built-in policy: subject alternative names must cover the host.
    Default,

    /// A caller-supplied policy.
    Custom(CustomVerifier),
}

/// A caller-supplied hostname verification callback plus its identity token.
#[derive(Clone)]
pub struct CustomVerifier {
    token: ConfigToken,
    verify: Arc<dyn Fn(&str, &TlsSession) -> bool + Send + Sync>,
}

impl HostnameVerifier {
    /// Wrap a caller-supplied verification callback.
    pub fn custom<F>(verify: F) -> Self
    where
        F: Fn(&str, &TlsSession) -> bool + Send + Sync + 'static,
    {
        HostnameVerifier::Custom(CustomVerifier {
            token: ConfigToken::new(),
            verify: Arc::new(verify),
        })
    }

    /// Whether this is the built-in policy.
    pub fn is_default(&self) -> bool {
        matches!(self, HostnameVerifier::Default)
    }

    /// Identity token, `None` for the built-in policy.
    pub(crate) fn token(&self) -> Option<ConfigToken> {
        match self {
            HostnameVerifier::Default => None,
            HostnameVerifier::Custom(custom) => Some(custom.token),
        }
    }

    /// Apply the policy to a completed handshake.
    pub fn verify(&self, host: &str, session: &TlsSession) -> bool {
        match self {
            HostnameVerifier::Default => chain_covers(session.peer_certificates(), host),
            HostnameVerifier::Custom(custom) => (custom.verify)(host, session),
        }
    }
}

impl Default for HostnameVerifier {
    fn default() -> Self {
        HostnameVerifier::Default
    }
}

impl PartialEq for HostnameVerifier {
    fn eq(&self, other: &Self) -> bool {
        self.token() == other.token()
    }
}

impl Eq for HostnameVerifier {}

impl fmt::Debug for HostnameVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostnameVerifier::Default => f.write_str("HostnameVerifier::Default"),
            HostnameVerifier::Custom(custom) => f
                .debug_tuple("HostnameVerifier::Custom")
                .field(&custom.token)
                .finish(),
        }
    }
}

impl fmt::Debug for CustomVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomVerifier").field(&self.token).finish()
    }
}

/// Client-wide TLS configuration, embedded by value in every address.
///
/// One context per configured client. Addresses built from the same context
/// compare equal on these fields, which is a precondition for sharing
/// connections between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsContext {
    factory: ConfigToken,
    verifier: HostnameVerifier,
    pinner: CertificatePinner,
}

impl TlsContext {
    /// A context with a fresh socket-factory identity, the built-in
    /// hostname verifier and no pins.
    pub fn new() -> Self {
        Self {
            factory: ConfigToken::new(),
            verifier: HostnameVerifier::Default,
            pinner: CertificatePinner::new(),
        }
    }

    /// Replace the hostname verifier.
    pub fn with_verifier(mut self, verifier: HostnameVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replace the certificate pinner.
    pub fn with_pinner(mut self, pinner: CertificatePinner) -> Self {
        self.pinner = pinner;
        self
    }

    /// The hostname verification policy.
    pub fn verifier(&self) -> &HostnameVerifier {
        &self.verifier
    }

    /// The certificate pinner.
    pub fn pinner(&self) -> &CertificatePinner {
        &self.pinner
    }

    pub(crate) fn factory(&self) -> ConfigToken {
        self.factory
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Negotiated TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,

    /// TLS 1.3
    Tls13,
}

/// Facts about an established TLS session that reuse decisions consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSession {
    peer_certificates: Vec<Certificate>,
    version: TlsVersion,
}

impl TlsSession {
    /// Create a session from the peer chain (leaf first) and the negotiated
    /// protocol version.
    pub fn new(peer_certificates: Vec<Certificate>, version: TlsVersion) -> Self {
        Self {
            peer_certificates,
            version,
        }
    }

    /// The peer certificate chain, leaf first.
    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_certificates
    }

    /// The leaf certificate, when the peer presented one.
    pub fn leaf(&self) -> Option<&Certificate> {
        self.peer_certificates.first()
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> TlsVersion {
        self.version
    }
}

/// The product of a completed handshake: the encrypted transport plus the
/// negotiated session facts.
#[derive(Debug)]
pub struct TlsStream {
    /// Transport handle for the encrypted connection.
    pub socket: Box<dyn Socket>,

    /// Application protocol selected through ALPN.
    pub protocol: HttpProtocol,

    /// Session facts for reuse decisions.
    pub session: TlsSession,
}

/// Performs the TCP connect and TLS handshake for a route.
///
/// Implementations own all real networking. A [`HandshakeError`] covers
/// rejections surfaced by the underlying stack as well as the caller's own
/// post-handshake gating.
#[async_trait]
pub trait TlsConnector: Send + Sync + 'static {
    /// Establish an encrypted connection over the given route.
    async fn connect(&self, route: &Route) -> Result<TlsStream, HandshakeError>;
}

/// Failure to establish an authenticated connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The TLS stack rejected the handshake.
    #[error("tls handshake: {0}")]
    Tls(String),

    /// The peer certificate does not authenticate the requested host.
    #[error("hostname {0} not verified against peer certificate")]
    Unverified(String),

    /// No pinned key for the host matched the presented chain.
    #[error("certificate pin mismatch for {0}")]
    PinMismatch(String),

    /// The transport failed beneath the handshake.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(sans: &[&str]) -> TlsSession {
        let leaf = Certificate::new(
            "leaf",
            sans.iter().map(|s| s.to_string()).collect(),
            &b"leaf-key"[..],
        );
        TlsSession::new(vec![leaf], TlsVersion::Tls13)
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(ConfigToken::new(), ConfigToken::new());
    }

    #[test]
    fn default_verifier_checks_subject_alternative_names() {
        let verifier = HostnameVerifier::Default;
        assert!(verifier.verify("san.com", &session(&["san.com"])));
        assert!(!verifier.verify("other.com", &session(&["san.com"])));
    }

    #[test]
    fn custom_verifier_applies_the_callback() {
        let verifier = HostnameVerifier::custom(|host, _| host == "allowed.com");
        assert!(verifier.verify("allowed.com", &session(&[])));
        assert!(!verifier.verify("denied.com", &session(&[])));
    }

    #[test]
    fn verifier_equality_follows_identity() {
        let custom = HostnameVerifier::custom(|_, _| true);
        let same = custom.clone();
        let other = HostnameVerifier::custom(|_, _| true);

        assert_eq!(HostnameVerifier::Default, HostnameVerifier::Default);
        assert_eq!(custom, same);
        assert_ne!(custom, other);
        assert_ne!(custom, HostnameVerifier::Default);
    }

    #[test]
    fn contexts_compare_by_configuration_identity() {
        let context = TlsContext::new();
        assert_eq!(context, context.clone());
        assert_ne!(context, TlsContext::new());
    }
}
