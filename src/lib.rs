//! Valet
//!
//! Connection coalescing and pooling for HTTPS clients.
//!
//! When a client holds a live HTTP/2 connection to `a.example.com` and a
//! request arrives for `b.example.com`, dialing again is often wasted work:
//! the two names frequently resolve to the same server, and that server's
//! certificate frequently covers both. Valet decides when the existing
//! connection may be reused for the new host, and when it must not be.
//!
//! The decision combines several facts, each of which is load-bearing:
//!
//! 1. The two addresses must agree on everything except the hostname
//!    (scheme, port, proxy, TLS configuration identity, pins, protocols),
//!    and neither may carry a custom hostname verifier.
//! 2. The new host must resolve to the IP the connection actually dialed.
//! 3. The connection must still be healthy, probed without blocking.
//! 4. The peer certificate's subject alternative names must cover the new
//!    host; the common name never counts.
//! 5. Any certificate pins declared for the new host must be satisfied by
//!    the connection's chain.
//!
//! Getting this wrong in one direction serves requests over a connection
//! that was never authorized for the host; in the other it multiplies
//! TCP and TLS handshakes for no benefit.
//!
//! [`Pool::get`] answers a request with an exact match or a coalesced
//! connection; on a miss, [`Dialer::dial`] establishes a fresh one and
//! [`Pool::put`] registers it. DNS and TLS stay behind the [`Resolve`] and
//! [`TlsConnector`] traits, so the whole decision table can be exercised
//! with the scripted collaborators in [`mock`].

pub mod address;
pub mod cert;
pub mod coalesce;
pub mod conn;
pub mod dial;
pub mod dns;
pub mod events;
pub mod mock;
pub mod pool;
pub mod tls;

pub use self::address::{Address, Route};
pub use self::cert::{Certificate, CertificatePinner, Pin};
pub use self::conn::{Connection, ConnectionId, HttpProtocol, Socket};
pub use self::dial::{ConnectError, Dialer};
pub use self::dns::{GaiResolver, LookupError, Resolve, StaticDns};
pub use self::events::{EventListener, NoopListener};
pub use self::pool::{Pool, PoolConfig, Pooled};
pub use self::tls::{
    HandshakeError, HostnameVerifier, TlsConnector, TlsContext, TlsSession, TlsStream, TlsVersion,
};
