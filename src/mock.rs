//! Scripted collaborators for exercising reuse decisions without a network.
//!
//! [`StaticDns`][crate::dns::StaticDns] covers the resolver side; this
//! module adds the transport and handshake halves. A [`MockSocket`] can be
//! severed from the outside to simulate a peer-initiated close, and a
//! [`MockTls`] hands every handshake a scripted certificate chain while
//! remembering the sockets it produced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::address::{Address, Route};
use crate::cert::Certificate;
use crate::conn::{Connection, HttpProtocol, Socket};
use crate::tls::{HandshakeError, TlsConnector, TlsSession, TlsStream, TlsVersion};

/// In-memory socket with an externally controllable peer.
#[derive(Debug, Clone, Default)]
pub struct MockSocket {
    inner: Arc<MockSocketState>,
}

#[derive(Debug, Default)]
struct MockSocketState {
    severed: AtomicBool,
    shutdown: AtomicBool,
}

impl MockSocket {
    /// A connected, healthy socket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the peer closing or resetting the connection.
    pub fn sever(&self) {
        self.inner.severed.store(true, Ordering::SeqCst);
    }

    /// Whether the local side shut the socket down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

impl Socket for MockSocket {
    fn peer_closed(&self) -> bool {
        self.inner.severed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }
}

/// A certificate whose key bytes are derived from its subject, so equal
/// subjects pin identically and different subjects never collide.
pub fn certificate(subject: &str, sans: &[&str]) -> Certificate {
    Certificate::new(
        subject,
        sans.iter().map(|san| san.to_string()).collect(),
        format!("spki:{subject}").into_bytes(),
    )
}

/// A multiplexed connection for `address`, as if dialed to `ip` and
/// handshaken against `chain`.
pub fn connection_for(address: &Address, ip: &str, chain: Vec<Certificate>) -> Connection {
    connection_with(address, ip, chain, HttpProtocol::Http2).0
}

/// Like [`connection_for`], with an explicit protocol, returning the socket
/// handle so the peer side can be severed later.
pub fn connection_with(
    address: &Address,
    ip: &str,
    chain: Vec<Certificate>,
    protocol: HttpProtocol,
) -> (Connection, MockSocket) {
    let socket = MockSocket::new();
    let route = Route::new(address.clone(), ip.parse().expect("mock ip"));
    let session = TlsSession::new(chain, TlsVersion::Tls13);
    (
        Connection::new(route, protocol, session, Box::new(socket.clone())),
        socket,
    )
}

/// Scripted TLS collaborator.
///
/// Every handshake presents the same certificate chain and negotiates the
/// same protocol. Hostname verification and pinning are applied by the
/// dialer after the handshake, exactly as with a real connector.
#[derive(Debug)]
pub struct MockTls {
    chain: Vec<Certificate>,
    protocol: HttpProtocol,
    version: TlsVersion,
    sockets: Mutex<Vec<MockSocket>>,
}

impl MockTls {
    /// Handshakes that present `chain` (leaf first) and negotiate HTTP/2.
    pub fn new(chain: Vec<Certificate>) -> Self {
        Self {
            chain,
            protocol: HttpProtocol::Http2,
            version: TlsVersion::Tls13,
            sockets: Mutex::new(Vec::new()),
        }
    }

    /// Negotiate a different application protocol.
    pub fn with_protocol(mut self, protocol: HttpProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// The socket handed out by the most recent handshake.
    pub fn last_socket(&self) -> Option<MockSocket> {
        self.sockets.lock().last().cloned()
    }

    /// How many handshakes have completed.
    pub fn handshakes(&self) -> usize {
        self.sockets.lock().len()
    }
}

#[async_trait]
impl TlsConnector for MockTls {
    async fn connect(&self, _route: &Route) -> Result<TlsStream, HandshakeError> {
        let socket = MockSocket::new();
        self.sockets.lock().push(socket.clone());
        Ok(TlsStream {
            socket: Box::new(socket),
            protocol: self.protocol,
            session: TlsSession::new(self.chain.clone(), self.version),
        })
    }
}
