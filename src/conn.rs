//! Live connections and their health.
//!
//! A [`Connection`] is one socket plus one TLS session, created only after a
//! successful handshake and owned by the pool from then on. The route and
//! session facts are immutable; the active-stream counter is guarded
//! independently of the pool lock so concurrent callers can open streams on
//! a multiplexed connection without contending on the pool.
//!
//! Health is monotonic. A connection is OPEN until something closes it, and
//! a closed connection never comes back; the pool purges it on the next
//! observation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::address::{Address, Route};
use crate::tls::TlsSession;

static IDENT: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(IDENT.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Application protocol negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpProtocol {
    /// HTTP/1.1, one request at a time.
    Http1,

    /// HTTP/2, multiplexed streams over one connection.
    Http2,
}

/// Concurrent-stream allowance for a multiplexed connection when the peer
/// has not advertised a limit of its own.
const DEFAULT_HTTP2_STREAMS: usize = 100;

impl HttpProtocol {
    /// Whether this protocol carries concurrent streams.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, HttpProtocol::Http2)
    }

    fn stream_limit(&self) -> usize {
        match self {
            HttpProtocol::Http1 => 1,
            HttpProtocol::Http2 => DEFAULT_HTTP2_STREAMS,
        }
    }
}

/// Minimal transport handle behind an established connection.
///
/// The pool needs exactly two things from the wire: a zero-timeout probe for
/// a peer-initiated close, and a way to shut the transport down when the
/// connection is evicted.
pub trait Socket: Send + Sync + fmt::Debug + 'static {
    /// Zero-timeout check for a peer-initiated close or reset.
    ///
    /// Must not block. Only called while the connection is idle, so any
    /// readable data is as fatal as an EOF.
    fn peer_closed(&self) -> bool;

    /// Shut down the underlying transport.
    fn close(&self);
}

impl Socket for tokio::net::TcpStream {
    fn peer_closed(&self) -> bool {
        let mut buf = [0u8; 1];
        match self.try_read(&mut buf) {
            // Nothing readable: the peer is quiet and the connection is up.
            Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => false,
            // EOF, an error, or data with no outstanding request.
            _ => true,
        }
    }

    fn close(&self) {
        let _ = socket2::SockRef::from(self).shutdown(std::net::Shutdown::Both);
    }
}

/// One live, authenticated connection and its bookkeeping.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    route: Route,
    protocol: HttpProtocol,
    session: TlsSession,
    socket: Box<dyn Socket>,
    closed: AtomicBool,
    limit: usize,
    active: AtomicUsize,
    idle_since: Mutex<Instant>,
}

impl Connection {
    /// Wrap a successfully handshaken transport.
    pub fn new(
        route: Route,
        protocol: HttpProtocol,
        session: TlsSession,
        socket: Box<dyn Socket>,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            route,
            protocol,
            session,
            socket,
            closed: AtomicBool::new(false),
            limit: protocol.stream_limit(),
            active: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        }
    }

    /// Identifier for logging and explicit pool removal.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The route this connection was dialed over.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The address the connection was opened for.
    pub fn address(&self) -> &Address {
        self.route.address()
    }

    /// The negotiated application protocol.
    pub fn protocol(&self) -> HttpProtocol {
        self.protocol
    }

    /// Session facts from the handshake.
    pub fn session(&self) -> &TlsSession {
        &self.session
    }

    /// Whether the connection multiplexes concurrent streams.
    pub fn is_multiplexed(&self) -> bool {
        self.protocol.is_multiplexed()
    }

    /// Whether the connection has been closed. One-way.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection and shut down its transport. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            trace!(id = %self.id, "closing connection");
            self.socket.close();
        }
    }

    /// Number of streams currently active.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether no stream is currently active.
    pub fn is_idle(&self) -> bool {
        self.active_streams() == 0
    }

    /// When the connection last went idle. Meaningful only while idle.
    pub(crate) fn idle_since(&self) -> Instant {
        *self.idle_since.lock()
    }

    /// Reserve one stream slot.
    ///
    /// Fails when the connection is closed or already at its concurrent
    /// stream limit. Single-stream connections therefore reserve only while
    /// idle.
    pub(crate) fn try_reserve_stream(&self) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            let current = self.active.load(Ordering::SeqCst);
            if current >= self.limit {
                return false;
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return a reserved stream slot, stamping the idle timestamp when the
    /// counter reaches zero.
    pub(crate) fn release_stream(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.idle_since.lock() = Instant::now();
        }
    }

    /// Whether the connection can still carry requests.
    ///
    /// Closed connections are dead. An idle connection is additionally
    /// probed for a peer-initiated close; a failed probe closes the
    /// connection. Health never repairs.
    pub fn is_healthy(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.is_idle() && self.socket.peer_closed() {
            trace!(id = %self.id, "peer closed idle connection");
            self.close();
            return false;
        }
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{certificate, MockSocket};
    use crate::tls::{TlsContext, TlsVersion};

    fn connection(protocol: HttpProtocol) -> (Connection, MockSocket) {
        let socket = MockSocket::new();
        let address = Address::new("a.example.com", 443, TlsContext::new());
        let route = Route::new(address, "192.0.2.1".parse().unwrap());
        let session = TlsSession::new(
            vec![certificate("leaf", &["a.example.com"])],
            TlsVersion::Tls13,
        );
        (
            Connection::new(route, protocol, session, Box::new(socket.clone())),
            socket,
        )
    }

    #[test]
    fn identifiers_are_unique() {
        let (a, _) = connection(HttpProtocol::Http2);
        let (b, _) = connection(HttpProtocol::Http2);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn single_stream_connections_reserve_only_while_idle() {
        let (conn, _) = connection(HttpProtocol::Http1);

        assert!(conn.try_reserve_stream());
        assert!(!conn.try_reserve_stream());

        conn.release_stream();
        assert!(conn.is_idle());
        assert!(conn.try_reserve_stream());
    }

    #[test]
    fn multiplexed_connections_carry_concurrent_streams() {
        let (conn, _) = connection(HttpProtocol::Http2);

        assert!(conn.try_reserve_stream());
        assert!(conn.try_reserve_stream());
        assert_eq!(conn.active_streams(), 2);
        assert!(!conn.is_idle());
    }

    #[test]
    fn closed_connections_refuse_new_streams() {
        let (conn, _) = connection(HttpProtocol::Http2);
        conn.close();

        assert!(conn.is_closed());
        assert!(!conn.try_reserve_stream());
        assert!(!conn.is_healthy());
    }

    #[test]
    fn close_is_idempotent_and_one_way() {
        let (conn, socket) = connection(HttpProtocol::Http2);
        conn.close();
        conn.close();

        assert!(conn.is_closed());
        assert!(socket.is_shutdown());
    }

    #[test]
    fn idle_probe_detects_a_peer_close() {
        let (conn, socket) = connection(HttpProtocol::Http2);
        assert!(conn.is_healthy());

        socket.sever();
        assert!(!conn.is_healthy());
        // The failed probe closed the connection for good.
        assert!(conn.is_closed());
    }

    #[test]
    fn busy_connections_skip_the_probe() {
        let (conn, socket) = connection(HttpProtocol::Http2);
        assert!(conn.try_reserve_stream());

        socket.sever();
        // A request is in flight, so the probe does not run.
        assert!(conn.is_healthy());

        conn.release_stream();
        assert!(!conn.is_healthy());
    }
}
