//! The connection pool.
//!
//! The pool is the registry of live connections, bucketed by every address
//! field except the hostname. A lookup first tries an exact address match,
//! then walks the bucket in insertion order asking the coalescing gates in
//! [`crate::coalesce`] whether a connection opened for a different hostname
//! may serve this one.
//!
//! All bookkeeping is serialized by one [`parking_lot::Mutex`]. The lock is
//! held for in-memory work and the zero-timeout liveness probe, never across
//! DNS resolution, which runs between the exact-match pass and the
//! coalescing pass. Two callers missing the pool for the same host may both
//! dial; both connections are registered and the idle policy later reclaims
//! the redundant one.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::address::{Address, ClassKey};
use crate::coalesce;
use crate::conn::{Connection, ConnectionId};
use crate::dns::Resolve;
use crate::events::{EventListener, NoopListener};

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// The longest a connection may sit idle before eviction.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of idle connections kept, across all hosts.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(90)),
            max_idle: 5,
        }
    }
}

/// A pool of live connections, shared by clone.
///
/// Connections enter through [`Pool::put`] after a successful handshake and
/// leave through eviction or [`Pool::remove`]. Both lookup paths reserve a
/// stream slot atomically with the lookup, so a returned connection always
/// has capacity for the caller's request.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<PoolInner>>,
    resolver: Arc<dyn Resolve>,
    listener: Arc<dyn EventListener>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("connections", &self.inner.lock().len())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a pool that consults `resolver` for coalescing decisions.
    pub fn new(config: PoolConfig, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::new(config))),
            resolver,
            listener: Arc::new(NoopListener),
        }
    }

    /// Attach an event listener.
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Number of live connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Register a freshly handshaken connection, leasing one stream on it
    /// for the request that triggered the dial.
    ///
    /// Connections past their idle lifetime are evicted first; if the global
    /// idle allowance is then exceeded, the least recently used idle entry
    /// goes too.
    pub fn put(&self, connection: Connection) -> Pooled {
        let connection = Arc::new(connection);
        let reserved = connection.try_reserve_stream();
        debug_assert!(reserved, "a fresh connection always has stream capacity");

        {
            let mut inner = self.inner.lock();
            inner.evict_expired();
            inner.insert(connection.clone());
            inner.evict_over_capacity();
        }

        trace!(id = %connection.id(), host = %connection.address().host(), "connection registered");
        self.listener.connection_acquired(&connection);
        Pooled::new(connection, &self.inner)
    }

    /// Explicitly evict a connection, closing it. Returns whether it was
    /// present.
    pub fn remove(&self, connection: &Connection) -> bool {
        let removed = self.inner.lock().remove(connection.id());
        match removed {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Find a usable connection for `target`.
    ///
    /// Tries an exact address match first, then considers coalescing onto a
    /// connection opened for a different hostname that shares the route and
    /// whose certificate covers the target. `None` is an ordinary miss that
    /// sends the caller to the dialer, never an error; in particular a
    /// failed or empty coalescing lookup only rejects reuse.
    pub async fn get(&self, target: &Address) -> Option<Pooled> {
        let key = target.class_key();

        let coalescable = {
            let mut inner = self.inner.lock();
            if let Some(connection) = inner.checkout_exact(&key, target) {
                trace!(id = %connection.id(), host = %target.host(), "exact match in pool");
                self.listener.connection_acquired(&connection);
                return Some(Pooled::new(connection, &self.inner));
            }
            inner.has_cross_host_candidates(&key, target)
        };

        if !coalescable {
            return None;
        }

        // Resolution happens with the lock released; candidates are
        // re-evaluated under the lock afterwards.
        let resolved = match self.resolver.resolve(target.host()).await {
            Ok(ips) => ips,
            Err(error) => {
                trace!(host = %target.host(), %error, "coalescing lookup failed");
                return None;
            }
        };

        let connection = {
            let mut inner = self.inner.lock();
            inner.checkout_coalesced(&key, target, &resolved)
        }?;

        debug!(id = %connection.id(), host = %target.host(), "coalesced onto pooled connection");
        self.listener.connection_acquired(&connection);
        Some(Pooled::new(connection, &self.inner))
    }
}

struct PoolInner {
    config: PoolConfig,
    connections: HashMap<ClassKey, Vec<Arc<Connection>>>,
}

impl PoolInner {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.connections.values().map(Vec::len).sum()
    }

    fn insert(&mut self, connection: Arc<Connection>) {
        let key = connection.address().class_key();
        self.connections.entry(key).or_default().push(connection);
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut removed = None;
        for bucket in self.connections.values_mut() {
            if let Some(index) = bucket.iter().position(|conn| conn.id() == id) {
                removed = Some(bucket.remove(index));
                break;
            }
        }
        if removed.is_some() {
            self.connections.retain(|_, bucket| !bucket.is_empty());
        }
        removed
    }

    /// Exact address match with a stream reserved under the lock. Closed,
    /// expired and stale entries found on the way are dropped.
    fn checkout_exact(&mut self, key: &ClassKey, target: &Address) -> Option<Arc<Connection>> {
        let cutoff = expiry_cutoff(self.config.idle_timeout);
        let mut found = None;

        let empty = match self.connections.get_mut(key) {
            Some(bucket) => {
                let mut index = 0;
                while index < bucket.len() {
                    let conn = &bucket[index];
                    if conn.is_closed() || is_expired(conn, cutoff) {
                        trace!(id = %conn.id(), "dropping defunct connection");
                        bucket.remove(index).close();
                        continue;
                    }
                    if conn.address() == target {
                        if !conn.is_healthy() {
                            trace!(id = %conn.id(), "evicting stale connection");
                            bucket.remove(index).close();
                            continue;
                        }
                        if conn.try_reserve_stream() {
                            found = Some(conn.clone());
                            break;
                        }
                    }
                    index += 1;
                }
                bucket.is_empty()
            }
            None => false,
        };

        if empty {
            self.connections.remove(key);
        }
        found
    }

    /// Whether the bucket holds any connection for another hostname, which
    /// is the only case worth a coalescing lookup.
    fn has_cross_host_candidates(&self, key: &ClassKey, target: &Address) -> bool {
        self.connections
            .get(key)
            .map(|bucket| bucket.iter().any(|conn| conn.address().host() != target.host()))
            .unwrap_or(false)
    }

    /// Walk the bucket in insertion order applying the coalescing gates:
    /// verifier and DNS overlap, then health (stale candidates are evicted
    /// and the walk continues), then certificate coverage and pinning. The
    /// first survivor with stream capacity wins.
    fn checkout_coalesced(
        &mut self,
        key: &ClassKey,
        target: &Address,
        resolved: &[IpAddr],
    ) -> Option<Arc<Connection>> {
        let cutoff = expiry_cutoff(self.config.idle_timeout);
        let mut found = None;

        let empty = match self.connections.get_mut(key) {
            Some(bucket) => {
                let mut index = 0;
                while index < bucket.len() {
                    let conn = &bucket[index];
                    if conn.is_closed() || is_expired(conn, cutoff) {
                        trace!(id = %conn.id(), "dropping defunct connection");
                        bucket.remove(index).close();
                        continue;
                    }
                    if !coalesce::routes_overlap(target, conn, resolved) {
                        index += 1;
                        continue;
                    }
                    if !conn.is_healthy() {
                        trace!(id = %conn.id(), "evicting stale coalescing candidate");
                        bucket.remove(index).close();
                        continue;
                    }
                    if coalesce::certificate_covers(target, conn) && conn.try_reserve_stream() {
                        found = Some(conn.clone());
                        break;
                    }
                    index += 1;
                }
                bucket.is_empty()
            }
            None => false,
        };

        if empty {
            self.connections.remove(key);
        }
        found
    }

    fn evict_expired(&mut self) {
        let cutoff = expiry_cutoff(self.config.idle_timeout);
        for bucket in self.connections.values_mut() {
            bucket.retain(|conn| {
                if conn.is_closed() || is_expired(conn, cutoff) {
                    trace!(id = %conn.id(), "evicting expired connection");
                    conn.close();
                    false
                } else {
                    true
                }
            });
        }
        self.connections.retain(|_, bucket| !bucket.is_empty());
    }

    fn idle_count(&self) -> usize {
        self.connections
            .values()
            .flatten()
            .filter(|conn| conn.is_idle() && !conn.is_closed())
            .count()
    }

    fn evict_over_capacity(&mut self) {
        while self.idle_count() > self.config.max_idle {
            if !self.evict_lru_idle() {
                break;
            }
        }
    }

    fn evict_lru_idle(&mut self) -> bool {
        let mut lru: Option<(Instant, ConnectionId)> = None;
        for conn in self.connections.values().flatten() {
            if conn.is_idle() && !conn.is_closed() {
                let at = conn.idle_since();
                if lru.map(|(t, _)| at < t).unwrap_or(true) {
                    lru = Some((at, conn.id()));
                }
            }
        }

        match lru {
            Some((_, id)) => {
                if let Some(conn) = self.remove(id) {
                    trace!(id = %conn.id(), "evicting least recently used idle connection");
                    conn.close();
                }
                true
            }
            None => false,
        }
    }

    /// Idle policy applied when a lease returns its connection to idle.
    fn reap_idle(&mut self) {
        self.evict_expired();
        self.evict_over_capacity();
    }
}

fn expiry_cutoff(idle_timeout: Option<Duration>) -> Option<Instant> {
    idle_timeout
        .filter(|timeout| *timeout > Duration::ZERO)
        .and_then(|timeout| Instant::now().checked_sub(timeout))
}

fn is_expired(connection: &Connection, cutoff: Option<Instant>) -> bool {
    match cutoff {
        Some(cutoff) => connection.is_idle() && connection.idle_since() < cutoff,
        None => false,
    }
}

/// A connection checked out of the pool, with one stream reserved.
///
/// The reservation is the caller's slot on the wire. Dropping the guard
/// releases it, and if the connection thereby went idle the pool re-applies
/// its idle policy through a weak back-reference.
pub struct Pooled {
    connection: Arc<Connection>,
    pool: Weak<Mutex<PoolInner>>,
}

impl Pooled {
    fn new(connection: Arc<Connection>, pool: &Arc<Mutex<PoolInner>>) -> Self {
        Self {
            connection,
            pool: Arc::downgrade(pool),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Deref for Pooled {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl fmt::Debug for Pooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.connection).finish()
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        self.connection.release_stream();
        if self.connection.is_idle() {
            if let Some(pool) = self.pool.upgrade() {
                pool.lock().reap_idle();
            }
        }
    }
}
