//! Connection lifecycle notifications.
//!
//! Purely informational. Listeners observe dials and acquisitions; they
//! never influence a reuse decision.

use crate::address::Route;
use crate::conn::Connection;

/// Observer of connection establishment and acquisition.
///
/// Every method defaults to doing nothing, so implementations override only
/// the events they watch.
pub trait EventListener: Send + Sync + 'static {
    /// A dial is about to start for the route.
    fn connect_start(&self, route: &Route) {
        let _ = route;
    }

    /// The dial for the route completed and the connection authenticated.
    fn connect_end(&self, route: &Route) {
        let _ = route;
    }

    /// A connection was handed to a caller, freshly dialed or reused.
    fn connection_acquired(&self, connection: &Connection) {
        let _ = connection;
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {}
