use std::sync::{Arc, Mutex};

use crate::{connection::Connection, messages::NetworkMessage};

/// Application callback surface. All four methods are invoked from the
/// single I/O thread in registration order; implementations must not
/// block, since they run inline with the readiness loop.
pub trait Listener<A>: Send + Sync {
    /// Fired exactly once when a connection becomes established (for a
    /// TCP-only server, right after accept; with UDP enabled, once the
    /// UDP registration handshake completes).
    fn connected(&self, _connection: &Connection<A>) {}

    /// Fired exactly once for a connection that was previously connected,
    /// when it closes for any reason.
    fn disconnected(&self, _connection: &Connection<A>) {}

    /// Fired once per decoded message. Framework messages `RegisterTcp`,
    /// `RegisterUdp` and `DiscoverHost` never reach this callback (they are
    /// fully handled internally); `KeepAlive` and `Ping` are delivered here
    /// as ordinary events in addition to their internal handling.
    fn received(&self, _connection: &Connection<A>, _message: &NetworkMessage<A>) {}

    /// Fired once per update cycle while the connection's write buffer
    /// occupancy stays below the idle threshold. Iteration over the
    /// listener list stops early if a call causes the connection to no
    /// longer be idle.
    fn idle(&self, _connection: &Connection<A>) {}
}

/// Copy-on-write ordered listener set: readers clone the `Arc<Vec<_>>`
/// under a brief lock and then iterate lock-free; writers build a new
/// `Vec` and swap it in. Dedups by pointer identity.
pub(crate) struct ListenerList<A>(Mutex<Arc<Vec<Arc<dyn Listener<A>>>>>);

impl<A> ListenerList<A> {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(Arc::new(Vec::new())))
    }

    pub(crate) fn push(&self, listener: Arc<dyn Listener<A>>) {
        let mut guard = self.0.lock().unwrap();
        if guard.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            return;
        }
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<dyn Listener<A>>>> {
        Arc::clone(&self.0.lock().unwrap())
    }
}

/// The server-wide listener set, added to every connection's own listener
/// list at accept time. This makes "fire to this connection's listeners"
/// and "fire to the server's listeners" a single ordered walk of
/// `Connection`'s own list, rather than two separate fan-outs.
pub struct Dispatcher<A> {
    listeners: ListenerList<A>,
}

impl<A> Default for Dispatcher<A> {
    fn default() -> Self {
        Self { listeners: ListenerList::new() }
    }
}

impl<A> Dispatcher<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener<A>>) {
        self.listeners.push(listener);
    }
}

impl<A: Send + Sync + 'static> Listener<A> for Dispatcher<A> {
    fn connected(&self, connection: &Connection<A>) {
        for listener in self.listeners.snapshot().iter() {
            listener.connected(connection);
        }
    }

    fn disconnected(&self, connection: &Connection<A>) {
        for listener in self.listeners.snapshot().iter() {
            listener.disconnected(connection);
        }
    }

    fn received(&self, connection: &Connection<A>, message: &NetworkMessage<A>) {
        for listener in self.listeners.snapshot().iter() {
            listener.received(connection, message);
        }
    }

    fn idle(&self, connection: &Connection<A>) {
        for listener in self.listeners.snapshot().iter() {
            listener.idle(connection);
            if !connection.is_idle() {
                break;
            }
        }
    }
}
