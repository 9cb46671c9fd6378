use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use mio::{Registry, Token};

use crate::{
    dispatcher::{Listener, ListenerList},
    error::Error,
    framer::Framer,
    messages::{NetworkMessage, Ping, Serialization},
};

/// Server-assigned connection identifier, always `1 ..= i32::MAX`, never
/// zero or negative. The sole identity used for lookups: `Connection`
/// itself derives neither `PartialEq` nor `Hash`, so a reused id after
/// wraparound can never make two live `Connection` handles compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub i32);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PingState {
    next_seq: i32,
    last_id: i32,
    last_send_time: Instant,
    return_trip_time_millis: i64,
}

/// One server-side session: a TCP framer, an optional bound UDP remote
/// address, per-connection listeners, and ping/RTT bookkeeping.
///
/// Shared across threads as `Arc<Connection<A>>`: the I/O thread owns
/// reads and lifecycle transitions, while any thread may call the
/// `send_*` family exposed by [`crate::server::Server`] or inspect state.
pub struct Connection<A> {
    id: ConnectionId,
    name: Mutex<String>,
    pub(crate) framer: Framer,
    udp_remote_address: Mutex<Option<SocketAddr>>,
    is_connected: AtomicBool,
    listeners: ListenerList<A>,
    ping: Mutex<PingState>,
}

impl<A> Connection<A> {
    pub(crate) fn new(id: ConnectionId, framer: Framer) -> Self {
        Self {
            id,
            name: Mutex::new(format!("Connection {id}")),
            framer,
            udp_remote_address: Mutex::new(None),
            is_connected: AtomicBool::new(false),
            listeners: ListenerList::new(),
            ping: Mutex::new(PingState {
                next_seq: 0,
                last_id: 0,
                last_send_time: Instant::now(),
                return_trip_time_millis: -1,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn udp_remote_address(&self) -> Option<SocketAddr> {
        *self.udp_remote_address.lock().unwrap()
    }

    pub(crate) fn set_udp_remote_address(&self, addr: SocketAddr) {
        *self.udp_remote_address.lock().unwrap() = Some(addr);
    }

    /// Last measured round-trip time in milliseconds, or `-1` if no ping
    /// reply has been matched yet.
    pub fn return_trip_time_millis(&self) -> i64 {
        self.ping.lock().unwrap().return_trip_time_millis
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener<A>>) {
        self.listeners.push(listener);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.framer.is_idle()
    }

    pub(crate) fn close_framer(&self, registry: &Registry) {
        self.framer.close(registry);
    }

    pub(crate) fn send_via<S: Serialization<A>>(
        &self,
        registry: &Registry,
        serialization: &Mutex<S>,
        message: &NetworkMessage<A>,
    ) -> Result<usize, Error> {
        self.framer.send(registry, |buf| serialization.lock().unwrap().encode(buf, message))
    }

    pub(crate) fn mark_connected(&self) {
        self.is_connected.store(true, Ordering::Release);
        self.fire_connected();
    }

    /// Flips `is_connected` to false and fires `disconnected` iff it was
    /// previously true, so a connection that never reached established
    /// (e.g. closed while awaiting UDP registration) never fires it.
    pub(crate) fn mark_disconnected(&self) {
        if self.is_connected.swap(false, Ordering::AcqRel) {
            self.fire_disconnected();
        }
    }

    /// Allocates the next outgoing ping id and records when it was sent,
    /// so a later matching reply can update `return_trip_time_millis`.
    pub(crate) fn next_ping(&self) -> Ping {
        let mut ping = self.ping.lock().unwrap();
        ping.next_seq = ping.next_seq.wrapping_add(1);
        ping.last_id = ping.next_seq;
        ping.last_send_time = Instant::now();
        Ping { id: ping.next_seq, is_reply: false }
    }

    pub(crate) fn note_ping_reply(&self, reply: Ping) {
        let mut ping = self.ping.lock().unwrap();
        if reply.id == ping.last_id {
            ping.return_trip_time_millis = ping.last_send_time.elapsed().as_millis() as i64;
        }
    }

    fn fire_connected(&self) {
        for listener in self.listeners.snapshot().iter() {
            listener.connected(self);
        }
    }

    fn fire_disconnected(&self) {
        for listener in self.listeners.snapshot().iter() {
            listener.disconnected(self);
        }
    }

    pub(crate) fn fire_received(&self, message: &NetworkMessage<A>) {
        for listener in self.listeners.snapshot().iter() {
            listener.received(self, message);
        }
    }

    pub(crate) fn fire_idle(&self) {
        for listener in self.listeners.snapshot().iter() {
            listener.idle(self);
            if !self.is_idle() {
                break;
            }
        }
    }
}
