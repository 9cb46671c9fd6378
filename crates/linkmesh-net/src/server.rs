use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::Interest;
use tracing::warn;

use crate::{
    connection::{Connection, ConnectionId},
    dispatcher::{Dispatcher, Listener},
    error::Error,
    event_loop::{EventLoop, LISTENER_TOKEN, UDP_TOKEN},
    messages::{FrameworkMessage, NetworkMessage, Serialization},
    registry::RegistryState,
    udp::UdpChannel,
};

/// Runtime configuration. `write_buffer_size`/`object_buffer_size` bound
/// per-connection memory; the `*_millis` fields gate keep-alive/timeout;
/// `idle_threshold` is the write-buffer occupancy fraction below which a
/// connection is considered idle.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub write_buffer_size: usize,
    pub object_buffer_size: usize,
    pub tcp_bind_addr: Option<SocketAddr>,
    pub udp_bind_addr: Option<SocketAddr>,
    pub keep_alive_millis: u64,
    pub timeout_millis: u64,
    pub idle_threshold: f64,
    pub select_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 16_384,
            object_buffer_size: 2_048,
            tcp_bind_addr: None,
            udp_bind_addr: None,
            keep_alive_millis: 8_000,
            timeout_millis: 12_000,
            idle_threshold: 0.1,
            select_timeout: Duration::from_millis(250),
        }
    }
}

/// State reachable from both the I/O thread and any application thread
/// calling into [`Server`].
pub(crate) struct Shared<A, S> {
    pub(crate) serialization: Mutex<S>,
    pub(crate) registry: Mutex<RegistryState<A>>,
    pub(crate) poll_registry: mio::Registry,
    pub(crate) dispatcher: Arc<Dispatcher<A>>,
    next_id: AtomicI32,
    /// The listening socket, guarded by the same lock the event loop
    /// briefly acquires at the top of every cycle -- this is the
    /// "update lock" barrier that lets `close`/rebind intervene between
    /// cycles without racing an in-flight `accept`.
    pub(crate) listener: Mutex<Option<mio::net::TcpListener>>,
    pub(crate) udp: Mutex<Option<Arc<UdpChannel>>>,
    pub(crate) discover_handler: Option<Arc<dyn crate::discover::DiscoverHandler>>,
    pub(crate) config: ServerConfig,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl<A, S> Shared<A, S> {
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        loop {
            let current = self.next_id.load(Ordering::Relaxed);
            let next = if current >= i32::MAX { 1 } else { current + 1 };
            if self
                .next_id
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return ConnectionId(current);
            }
        }
    }

    pub(crate) fn close_connection_by_id(&self, id: ConnectionId) {
        if let Some(connection) = self.registry.lock().unwrap().remove(id) {
            connection.close_framer(&self.poll_registry);
            connection.mark_disconnected();
        }
    }
}

impl<A, S> Shared<A, S>
where
    A: Send + Sync + 'static,
    S: Serialization<A>,
{
    /// Sends a framework or application message, closing the connection
    /// (and firing `disconnected`) on failure. Returns the encoded payload
    /// length, or 0 if the connection was unknown or the send failed.
    pub(crate) fn send_tcp_to(&self, connection: &Connection<A>, message: &NetworkMessage<A>) -> usize {
        match connection.send_via(&self.poll_registry, &self.serialization, message) {
            Ok(n) => n,
            Err(err) => {
                warn!(id = %connection.id(), %err, "tcp send failed, closing connection");
                self.close_connection_by_id(connection.id());
                0
            }
        }
    }
}

/// Builds a [`Server`] from a [`ServerConfig`] and a [`Serialization`]
/// implementation.
pub struct ServerBuilder<A, S> {
    config: ServerConfig,
    serialization: S,
    discover_handler: Option<Arc<dyn crate::discover::DiscoverHandler>>,
    _marker: std::marker::PhantomData<fn() -> A>,
}

impl<A, S> ServerBuilder<A, S>
where
    A: Send + Sync + 'static,
    S: Serialization<A>,
{
    pub fn new(serialization: S) -> Self {
        Self {
            config: ServerConfig::default(),
            serialization,
            discover_handler: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn tcp_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.tcp_bind_addr = Some(addr);
        self
    }

    pub fn udp_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.udp_bind_addr = Some(addr);
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    pub fn object_buffer_size(mut self, size: usize) -> Self {
        self.config.object_buffer_size = size;
        self
    }

    pub fn keep_alive_millis(mut self, millis: u64) -> Self {
        self.config.keep_alive_millis = millis;
        self
    }

    pub fn timeout_millis(mut self, millis: u64) -> Self {
        self.config.timeout_millis = millis;
        self
    }

    pub fn idle_threshold(mut self, threshold: f64) -> Self {
        self.config.idle_threshold = threshold;
        self
    }

    pub fn discover_handler(mut self, handler: Arc<dyn crate::discover::DiscoverHandler>) -> Self {
        self.discover_handler = Some(handler);
        self
    }

    pub fn spawn(self) -> io::Result<Server<A, S>> {
        Server::spawn(self.config, self.serialization, self.discover_handler)
    }
}

/// Multiplexes many TCP sessions -- each optionally paired with a UDP
/// remote address -- over one readiness-driven I/O thread. Cheaply
/// cloneable handles into the shared state (`send_tcp`, `close_connection`,
/// ...) may be called from any thread while the I/O thread runs.
pub struct Server<A, S> {
    shared: Arc<Shared<A, S>>,
    thread: Option<JoinHandle<()>>,
    tcp_local_addr: Mutex<Option<SocketAddr>>,
    udp_local_addr: Mutex<Option<SocketAddr>>,
}

impl<A, S> Server<A, S>
where
    A: Send + Sync + 'static,
    S: Serialization<A>,
{
    fn spawn(
        config: ServerConfig,
        serialization: S,
        discover_handler: Option<Arc<dyn crate::discover::DiscoverHandler>>,
    ) -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let poll_registry = poll.registry().try_clone()?;

        let mut tcp_local_addr = None;
        let listener = match config.tcp_bind_addr {
            Some(addr) => {
                let mut listener = mio::net::TcpListener::bind(addr)?;
                poll_registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                tcp_local_addr = Some(listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let mut udp_local_addr = None;
        let udp = match config.udp_bind_addr {
            Some(addr) => {
                let mut socket = mio::net::UdpSocket::bind(addr)?;
                poll_registry.register(&mut socket, UDP_TOKEN, Interest::READABLE)?;
                udp_local_addr = Some(socket.local_addr()?);
                Some(Arc::new(UdpChannel::new(socket, config.object_buffer_size)))
            }
            None => None,
        };

        let shared = Arc::new(Shared {
            serialization: Mutex::new(serialization),
            registry: Mutex::new(RegistryState::default()),
            poll_registry,
            dispatcher: Arc::new(Dispatcher::new()),
            next_id: AtomicI32::new(1),
            listener: Mutex::new(listener),
            udp: Mutex::new(udp),
            discover_handler,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let event_loop = EventLoop::new(Arc::clone(&shared), poll);
        let thread = std::thread::Builder::new().name("linkmesh-io".into()).spawn(move || event_loop.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
            tcp_local_addr: Mutex::new(tcp_local_addr),
            udp_local_addr: Mutex::new(udp_local_addr),
        })
    }

    /// The bound TCP listening address, if TCP was enabled.
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        *self.tcp_local_addr.lock().unwrap()
    }

    /// The bound UDP socket address, if UDP was enabled.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        *self.udp_local_addr.lock().unwrap()
    }

    /// Rebinds the TCP listener and/or UDP socket to new addresses
    /// (`None` unbinds that side). Callable from any thread: it takes the
    /// same update-lock `run_cycle`'s barrier briefly acquires at the top
    /// of every cycle, so the swap interposes cleanly between cycles
    /// rather than racing an in-flight `accept`.
    pub fn bind(&self, tcp_addr: Option<SocketAddr>, udp_addr: Option<SocketAddr>) -> io::Result<()> {
        let mut listener_guard = self.shared.listener.lock().unwrap();
        if let Some(mut old) = listener_guard.take() {
            let _ = self.shared.poll_registry.deregister(&mut old);
        }
        let new_listener = match tcp_addr {
            Some(addr) => {
                let mut listener = mio::net::TcpListener::bind(addr)?;
                self.shared.poll_registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                *self.tcp_local_addr.lock().unwrap() = Some(listener.local_addr()?);
                Some(listener)
            }
            None => {
                *self.tcp_local_addr.lock().unwrap() = None;
                None
            }
        };
        *listener_guard = new_listener;

        let mut udp_guard = self.shared.udp.lock().unwrap();
        if let Some(old) = udp_guard.take() {
            old.close(&self.shared.poll_registry);
        }
        let new_udp = match udp_addr {
            Some(addr) => {
                let mut socket = mio::net::UdpSocket::bind(addr)?;
                self.shared.poll_registry.register(&mut socket, UDP_TOKEN, Interest::READABLE)?;
                *self.udp_local_addr.lock().unwrap() = Some(socket.local_addr()?);
                Some(Arc::new(UdpChannel::new(socket, self.shared.config.object_buffer_size)))
            }
            None => {
                *self.udp_local_addr.lock().unwrap() = None;
                None
            }
        };
        *udp_guard = new_udp;

        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener<A>>) {
        self.shared.dispatcher.add_listener(listener);
    }

    /// Newest-first snapshot of established connection ids.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.shared.registry.lock().unwrap().established_snapshot().iter().map(|c| c.id()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().unwrap().established_len()
    }

    pub fn pending_connection_count(&self) -> usize {
        self.shared.registry.lock().unwrap().pending_len()
    }

    /// Sends an application object to one connection over TCP. Returns the
    /// encoded payload length, or 0 if the connection is unknown or the
    /// send failed (in which case the connection is closed).
    pub fn send_tcp(&self, id: ConnectionId, message: A) -> usize {
        let Some(connection) = self.shared.registry.lock().unwrap().get(id) else { return 0 };
        self.shared.send_tcp_to(&connection, &NetworkMessage::Application(message))
    }

    pub fn send_tcp_to_all(&self, message: A)
    where
        A: Clone,
    {
        let message = NetworkMessage::Application(message);
        for connection in self.shared.registry.lock().unwrap().established_snapshot() {
            self.shared.send_tcp_to(&connection, &message);
        }
    }

    pub fn send_tcp_to_all_except(&self, exclude: ConnectionId, message: A)
    where
        A: Clone,
    {
        let message = NetworkMessage::Application(message);
        for connection in self.shared.registry.lock().unwrap().established_snapshot() {
            if connection.id() != exclude {
                self.shared.send_tcp_to(&connection, &message);
            }
        }
    }

    /// Sends an application object to one connection over UDP. Requires
    /// UDP to be enabled and the connection to have completed its UDP
    /// registration handshake.
    pub fn send_udp(&self, id: ConnectionId, message: A) -> Result<Option<usize>, Error> {
        let connection = self
            .shared
            .registry
            .lock()
            .unwrap()
            .get(id)
            .ok_or_else(|| Error::IllegalState(format!("unknown connection {id}")))?;
        let addr = connection
            .udp_remote_address()
            .ok_or_else(|| Error::IllegalState(format!("connection {id} has no udp address")))?;
        let udp = self.shared.udp.lock().unwrap().clone().ok_or_else(|| Error::IllegalState("udp channel not enabled".into()))?;
        let message = NetworkMessage::Application(message);
        let serialization = &self.shared.serialization;
        udp.send(addr, |buf| serialization.lock().unwrap().encode(buf, &message))
    }

    pub fn send_udp_to_all(&self, message: A)
    where
        A: Clone,
    {
        let Some(udp) = self.shared.udp.lock().unwrap().clone() else { return };
        let message = NetworkMessage::Application(message);
        let serialization = &self.shared.serialization;
        for connection in self.shared.registry.lock().unwrap().established_snapshot() {
            if let Some(addr) = connection.udp_remote_address() {
                let _ = udp.send(addr, |buf| serialization.lock().unwrap().encode(buf, &message));
            }
        }
    }

    /// Sends a `Ping` and starts timing the round trip; the matching reply
    /// updates [`Connection::return_trip_time_millis`]. Returns the encoded
    /// payload length, or 0 if the connection is unknown.
    pub fn ping(&self, id: ConnectionId) -> usize {
        let Some(connection) = self.shared.registry.lock().unwrap().get(id) else { return 0 };
        let ping = connection.next_ping();
        self.shared.send_tcp_to(&connection, &NetworkMessage::Framework(FrameworkMessage::Ping(ping)))
    }

    pub fn close_connection(&self, id: ConnectionId) {
        self.shared.close_connection_by_id(id);
    }

    /// Signals shutdown and blocks until the I/O thread notices (within
    /// one select cycle), drains all connections, and closes the
    /// listening and UDP sockets.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl<A, S> Drop for Server<A, S> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
