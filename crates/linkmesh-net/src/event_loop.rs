use std::{
    io,
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use mio::Token;

use crate::{
    connection::{Connection, ConnectionId},
    messages::{FrameworkMessage, KeepAlive, NetworkMessage, RegisterTcp, RegisterUdp, Serialization},
    server::Shared,
};

pub(crate) const LISTENER_TOKEN: Token = Token(0);
pub(crate) const UDP_TOKEN: Token = Token(usize::MAX);

/// The readiness-driven I/O thread: owns the `mio::Poll` instance and
/// drives accept, TCP read/write, UDP registration and the periodic
/// timeout/keep-alive/idle sweep. Everything it needs beyond that lives in
/// `Shared`, which is also reachable from the `Server` facade on other
/// threads for cross-thread sends and shutdown.
pub(crate) struct EventLoop<A, S> {
    shared: Arc<Shared<A, S>>,
    poll: mio::Poll,
    events: mio::Events,
    empty_select_streak: u32,
}

impl<A, S> EventLoop<A, S>
where
    A: Send + Sync + 'static,
    S: Serialization<A>,
{
    pub(crate) fn new(shared: Arc<Shared<A, S>>, poll: mio::Poll) -> Self {
        Self { shared, poll, events: mio::Events::with_capacity(256), empty_select_streak: 0 }
    }

    pub(crate) fn run(mut self) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            self.run_cycle(self.shared.config.select_timeout);
        }
        self.drain_all();
    }

    fn run_cycle(&mut self, select_timeout: Duration) {
        let cycle_start = Instant::now();

        // Update-lock barrier: briefly acquire/release so a concurrent
        // bind/close on another thread has a window to run between cycles.
        {
            let _guard = self.shared.listener.lock().unwrap();
        }

        if let Err(e) = self.poll.poll(&mut self.events, Some(select_timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                tracing::error!(err = %e, "poll failed");
            }
            return;
        }

        self.keep_alive_pass(Instant::now());

        if self.events.is_empty() {
            self.empty_select_streak += 1;
            if self.empty_select_streak >= 100 {
                let elapsed = cycle_start.elapsed();
                let pause = Duration::from_millis(25).saturating_sub(elapsed);
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
                self.empty_select_streak = 0;
            }
        } else {
            self.empty_select_streak = 0;
        }

        let batch: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_error() || e.is_read_closed() || e.is_write_closed()))
            .collect();
        for (token, readable, writable, cancelled) in batch {
            self.keep_alive_pass(Instant::now());
            self.dispatch_event(token, readable, writable, cancelled);
        }

        self.timer_sweep();
    }

    fn dispatch_event(&mut self, token: Token, readable: bool, writable: bool, cancelled: bool) {
        if token == LISTENER_TOKEN {
            self.accept_operation();
            return;
        }
        if token == UDP_TOKEN {
            if cancelled {
                tracing::debug!(err = %crate::error::Error::Cancelled, "cancelled udp key, closing udp channel");
                if let Some(udp) = self.shared.udp.lock().unwrap().as_ref() {
                    udp.close(&self.shared.poll_registry);
                }
                return;
            }
            self.handle_udp_readable();
            return;
        }

        let id = ConnectionId(token.0 as i32);
        let connection = self.shared.registry.lock().unwrap().get(id);
        let Some(connection) = connection else {
            // Stale event for an already-closed connection; harmless.
            return;
        };

        if cancelled {
            tracing::debug!(id = %id, err = %crate::error::Error::Cancelled, "cancelled key, closing connection");
            self.shared.close_connection_by_id(id);
            return;
        }

        if self.shared.udp.lock().unwrap().is_some() && connection.udp_remote_address().is_none() {
            self.shared.close_connection_by_id(id);
            return;
        }

        if readable && self.drain_readable(&connection).is_err() {
            self.shared.close_connection_by_id(id);
            return;
        }
        if writable && connection.framer.write_operation(&self.shared.poll_registry).is_err() {
            self.shared.close_connection_by_id(id);
        }
    }

    fn accept_operation(&self) {
        loop {
            let mut listener_guard = self.shared.listener.lock().unwrap();
            let Some(listener) = listener_guard.as_mut() else { return };
            match listener.accept() {
                Ok((stream, _peer_addr)) => {
                    drop(listener_guard);
                    if let Err(e) = self.handle_accepted(stream) {
                        tracing::warn!(err = %e, "failed to register accepted connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(err = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_accepted(&self, mut stream: mio::net::TcpStream) -> io::Result<()> {
        let id = self.shared.next_connection_id();
        let token = id.token();
        self.shared.poll_registry.register(&mut stream, token, mio::Interest::READABLE)?;

        let cfg = &self.shared.config;
        let framer = crate::framer::Framer::new(
            stream,
            token,
            cfg.object_buffer_size,
            cfg.write_buffer_size,
            cfg.keep_alive_millis,
            cfg.timeout_millis,
            cfg.idle_threshold,
        )?;
        let connection = Arc::new(Connection::new(id, framer));
        connection.add_listener(Arc::clone(&self.shared.dispatcher) as Arc<dyn crate::dispatcher::Listener<A>>);

        self.shared.send_tcp_to(
            &connection,
            &NetworkMessage::Framework(FrameworkMessage::RegisterTcp(RegisterTcp { connection_id: id.0 })),
        );

        if self.shared.udp.lock().unwrap().is_some() {
            self.shared.registry.lock().unwrap().insert_pending(connection);
        } else {
            self.shared.registry.lock().unwrap().insert_established(Arc::clone(&connection));
            connection.mark_connected();
        }
        Ok(())
    }

    fn drain_readable(&self, connection: &Arc<Connection<A>>) -> Result<(), crate::error::Error> {
        loop {
            match connection.framer.read_frame()? {
                None => return Ok(()),
                Some(bytes) => {
                    let message = self.shared.serialization.lock().unwrap().decode(&bytes)?;
                    self.handle_message(connection, message);
                }
            }
        }
    }

    fn handle_message(&self, connection: &Arc<Connection<A>>, message: NetworkMessage<A>) {
        match message {
            NetworkMessage::Framework(FrameworkMessage::RegisterTcp(_))
            | NetworkMessage::Framework(FrameworkMessage::RegisterUdp(_))
            | NetworkMessage::Framework(FrameworkMessage::DiscoverHost(_)) => {
                // Server-originated or UDP-only control messages; unexpected
                // on an inbound TCP stream, silently dropped.
            }
            NetworkMessage::Framework(FrameworkMessage::KeepAlive(ka)) => {
                connection.fire_received(&NetworkMessage::Framework(FrameworkMessage::KeepAlive(ka)));
            }
            NetworkMessage::Framework(FrameworkMessage::Ping(ping)) => {
                if ping.is_reply {
                    connection.note_ping_reply(ping);
                } else {
                    let reply = crate::messages::Ping { id: ping.id, is_reply: true };
                    self.shared.send_tcp_to(connection, &NetworkMessage::Framework(FrameworkMessage::Ping(reply)));
                }
                connection.fire_received(&NetworkMessage::Framework(FrameworkMessage::Ping(ping)));
            }
            NetworkMessage::Application(app) => {
                connection.fire_received(&NetworkMessage::Application(app));
            }
        }
    }

    fn handle_udp_readable(&self) {
        let Some(udp) = self.shared.udp.lock().unwrap().clone() else { return };
        loop {
            match udp.read_from_address() {
                Ok(None) => return,
                Ok(Some((addr, bytes))) => self.handle_datagram(&udp, addr, &bytes),
                Err(e) => {
                    tracing::debug!(err = %e, "udp read failed");
                    return;
                }
            }
        }
    }

    fn handle_datagram(&self, udp: &crate::udp::UdpChannel, addr: std::net::SocketAddr, bytes: &[u8]) {
        let message = match self.shared.serialization.lock().unwrap().decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(%addr, err = %e, "udp decode failed, discarding datagram");
                return;
            }
        };
        match message {
            NetworkMessage::Framework(FrameworkMessage::RegisterUdp(reg)) => self.handle_register_udp(reg, addr),
            NetworkMessage::Framework(FrameworkMessage::DiscoverHost(_)) => {
                if let Some(handler) = &self.shared.discover_handler {
                    handler.handle_discover(udp, addr);
                }
            }
            _ => tracing::trace!(%addr, "udp datagram from unregistered source ignored"),
        }
    }

    fn handle_register_udp(&self, reg: RegisterUdp, addr: std::net::SocketAddr) {
        let id = ConnectionId(reg.connection_id);
        let promoted = self.shared.registry.lock().unwrap().promote_pending(id, addr);
        let Some(connection) = promoted else { return };
        self.shared.send_tcp_to(&connection, &NetworkMessage::Framework(FrameworkMessage::RegisterUdp(reg)));
        connection.mark_connected();
    }

    fn keep_alive_pass(&self, now: Instant) {
        for connection in self.shared.registry.lock().unwrap().established_snapshot() {
            if connection.framer.needs_keep_alive(now) {
                self.shared.send_tcp_to(&connection, &NetworkMessage::Framework(FrameworkMessage::KeepAlive(KeepAlive)));
            }
        }
    }

    fn timer_sweep(&self) {
        let now = Instant::now();
        for connection in self.shared.registry.lock().unwrap().established_snapshot() {
            if connection.framer.is_timed_out(now) {
                tracing::debug!(id = %connection.id(), "tcp timeout, closing");
                self.shared.close_connection_by_id(connection.id());
                continue;
            }
            if connection.framer.needs_keep_alive(now) {
                self.shared.send_tcp_to(&connection, &NetworkMessage::Framework(FrameworkMessage::KeepAlive(KeepAlive)));
            }
            if connection.framer.is_idle() {
                connection.fire_idle();
            }
        }
    }

    fn drain_all(&mut self) {
        let ids: Vec<ConnectionId> = {
            let registry = self.shared.registry.lock().unwrap();
            let mut ids: Vec<ConnectionId> = registry.established_snapshot().iter().map(|c| c.id()).collect();
            ids.extend(registry.pending_ids());
            ids
        };
        for id in ids {
            self.shared.close_connection_by_id(id);
        }
        if let Some(mut listener) = self.shared.listener.lock().unwrap().take() {
            let _ = self.shared.poll_registry.deregister(&mut listener);
        }
        if let Some(udp) = self.shared.udp.lock().unwrap().as_ref() {
            udp.close(&self.shared.poll_registry);
        }
        let _ = self.poll.poll(&mut self.events, Some(Duration::ZERO));
    }
}
