//! Connection-multiplexing core for a TCP/UDP object-messaging server.
//!
//! A single [`Server`] multiplexes many TCP sessions -- each optionally
//! paired with a UDP remote address bound via the `RegisterUDP` handshake
//! -- over one readiness-driven I/O thread. Object (de)serialization is an
//! external collaborator (see [`Serialization`]); this crate owns framing,
//! the UDP registration handshake, connection lifecycle, and
//! keep-alive/timeout/idle bookkeeping.

mod connection;
mod discover;
mod dispatcher;
mod error;
mod event_loop;
mod framer;
mod messages;
mod registry;
mod server;
mod udp;
mod varint;

pub use connection::{Connection, ConnectionId};
pub use discover::DiscoverHandler;
pub use dispatcher::Listener;
pub use error::Error;
pub use messages::{
    DiscoverHost, FrameworkMessage, KeepAlive, NetworkMessage, Ping, RegisterTcp, RegisterUdp, Serialization,
};
pub use server::{Server, ServerBuilder, ServerConfig};
pub use udp::UdpChannel;
