use std::net::SocketAddr;

use crate::udp::UdpChannel;

/// External collaborator invoked when a `DiscoverHost` broadcast arrives
/// over UDP. May send an application-defined response datagram directly
/// on `channel`; does not otherwise touch connection state.
pub trait DiscoverHandler: Send + Sync {
    fn handle_discover(&self, channel: &UdpChannel, from: SocketAddr);
}
