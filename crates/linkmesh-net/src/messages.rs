use crate::error::Error;

/// Sent by the server immediately after accepting a TCP connection, giving
/// the peer its assigned id so it can bind a UDP channel to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterTcp {
    pub connection_id: i32,
}

/// Sent by the peer over UDP to bind its source address to a pending
/// TCP connection; echoed back over TCP once the bind succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterUdp {
    pub connection_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAlive;

/// Round-trip latency probe. `is_reply` distinguishes a probe from its
/// echo; a probe received with `is_reply == false` is auto-replied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: i32,
    pub is_reply: bool,
}

/// UDP broadcast used by peers to locate a server without knowing its
/// address in advance. Handling is delegated to a [`crate::DiscoverHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscoverHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkMessage {
    RegisterTcp(RegisterTcp),
    RegisterUdp(RegisterUdp),
    KeepAlive(KeepAlive),
    Ping(Ping),
    DiscoverHost(DiscoverHost),
}

/// Everything that can travel across a framed connection: the fixed
/// framework vocabulary, or an application-defined object.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage<A> {
    Framework(FrameworkMessage),
    Application(A),
}

impl<A> From<FrameworkMessage> for NetworkMessage<A> {
    fn from(value: FrameworkMessage) -> Self {
        NetworkMessage::Framework(value)
    }
}

/// The external (de)serialization collaborator. Owns the wire format for
/// application objects; framework messages still pass through it so a
/// single codec covers the whole connection, but their encoding is fixed
/// by this crate's tests, not by callers.
pub trait Serialization<A>: Send + 'static {
    /// Appends the encoded form of `message` to the end of `buf`. `buf`
    /// arrives non-empty (it already holds scratch space for the length
    /// prefix the framer backfills afterward) and must only ever be
    /// appended to: never `clear`, `truncate`, drain, or otherwise
    /// shrink/reassign it, or the caller's length-prefix bookkeeping
    /// (computed from `buf.len()` before and after this call) breaks.
    fn encode(&mut self, buf: &mut Vec<u8>, message: &NetworkMessage<A>) -> Result<(), Error>;
    fn decode(&mut self, bytes: &[u8]) -> Result<NetworkMessage<A>, Error>;
}
