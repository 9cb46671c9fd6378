use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use linkmesh_net::{DiscoverHost, Error, FrameworkMessage, KeepAlive, NetworkMessage, Ping, RegisterTcp, RegisterUdp, Serialization};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMsg {
    Chat(String),
    Echo(Vec<u8>),
}

const TAG_REGISTER_TCP: u8 = 0;
const TAG_REGISTER_UDP: u8 = 1;
const TAG_KEEP_ALIVE: u8 = 2;
const TAG_PING: u8 = 3;
const TAG_DISCOVER_HOST: u8 = 4;
const TAG_APPLICATION: u8 = 5;

const APP_TAG_CHAT: u8 = 0;
const APP_TAG_ECHO: u8 = 1;

/// A hand-rolled tagged-byte codec used only by tests: a real
/// implementation of [`Serialization`] lives entirely outside this crate.
#[derive(Default)]
pub struct TestSerialization;

impl Serialization<TestMsg> for TestSerialization {
    fn encode(&mut self, buf: &mut Vec<u8>, message: &NetworkMessage<TestMsg>) -> Result<(), Error> {
        match message {
            NetworkMessage::Framework(FrameworkMessage::RegisterTcp(RegisterTcp { connection_id })) => {
                buf.push(TAG_REGISTER_TCP);
                buf.extend_from_slice(&connection_id.to_le_bytes());
            }
            NetworkMessage::Framework(FrameworkMessage::RegisterUdp(RegisterUdp { connection_id })) => {
                buf.push(TAG_REGISTER_UDP);
                buf.extend_from_slice(&connection_id.to_le_bytes());
            }
            NetworkMessage::Framework(FrameworkMessage::KeepAlive(KeepAlive)) => {
                buf.push(TAG_KEEP_ALIVE);
            }
            NetworkMessage::Framework(FrameworkMessage::Ping(Ping { id, is_reply })) => {
                buf.push(TAG_PING);
                buf.extend_from_slice(&id.to_le_bytes());
                buf.push(u8::from(*is_reply));
            }
            NetworkMessage::Framework(FrameworkMessage::DiscoverHost(DiscoverHost)) => {
                buf.push(TAG_DISCOVER_HOST);
            }
            NetworkMessage::Application(TestMsg::Chat(text)) => {
                buf.push(TAG_APPLICATION);
                buf.push(APP_TAG_CHAT);
                let bytes = text.as_bytes();
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            NetworkMessage::Application(TestMsg::Echo(data)) => {
                buf.push(TAG_APPLICATION);
                buf.push(APP_TAG_ECHO);
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
            }
        }
        Ok(())
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<NetworkMessage<TestMsg>, Error> {
        let (&tag, rest) = bytes.split_first().ok_or_else(|| Error::Serialization("empty frame".into()))?;
        match tag {
            TAG_REGISTER_TCP => {
                let connection_id = read_i32(rest)?;
                Ok(NetworkMessage::Framework(FrameworkMessage::RegisterTcp(RegisterTcp { connection_id })))
            }
            TAG_REGISTER_UDP => {
                let connection_id = read_i32(rest)?;
                Ok(NetworkMessage::Framework(FrameworkMessage::RegisterUdp(RegisterUdp { connection_id })))
            }
            TAG_KEEP_ALIVE => Ok(NetworkMessage::Framework(FrameworkMessage::KeepAlive(KeepAlive))),
            TAG_PING => {
                let id = read_i32(rest)?;
                let is_reply = *rest.get(4).ok_or_else(|| Error::Serialization("truncated ping".into()))? != 0;
                Ok(NetworkMessage::Framework(FrameworkMessage::Ping(Ping { id, is_reply })))
            }
            TAG_DISCOVER_HOST => Ok(NetworkMessage::Framework(FrameworkMessage::DiscoverHost(DiscoverHost))),
            TAG_APPLICATION => {
                let (&app_tag, rest) = rest.split_first().ok_or_else(|| Error::Serialization("truncated application frame".into()))?;
                let len = u32::from_le_bytes(
                    rest.get(..4).ok_or_else(|| Error::Serialization("truncated length".into()))?.try_into().unwrap(),
                ) as usize;
                let payload = rest.get(4..4 + len).ok_or_else(|| Error::Serialization("truncated payload".into()))?;
                match app_tag {
                    APP_TAG_CHAT => {
                        let text = String::from_utf8(payload.to_vec()).map_err(|e| Error::Serialization(e.to_string()))?;
                        Ok(NetworkMessage::Application(TestMsg::Chat(text)))
                    }
                    APP_TAG_ECHO => Ok(NetworkMessage::Application(TestMsg::Echo(payload.to_vec()))),
                    other => Err(Error::Serialization(format!("unknown application tag {other}"))),
                }
            }
            other => Err(Error::Serialization(format!("unknown framework tag {other}"))),
        }
    }
}

fn read_i32(bytes: &[u8]) -> Result<i32, Error> {
    let array: [u8; 4] = bytes.get(..4).ok_or_else(|| Error::Serialization("truncated i32".into()))?.try_into().unwrap();
    Ok(i32::from_le_bytes(array))
}

/// Polls `condition` until it returns true or `timeout` elapses, sleeping
/// briefly between attempts. Returns whether the condition was met.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Minimal client-side varint length-prefix framing, independent of the
/// crate's own (private) codec, so tests exercise the wire format as a
/// real peer would rather than reaching into crate internals.
pub fn write_client_frame(stream: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    let mut len = payload.len() as u32;
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        stream.write_all(&[byte])?;
        if len == 0 {
            break;
        }
    }
    stream.write_all(payload)
}

pub fn read_client_frame(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len: u32 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        len |= u32::from(byte[0] & 0x7f) << shift;
        shift += 7;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload)?;
    }
    Ok(payload)
}
