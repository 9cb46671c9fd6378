//! Per-connection TCP framing: a varint length prefix followed by the
//! payload, read and written against a non-blocking [`mio::net::TcpStream`].
//!
//! Reads happen only from the I/O thread (one [`Framer::read_frame`] call
//! per readiness event, looped until it would block). Writes (`send`,
//! `write_operation`) may be called from any thread -- mio's
//! `Registry::reregister` takes `&mut TcpStream` regardless of which side
//! is calling, so both read and write state live behind one
//! [`Mutex<FramerState>`], which also serves as the per-connection write
//! lock that serializes concurrent senders.

use std::{
    io::{self, Read, Write},
    time::Instant,
};

use mio::{Interest, Registry, Token};

use crate::{
    error::Error,
    varint::{self, VarintReader},
};

#[derive(Debug, Clone, Copy)]
enum RxState {
    ReadingLength(VarintReader),
    ReadingPayload { len: usize, have: usize },
}

struct FramerState {
    stream: mio::net::TcpStream,

    rx_state: RxState,
    read_buf: Vec<u8>,
    last_read_time: Instant,

    write_buf: Vec<u8>,
    write_position: usize,
    writable_armed: bool,
    last_write_time: Instant,
}

pub struct Framer {
    state: std::sync::Mutex<FramerState>,
    token: Token,
    object_buffer_size: usize,
    write_buffer_size: usize,
    keep_alive_millis: u64,
    timeout_millis: u64,
    idle_threshold: f64,
}

fn io_closed() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"))
}

impl Framer {
    pub fn new(
        stream: mio::net::TcpStream,
        token: Token,
        object_buffer_size: usize,
        write_buffer_size: usize,
        keep_alive_millis: u64,
        timeout_millis: u64,
        idle_threshold: f64,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let now = Instant::now();
        Ok(Self {
            state: std::sync::Mutex::new(FramerState {
                stream,
                rx_state: RxState::ReadingLength(VarintReader::new()),
                read_buf: vec![0u8; object_buffer_size],
                last_read_time: now,
                write_buf: vec![0u8; write_buffer_size],
                write_position: 0,
                writable_armed: false,
                last_write_time: now,
            }),
            token,
            object_buffer_size,
            write_buffer_size,
            keep_alive_millis,
            timeout_millis,
            idle_threshold,
        })
    }

    /// Reads and advances the frame state machine until either a full
    /// frame is available, the socket would block, or the connection is
    /// found to be closed/broken (returned as `Err`).
    pub fn read_frame(&self) -> Result<Option<Vec<u8>>, Error> {
        let mut guard = self.state.lock().unwrap();
        loop {
            match guard.rx_state {
                RxState::ReadingLength(mut reader) => {
                    let mut byte = [0u8; 1];
                    match guard.stream.read(&mut byte) {
                        Ok(0) => return Err(io_closed()),
                        Ok(_) => {
                            guard.last_read_time = Instant::now();
                            match reader.push(byte[0]) {
                                Ok(Some(len)) => {
                                    let len = len as usize;
                                    if len > self.object_buffer_size {
                                        return Err(Error::Framing(format!(
                                            "frame length {len} exceeds object buffer size {}",
                                            self.object_buffer_size
                                        )));
                                    }
                                    guard.rx_state = RxState::ReadingPayload { len, have: 0 };
                                }
                                Ok(None) => guard.rx_state = RxState::ReadingLength(reader),
                                Err(e) => return Err(e),
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
                RxState::ReadingPayload { len, mut have } => {
                    if len == 0 {
                        // Reading into an empty slice would return Ok(0), which
                        // would otherwise be mistaken for a closed socket.
                        guard.rx_state = RxState::ReadingLength(VarintReader::new());
                        return Ok(Some(Vec::new()));
                    }
                    match guard.stream.read(&mut guard.read_buf[have..len]) {
                        Ok(0) => return Err(io_closed()),
                        Ok(n) => {
                            guard.last_read_time = Instant::now();
                            have += n;
                            if have == len {
                                let frame = guard.read_buf[..len].to_vec();
                                guard.rx_state = RxState::ReadingLength(VarintReader::new());
                                return Ok(Some(frame));
                            }
                            guard.rx_state = RxState::ReadingPayload { len, have };
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            guard.rx_state = RxState::ReadingPayload { len, have };
                            return Ok(None);
                        }
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
            }
        }
    }

    /// Encodes `message` (via `encode_into`, which reserves space for the
    /// prefix and backfills it once the payload length is known), then
    /// writes it immediately if the write buffer is empty, or queues it
    /// otherwise. Returns the encoded payload length (excluding the
    /// prefix) on success.
    pub fn send(
        &self,
        registry: &Registry,
        encode_into: impl FnOnce(&mut Vec<u8>) -> Result<(), Error>,
    ) -> Result<usize, Error> {
        let mut scratch = vec![0u8; varint::MAX_VARINT_BYTES];
        encode_into(&mut scratch)?;
        let payload_len = scratch.len() - varint::MAX_VARINT_BYTES;

        let prefix_len = varint::varint_len(payload_len as u32);
        let start = varint::MAX_VARINT_BYTES - prefix_len;
        let mut prefix = Vec::with_capacity(prefix_len);
        varint::write_varint(&mut prefix, payload_len as u32);
        scratch[start..varint::MAX_VARINT_BYTES].copy_from_slice(&prefix);
        let frame_len = scratch.len() - start;

        let mut guard = self.state.lock().unwrap();
        let available = self.write_buffer_size - guard.write_position;
        if frame_len > available {
            return Err(Error::BufferOverflow { needed: frame_len, available });
        }

        if guard.write_position == 0 {
            match guard.stream.write(&scratch[start..]) {
                Ok(n) if n == frame_len => {
                    guard.last_write_time = Instant::now();
                    return Ok(payload_len);
                }
                Ok(n) => self.queue_remainder(&mut guard, registry, &scratch[start + n..])?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.queue_remainder(&mut guard, registry, &scratch[start..])?;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        } else {
            self.queue_remainder(&mut guard, registry, &scratch[start..])?;
        }
        guard.last_write_time = Instant::now();
        Ok(payload_len)
    }

    fn queue_remainder(
        &self,
        guard: &mut FramerState,
        registry: &Registry,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let pos = guard.write_position;
        guard.write_buf[pos..pos + bytes.len()].copy_from_slice(bytes);
        guard.write_position += bytes.len();
        if !guard.writable_armed {
            registry.reregister(&mut guard.stream, self.token, Interest::READABLE | Interest::WRITABLE)?;
            guard.writable_armed = true;
        }
        Ok(())
    }

    /// Drains as much of the queued backlog as the socket accepts right
    /// now. Called when the connection's token reports writable.
    pub fn write_operation(&self, registry: &Registry) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        while guard.write_position > 0 {
            match guard.stream.write(&guard.write_buf[..guard.write_position]) {
                Ok(0) => return Err(io_closed()),
                Ok(n) => {
                    guard.write_buf.copy_within(n..guard.write_position, 0);
                    guard.write_position -= n;
                    guard.last_write_time = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        if guard.write_position == 0 && guard.writable_armed {
            registry.reregister(&mut guard.stream, self.token, Interest::READABLE)?;
            guard.writable_armed = false;
        }
        Ok(())
    }

    pub fn needs_keep_alive(&self, now: Instant) -> bool {
        if self.keep_alive_millis == 0 {
            return false;
        }
        let guard = self.state.lock().unwrap();
        now.duration_since(guard.last_write_time).as_millis() as u64 > self.keep_alive_millis
            && guard.write_position == 0
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        if self.timeout_millis == 0 {
            return false;
        }
        let guard = self.state.lock().unwrap();
        now.duration_since(guard.last_read_time).as_millis() as u64 > self.timeout_millis
    }

    pub fn is_idle(&self) -> bool {
        let guard = self.state.lock().unwrap();
        (guard.write_position as f64 / self.write_buffer_size as f64) < self.idle_threshold
    }

    pub fn close(&self, registry: &Registry) {
        let mut guard = self.state.lock().unwrap();
        let _ = registry.deregister(&mut guard.stream);
        let _ = guard.stream.shutdown(std::net::Shutdown::Both);
    }
}
