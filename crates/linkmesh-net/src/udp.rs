use std::{io, net::SocketAddr, sync::Mutex};

use mio::{Registry, net::UdpSocket};

use crate::error::Error;

struct UdpInner {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

/// The server's single UDP socket. Reads happen only from the I/O thread;
/// sends may come from any thread, so the socket and its scratch receive
/// buffer live behind one lock.
pub struct UdpChannel {
    inner: Mutex<UdpInner>,
}

impl UdpChannel {
    pub fn new(socket: UdpSocket, object_buffer_size: usize) -> Self {
        Self { inner: Mutex::new(UdpInner { socket, recv_buf: vec![0u8; object_buffer_size] }) }
    }

    pub fn read_from_address(&self) -> Result<Option<(SocketAddr, Vec<u8>)>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let UdpInner { socket, recv_buf } = &mut *inner;
        match socket.recv_from(recv_buf) {
            Ok((n, addr)) => Ok(Some((addr, recv_buf[..n].to_vec()))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// `Ok(Some(n))`: sent. `Ok(None)`: kernel send buffer full, datagram
    /// dropped (non-fatal). `Err`: encode failure or other I/O error.
    pub fn send(
        &self,
        addr: SocketAddr,
        encode_into: impl FnOnce(&mut Vec<u8>) -> Result<(), Error>,
    ) -> Result<Option<usize>, Error> {
        let mut buf = Vec::new();
        encode_into(&mut buf)?;
        let inner = self.inner.lock().unwrap();
        match inner.socket.send_to(&buf, addr) {
            Ok(n) => Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn close(&self, registry: &Registry) {
        let mut inner = self.inner.lock().unwrap();
        let _ = registry.deregister(&mut inner.socket);
    }
}
