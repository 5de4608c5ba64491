//! The byte-level socket interface the connection engine drives.
//! Kept minimal on purpose: wait for readability, count what can be
//! read without blocking, move bytes, name the peer.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::constants::BUFFER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Timeout,
    Error,
}

pub trait Socket {
    /// Blocks until the socket is ready in the requested direction or
    /// the timeout passes.
    fn wait(&mut self, for_read: bool, for_write: bool, timeout: Duration) -> WaitResult;

    /// Bytes readable right now without blocking.
    fn available_read_bytes(&mut self) -> u32;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn peer_name(&self) -> io::Result<SocketAddr>;
}

/// Blocking TCP implementation. Readability and the available-byte
/// count both come from `peek`, so no platform poll call is needed.
pub struct TcpSocket {
    stream: TcpStream,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> TcpSocket {
        TcpSocket { stream }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl Socket for TcpSocket {
    fn wait(&mut self, for_read: bool, _for_write: bool, timeout: Duration) -> WaitResult {
        if !for_read {
            // a blocking stream accepts writes whenever the kernel
            // buffer drains; there is nothing to wait for here
            return WaitResult::Ready;
        }

        let timeout = timeout.max(Duration::from_millis(1));
        if self.stream.set_read_timeout(Some(timeout)).is_err() {
            return WaitResult::Error;
        }

        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            // a zero-byte peek means orderly shutdown; the socket is
            // "ready" and the available count will come back as zero
            Ok(_) => WaitResult::Ready,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                WaitResult::Timeout
            }
            Err(_) => WaitResult::Error,
        }
    }

    fn available_read_bytes(&mut self) -> u32 {
        if self.stream.set_nonblocking(true).is_err() {
            return 0;
        }
        let mut scratch = [0u8; BUFFER_SIZE];
        let available = match self.stream.peek(&mut scratch) {
            Ok(n) => n as u32,
            Err(_) => 0,
        };
        let _ = self.stream.set_nonblocking(false);
        available
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn peer_name(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}
