//! # Socket
//!
//! Non-blocking UDP datagram I/O.
//!
//! [`Socket`] wraps a `std::net::UdpSocket` opened in non-blocking mode. A receive
//! with nothing pending returns `Ok(None)` immediately; callers drain a socket by
//! looping until they observe `None`.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use tracing::{debug, instrument};

use crate::core::address::Address;
use crate::error::{NetError, Result};

/// Receive buffer size large enough for any datagram this crate produces
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Socket open options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// Allow sending to the broadcast address
    pub broadcast: bool,
}

/// Non-blocking UDP socket bound to an IPv4 port
#[derive(Debug)]
pub struct Socket {
    inner: UdpSocket,
    port: u16,
}

impl Socket {
    /// Bind to `0.0.0.0:port`. Port 0 picks an ephemeral port.
    #[instrument(level = "debug")]
    pub fn open(port: u16, options: SocketOptions) -> Result<Self> {
        let inner = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| NetError::Bind { port, source })?;
        inner
            .set_nonblocking(true)
            .map_err(|source| NetError::Bind { port, source })?;
        if options.broadcast {
            inner
                .set_broadcast(true)
                .map_err(|source| NetError::Bind { port, source })?;
        }
        let port = inner.local_addr()?.port();
        debug!(port, "Socket opened");
        Ok(Self { inner, port })
    }

    /// The port actually bound
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one datagram. A full send buffer is reported as `Ok(false)`.
    pub fn send(&self, destination: Address, data: &[u8]) -> Result<bool> {
        match self.inner.send_to(data, SocketAddrV4::from(destination)) {
            Ok(sent) => Ok(sent == data.len()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Receive one datagram into `buffer`, or `Ok(None)` when nothing is pending.
    ///
    /// Datagrams from IPv6 peers and ICMP-induced connection resets are skipped.
    pub fn receive(&self, buffer: &mut [u8]) -> Result<Option<(Address, usize)>> {
        loop {
            match self.inner.recv_from(buffer) {
                Ok((size, from)) => match Address::try_from(from) {
                    Ok(sender) => return Ok(Some((sender, size))),
                    Err(_) => continue,
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(NetError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_receive_returns_none() {
        let socket = Socket::open(0, SocketOptions::default()).expect("bind");
        let mut buffer = [0u8; 64];
        assert!(socket.receive(&mut buffer).expect("receive").is_none());
    }

    #[test]
    fn test_loopback_datagram() {
        let a = Socket::open(0, SocketOptions::default()).expect("bind a");
        let b = Socket::open(0, SocketOptions::default()).expect("bind b");
        assert!(a.send(Address::loopback(b.port()), b"hello").expect("send"));

        let mut buffer = [0u8; 64];
        let mut received = None;
        for _ in 0..200 {
            if let Some(result) = b.receive(&mut buffer).expect("receive") {
                received = Some(result);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (from, size) = received.expect("datagram arrives on loopback");
        assert_eq!(&buffer[..size], b"hello");
        assert_eq!(from.port(), a.port());
    }
}
