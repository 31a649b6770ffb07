//! # Datagram Transport
//!
//! The connection and scheduler crates are pure logic; this trait is the
//! seam a host plugs a real socket into, the same way `strata-bonding`'s
//! `LinkSender` decouples `BondingScheduler` from the concrete link (§6A).

use std::io;
use std::net::{SocketAddr, UdpSocket};

/// A datagram endpoint capable of sending to and receiving from a single
/// peer address. Implemented here over `std::net::UdpSocket`; a DPDK ring
/// or in-memory channel is a future impl of the same trait, not a parallel
/// code path.
pub trait Datagram: Send + Sync {
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    /// Local address this transport is bound to, used for checksum
    /// pseudo-header computation on send.
    fn local_ip(&self) -> io::Result<[u8; 4]>;
}

/// Plain UDP socket transport (§9 Open Question: "a plain `Datagram` trait
/// over `std::net::UdpSocket`").
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(UdpTransport { socket })
    }

    /// Wrap an already-bound, already-connected socket (tests commonly want
    /// this to avoid the real bind/connect dance).
    pub fn from_socket(socket: UdpSocket) -> Self {
        UdpTransport { socket }
    }

    /// Set a read timeout so the runtime's receive loop can poll
    /// `is_destroyed` and the retransmit deadline between datagrams, rather
    /// than blocking forever.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}

impl Datagram for UdpTransport {
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, dst)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn local_ip(&self) -> io::Result<[u8; 4]> {
        match self.socket.local_addr()?.ip() {
            std::net::IpAddr::V4(v4) => Ok(v4.octets()),
            std::net::IpAddr::V6(_) => Ok([0, 0, 0, 0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_transport_round_trips_a_datagram() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        a.send_to(b"hello", b_addr).unwrap();
        let mut buf = [0u8; 16];
        let (n, _from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn local_ip_reports_loopback() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(a.local_ip().unwrap(), [127, 0, 0, 1]);
    }
}
