//! The network manager collaborator: UDP multicast publish/subscribe on
//! `224.1.1.1:50000`, TTL 1, with transparent reconnection on send/receive
//! failure.
//!
//! Treated as an external collaborator reachable only through `send`,
//! `receive`, and `connected`. socket2 is used because
//! `std::net::UdpSocket` has no portable way to set `SO_REUSEPORT`, needed
//! alongside `SO_REUSEADDR` so multiple group members can share one host.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
#[cfg(test)]
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::error::NodeError;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);
pub const MULTICAST_PORT: u16 = 50000;
const MULTICAST_TTL: u32 = 1;
const RECV_BUFFER: usize = 65536;

pub struct NetworkManager {
    group_addr: SocketAddr,
    socket: Mutex<std::net::UdpSocket>,
    connected: AtomicBool,
}

impl NetworkManager {
    /// Binds the multicast socket. A bind failure here is fatal to the node —
    /// there is no group to rejoin without a working socket.
    pub fn bind() -> Result<NetworkManager, NodeError> {
        let group_addr = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT));
        let socket = Self::open_socket().map_err(|source| NodeError::Bind {
            addr: group_addr,
            source,
        })?;
        Ok(NetworkManager {
            group_addr,
            socket: Mutex::new(socket),
            connected: AtomicBool::new(true),
        })
    }

    fn open_socket() -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.set_multicast_loop_v4(true)?;
        let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into();
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        Ok(socket.into())
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes and reopens the socket. Called on send/receive failure and by
    /// the main loop after a detected disconnection.
    pub fn reconnect(&self) {
        match Self::open_socket() {
            Ok(fresh) => {
                *self.socket.lock().unwrap() = fresh;
                self.connected.store(true, Ordering::SeqCst);
                log::info!("network: reconnected to multicast group");
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                log::warn!("network: reconnect failed: {e}");
            }
        }
    }

    /// Publishes `bytes` to the multicast group. Returns `false` on failure
    /// after one reconnect-and-retry attempt.
    pub fn send(&self, bytes: &[u8]) -> bool {
        if !self.connected() {
            self.reconnect();
            if !self.connected() {
                return false;
            }
        }

        if self.try_send(bytes) {
            return true;
        }

        self.connected.store(false, Ordering::SeqCst);
        self.reconnect();
        if self.connected() {
            self.try_send(bytes)
        } else {
            false
        }
    }

    fn try_send(&self, bytes: &[u8]) -> bool {
        let socket = self.socket.lock().unwrap();
        socket.send_to(bytes, self.group_addr).is_ok()
    }

    /// Blocks until a datagram arrives, or returns `None` on a transient
    /// failure (the caller's receive loop should back off and retry).
    pub fn receive(&self) -> Option<(Vec<u8>, SocketAddr)> {
        if !self.connected() {
            self.reconnect();
            if !self.connected() {
                return None;
            }
        }

        let mut buf = vec![0u8; RECV_BUFFER];
        let result = {
            let socket = self.socket.lock().unwrap();
            socket.recv_from(&mut buf)
        };

        match result {
            Ok((n, from)) => {
                buf.truncate(n);
                Some((buf, from))
            }
            Err(e) => {
                log::warn!("network: receive failed: {e}");
                self.connected.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_succeeds_and_reports_connected() {
        // Binding twice on the same host is legal for this socket (REUSEADDR
        // + REUSEPORT + multicast membership), mirroring multiple group
        // members running on one machine during local testing.
        let a = NetworkManager::bind().unwrap();
        let b = NetworkManager::bind().unwrap();
        assert!(a.connected());
        assert!(b.connected());
    }

    #[test]
    fn send_and_receive_round_trip_over_the_multicast_group() {
        let sender = NetworkManager::bind().unwrap();
        let receiver = NetworkManager::bind().unwrap();
        receiver
            .socket
            .lock()
            .unwrap()
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let payload = format!("hello-{:?}", std::thread::current().id());
        assert!(sender.send(payload.as_bytes()));

        // Other tests in this module share the multicast port, so loop past
        // any unrelated datagram until ours arrives or the read times out.
        for _ in 0..64 {
            match receiver.receive() {
                Some((data, _from)) if data == payload.as_bytes() => return,
                Some(_) => continue,
                None => break,
            }
        }
        panic!("expected datagram never arrived");
    }
}
