// io/loopback.rs - in-memory transports: a byte-stream pair with socket
// semantics and a connected packet-device pair. Deterministic stand-ins for
// the kernel-bypass stacks, used by the test suite and available to
// applications for harness work.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use bytes::Bytes;

use crate::api::{PacketDevice, StreamTransport};
use crate::packet::MacAddr;

const DEFAULT_STREAM_CAPACITY: usize = 256 * 1024;
const DEFAULT_RING_DEPTH: usize = 512;

fn would_block() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "loopback would block")
}

/// Handle naming one socket owned by a [`LoopStream`] context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopSock(u64);

#[derive(Debug)]
struct Sock {
    local: SocketAddr,
    peer: Option<u64>,
    rx: VecDeque<u8>,
    listening: bool,
    backlog: VecDeque<u64>,
    peer_closed: bool,
}

impl Sock {
    fn new(local: SocketAddr) -> Self {
        Self {
            local,
            peer: None,
            rx: VecDeque::new(),
            listening: false,
            backlog: VecDeque::new(),
            peer_closed: false,
        }
    }
}

/// In-memory byte-stream transport.
///
/// Connections are buffered byte pipes with bounded capacity, so short
/// writes and would-block behave like a real non-blocking stack. The
/// per-call read cap makes partial-read schedules reproducible.
#[derive(Debug)]
pub struct LoopStream {
    socks: AHashMap<u64, Sock>,
    listeners: AHashMap<u16, u64>,
    next: u64,
    next_port: u16,
    capacity: usize,
    read_cap: Option<usize>,
}

impl Default for LoopStream {
    fn default() -> Self {
        Self {
            socks: AHashMap::new(),
            listeners: AHashMap::new(),
            next: 0,
            next_port: 50_000,
            capacity: DEFAULT_STREAM_CAPACITY,
            read_cap: None,
        }
    }
}

impl LoopStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps how many bytes any one `read` call may return.
    pub fn set_read_cap(&mut self, cap: Option<usize>) {
        self.read_cap = cap;
    }

    /// Sets the per-connection buffer capacity for subsequent writes.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    fn get(&self, h: LoopSock) -> io::Result<&Sock> {
        self.socks
            .get(&h.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }

    fn get_mut(&mut self, h: LoopSock) -> io::Result<&mut Sock> {
        self.socks
            .get_mut(&h.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }

    fn alloc(&mut self, local: SocketAddr) -> u64 {
        let id = self.next;
        self.next += 1;
        self.socks.insert(id, Sock::new(local));
        id
    }

    fn ephemeral(&mut self) -> SocketAddr {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(50_000);
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }
}

impl StreamTransport for LoopStream {
    type Handle = LoopSock;

    fn socket(&mut self) -> io::Result<LoopSock> {
        let local = self.ephemeral();
        Ok(LoopSock(self.alloc(local)))
    }

    fn bind(&mut self, h: LoopSock, addr: SocketAddr) -> io::Result<()> {
        self.get_mut(h)?.local = addr;
        Ok(())
    }

    fn listen(&mut self, h: LoopSock, _backlog: u32) -> io::Result<()> {
        let port = match self.get(h)?.local {
            SocketAddr::V4(v4) => v4.port(),
            SocketAddr::V6(v6) => v6.port(),
        };
        self.get_mut(h)?.listening = true;
        self.listeners.insert(port, h.0);
        Ok(())
    }

    fn accept(&mut self, h: LoopSock) -> io::Result<(LoopSock, SocketAddr)> {
        let id = {
            let sock = self.get_mut(h)?;
            if !sock.listening {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "accept on a non-listening socket",
                ));
            }
            sock.backlog.pop_front().ok_or_else(would_block)?
        };
        let peer_id = self.socks[&id].peer.expect("half-open backlog entry");
        let peer_addr = self.socks[&peer_id].local;
        Ok((LoopSock(id), peer_addr))
    }

    fn connect(&mut self, h: LoopSock, addr: SocketAddr) -> io::Result<()> {
        let port = match addr {
            SocketAddr::V4(v4) => v4.port(),
            SocketAddr::V6(v6) => v6.port(),
        };
        let listener = *self.listeners.get(&port).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no listener on port")
        })?;

        let server_id = self.alloc(addr);
        self.socks.get_mut(&server_id).expect("just allocated").peer = Some(h.0);
        self.get_mut(h)?.peer = Some(server_id);
        self.socks
            .get_mut(&listener)
            .expect("listener exists")
            .backlog
            .push_back(server_id);
        Ok(())
    }

    fn close(&mut self, h: LoopSock) -> io::Result<()> {
        let sock = self
            .socks
            .remove(&h.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))?;
        if let Some(peer) = sock.peer {
            if let Some(peer_sock) = self.socks.get_mut(&peer) {
                peer_sock.peer_closed = true;
            }
        }
        if sock.listening {
            let port = match sock.local {
                SocketAddr::V4(v4) => v4.port(),
                SocketAddr::V6(v6) => v6.port(),
            };
            self.listeners.remove(&port);
        }
        Ok(())
    }

    fn read(&mut self, h: LoopSock, buf: &mut [u8]) -> io::Result<usize> {
        let cap = self.read_cap.unwrap_or(usize::MAX);
        let sock = self.get_mut(h)?;
        if sock.rx.is_empty() {
            if sock.peer_closed {
                return Ok(0);
            }
            return Err(would_block());
        }
        let take = buf.len().min(cap).min(sock.rx.len());
        for slot in buf.iter_mut().take(take) {
            *slot = sock.rx.pop_front().expect("length checked");
        }
        Ok(take)
    }

    fn writev(&mut self, h: LoopSock, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let capacity = self.capacity;
        let peer = self
            .get(h)?
            .peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not connected"))?;
        let peer_sock = self
            .socks
            .get_mut(&peer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;

        let room = capacity.saturating_sub(peer_sock.rx.len());
        if room == 0 {
            return Err(would_block());
        }
        let mut written = 0;
        'outer: for buf in bufs {
            for byte in buf.iter() {
                if written == room {
                    break 'outer;
                }
                peer_sock.rx.push_back(*byte);
                written += 1;
            }
        }
        Ok(written)
    }

    fn set_nonblocking(&mut self, h: LoopSock, _on: bool) -> io::Result<()> {
        self.get(h).map(drop)
    }

    fn set_nodelay(&mut self, h: LoopSock, _on: bool) -> io::Result<()> {
        self.get(h).map(drop)
    }

    fn local_addr(&self, h: LoopSock) -> io::Result<SocketAddr> {
        Ok(self.get(h)?.local)
    }
}

#[derive(Debug)]
struct Ring {
    frames: VecDeque<Bytes>,
    depth: usize,
}

impl Ring {
    fn new(depth: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            depth,
        }
    }
}

/// One end of a connected in-memory packet-device pair.
///
/// Rings are bounded; a full peer ring accepts a shorter prefix of the
/// transmit burst, the way a saturated NIC ring would.
#[derive(Debug)]
pub struct LoopDevice {
    mac: MacAddr,
    out: Arc<Mutex<Ring>>,
    inbound: Arc<Mutex<Ring>>,
    promiscuous: bool,
}

impl LoopDevice {
    /// Creates a connected pair with the default ring depth.
    pub fn pair(mac_a: MacAddr, mac_b: MacAddr) -> (Self, Self) {
        Self::pair_with_depth(mac_a, mac_b, DEFAULT_RING_DEPTH)
    }

    /// Promiscuous mode as last set; the loopback delivers every frame
    /// either way, mirroring a port left in promiscuous mode.
    pub fn promiscuous(&self) -> bool {
        self.promiscuous
    }

    /// Creates a connected pair with a specific ring depth.
    pub fn pair_with_depth(mac_a: MacAddr, mac_b: MacAddr, depth: usize) -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Ring::new(depth)));
        let b_to_a = Arc::new(Mutex::new(Ring::new(depth)));
        (
            Self {
                mac: mac_a,
                out: Arc::clone(&a_to_b),
                inbound: Arc::clone(&b_to_a),
                promiscuous: false,
            },
            Self {
                mac: mac_b,
                out: b_to_a,
                inbound: a_to_b,
                promiscuous: false,
            },
        )
    }
}

impl PacketDevice for LoopDevice {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn tx_burst(&mut self, frames: &mut VecDeque<Bytes>) -> io::Result<usize> {
        let mut ring = self.out.lock().expect("ring lock");
        let mut accepted = 0;
        while ring.frames.len() < ring.depth {
            match frames.pop_front() {
                Some(frame) => {
                    ring.frames.push_back(frame);
                    accepted += 1;
                }
                None => break,
            }
        }
        Ok(accepted)
    }

    fn rx_burst(&mut self, max: usize) -> io::Result<Vec<Bytes>> {
        let mut ring = self.inbound.lock().expect("ring lock");
        let take = max.min(ring.frames.len());
        Ok(ring.frames.drain(..take).collect())
    }

    fn set_promiscuous(&mut self, on: bool) -> io::Result<()> {
        self.promiscuous = on;
        Ok(())
    }

    fn link_up(&self) -> io::Result<bool> {
        Ok(true)
    }
}
