// io/host.rs - host-socket implementation of the byte-stream transport

use std::io::{self, IoSlice, Read};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use ahash::AHashMap;
use socket2::{Domain, Protocol, Socket, Type};

use crate::api::StreamTransport;

/// Handle naming one socket owned by a [`HostStream`] context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostSock(u64);

/// Byte-stream transport backed by kernel TCP sockets.
///
/// One context owns every socket it creates, mirroring the shape of a
/// userspace stack context. Sockets start in blocking mode; the queue layer
/// flips them non-blocking at the points the protocol requires.
#[derive(Debug, Default)]
pub struct HostStream {
    sockets: AHashMap<u64, Socket>,
    next: u64,
}

impl HostStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, h: HostSock) -> io::Result<&Socket> {
        self.sockets
            .get(&h.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }

    fn adopt(&mut self, socket: Socket) -> HostSock {
        let id = self.next;
        self.next += 1;
        self.sockets.insert(id, socket);
        HostSock(id)
    }
}

impl StreamTransport for HostStream {
    type Handle = HostSock;

    fn socket(&mut self) -> io::Result<HostSock> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        Ok(self.adopt(socket))
    }

    fn bind(&mut self, h: HostSock, addr: SocketAddr) -> io::Result<()> {
        self.get(h)?.bind(&addr.into())
    }

    fn listen(&mut self, h: HostSock, backlog: u32) -> io::Result<()> {
        self.get(h)?.listen(backlog.min(i32::MAX as u32) as i32)
    }

    fn accept(&mut self, h: HostSock) -> io::Result<(HostSock, SocketAddr)> {
        let (socket, addr) = self.get(h)?.accept()?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((self.adopt(socket), addr))
    }

    fn connect(&mut self, h: HostSock, addr: SocketAddr) -> io::Result<()> {
        match self.get(h)?.connect(&addr.into()) {
            Ok(()) => Ok(()),
            // a non-blocking kernel connect reports EINPROGRESS; normalize
            // to the trait's would-block convention
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, err))
            }
            Err(err) => Err(err),
        }
    }

    fn close(&mut self, h: HostSock) -> io::Result<()> {
        self.sockets
            .remove(&h.0)
            .map(drop)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }

    fn read(&mut self, h: HostSock, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.get(h)?;
        socket.read(buf)
    }

    fn writev(&mut self, h: HostSock, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.get(h)?.send_vectored(bufs)
    }

    fn set_nonblocking(&mut self, h: HostSock, on: bool) -> io::Result<()> {
        self.get(h)?.set_nonblocking(on)
    }

    fn set_nodelay(&mut self, h: HostSock, on: bool) -> io::Result<()> {
        self.get(h)?.set_nodelay(on)
    }

    fn local_addr(&self, h: HostSock) -> io::Result<SocketAddr> {
        self.get(h)?
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    fn raw_fd(&self, h: HostSock) -> Option<RawFd> {
        self.sockets.get(&h.0).map(|s| s.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn accept_would_block_without_a_connection() {
        let mut ctx = HostStream::new();
        let listener = ctx.socket().unwrap();
        ctx.bind(listener, loopback()).unwrap();
        ctx.listen(listener, 8).unwrap();
        ctx.set_nonblocking(listener, true).unwrap();

        let err = ctx.accept(listener).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn connect_accept_and_transfer() {
        let mut ctx = HostStream::new();
        let listener = ctx.socket().unwrap();
        ctx.bind(listener, loopback()).unwrap();
        ctx.listen(listener, 8).unwrap();
        let addr = ctx.local_addr(listener).unwrap();
        ctx.set_nonblocking(listener, true).unwrap();

        let client = ctx.socket().unwrap();
        ctx.set_nonblocking(client, true).unwrap();
        match ctx.connect(client, addr) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("connect: {err}"),
        }
        ctx.set_nodelay(client, true).unwrap();

        let (server, _peer) = loop {
            match ctx.accept(listener) {
                Ok(pair) => break pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("accept: {err}"),
            }
        };
        ctx.set_nonblocking(server, true).unwrap();

        let payload = b"ping";
        let sent = loop {
            match ctx.writev(client, &[IoSlice::new(payload)]) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("writev: {err}"),
            }
        };
        assert_eq!(sent, payload.len());

        let mut buf = [0u8; 16];
        let received = loop {
            match ctx.read(server, &mut buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("read: {err}"),
            }
        };
        assert_eq!(&buf[..received], payload);
    }

    #[test]
    fn closed_handles_are_forgotten() {
        let mut ctx = HostStream::new();
        let sock = ctx.socket().unwrap();
        assert!(ctx.raw_fd(sock).is_some());
        ctx.close(sock).unwrap();
        assert!(ctx.raw_fd(sock).is_none());
        assert!(ctx.close(sock).is_err());
    }
}
