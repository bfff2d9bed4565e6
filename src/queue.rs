// Queue objects and the descriptor table: the public control- and
// data-plane surface over both transport backends.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use ahash::AHashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{Completion, PacketDevice, Sga, SgaError, SocketType, StreamTransport};
use crate::config::{Config, ConfigError};
use crate::dgram::PacketQueue;
use crate::io::poll::{Event, Interest, Poller};
use crate::metrics::Metrics;
use crate::packet::PacketError;
use crate::pending::{PendingRequest, RequestFailure, RequestTable};
use crate::stream::StreamQueue;
use crate::token::{OpKind, QToken, Qd, QdAllocator};

/// Error surfaced by the public queue API.
///
/// Would-block is never an error; the data-plane operations express it as
/// `Ok(None)`. Errors stop at the request boundary: a failed request leaves
/// the rest of the queue operating.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Descriptor does not name a live queue.
    #[error("unknown queue descriptor {0}")]
    UnknownQueue(Qd),

    /// Descriptor names a queue that was closed.
    #[error("queue {0} is closed")]
    Closed(Qd),

    /// Token was never submitted on this queue, or was already claimed.
    #[error("unknown queue token {0}")]
    UnknownToken(QToken),

    /// Token is already parked on this queue.
    #[error("token {0} is already in flight")]
    TokenInFlight(QToken),

    /// Token's operation bit does not match the requested operation.
    #[error("token {0} names the wrong operation")]
    WrongOperation(QToken),

    /// Operation does not exist on this backend.
    #[error("{op} is not supported on a {ty} queue")]
    WrongBackend {
        op: &'static str,
        ty: SocketType,
    },

    /// Queue already has a local address.
    #[error("queue {0} is already bound")]
    AlreadyBound(Qd),

    /// Queue already has a default peer.
    #[error("queue {0} already has a default peer")]
    PeerExists(Qd),

    /// Operation requires a bound queue.
    #[error("queue {0} is not bound")]
    NotBound(Qd),

    /// Operation requires a listening queue.
    #[error("queue {0} is not listening")]
    NotListening(Qd),

    /// Push on a connectionless queue with no address anywhere.
    #[error("no destination address for push")]
    NoDestination,

    /// Address rejected by the backend.
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),

    /// The request completed with a failure.
    #[error(transparent)]
    Request(#[from] RequestFailure),

    /// Transport-layer failure outside any request.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Transmit-side frame construction failure.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Structurally invalid scatter-gather array.
    #[error(transparent)]
    Sga(#[from] SgaError),

    /// Configuration failure at stack construction.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueueError {
    /// Errno-equivalent for embedders speaking the C convention.
    pub fn errno(&self) -> i32 {
        match self {
            QueueError::UnknownQueue(_) | QueueError::Closed(_) => libc::EBADF,
            QueueError::UnknownToken(_)
            | QueueError::TokenInFlight(_)
            | QueueError::WrongOperation(_)
            | QueueError::NotBound(_)
            | QueueError::NotListening(_)
            | QueueError::NoDestination
            | QueueError::InvalidAddress(_)
            | QueueError::Sga(_)
            | QueueError::Config(_) => libc::EINVAL,
            QueueError::WrongBackend { .. } => libc::ENOTSUP,
            QueueError::AlreadyBound(_) | QueueError::PeerExists(_) => libc::EPERM,
            QueueError::Request(RequestFailure::Protocol(_)) => libc::EPROTO,
            QueueError::Request(RequestFailure::Cancelled) => libc::ECANCELED,
            QueueError::Request(RequestFailure::Io(err)) | QueueError::Io(err) => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
            QueueError::Packet(_) => libc::EMSGSIZE,
        }
    }
}

/// One queue, polymorphic over the two backends. A closed queue with
/// unclaimed results lingers in the drained state until every outstanding
/// token has been consumed, keeping its descriptor from premature reuse.
#[derive(Debug)]
enum Queue<H> {
    Stream(StreamQueue<H>),
    Packet(PacketQueue),
    Drained(RequestTable),
}

/// The queue stack: owns both backend contexts, the descriptor table, and
/// the readiness notifier. Single-threaded; every operation is a bounded
/// unit of work except [`Stack::wait`], which busy-loops progress steps.
#[derive(Debug)]
pub struct Stack<S: StreamTransport, D: PacketDevice> {
    io: S,
    dev: D,
    poller: Poller,
    table: crate::config::AddrTable,
    cfg: Config,
    queues: AHashMap<u32, Queue<S::Handle>>,
    qds: QdAllocator,
    metrics: Arc<Metrics>,
}

impl<S: StreamTransport, D: PacketDevice> Stack<S, D> {
    /// Builds a stack over the provided transports.
    pub fn new(io: S, dev: D, cfg: Config, metrics: Arc<Metrics>) -> Result<Self, QueueError> {
        let table = cfg.addr_table()?;
        let poller = Poller::new()?;
        match dev.link_up() {
            Ok(true) => {}
            Ok(false) => warn!("packet device link is down"),
            Err(err) => warn!(?err, "packet device link state unavailable"),
        }
        Ok(Self {
            io,
            dev,
            poller,
            table,
            cfg,
            queues: AHashMap::new(),
            qds: QdAllocator::new(),
            metrics,
        })
    }

    /// Direct access to the byte-stream transport, for harnesses.
    pub fn stream_transport_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Direct access to the packet device, for harnesses.
    pub fn packet_device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Drains the readiness notifier. Registration tokens in the returned
    /// events are queue descriptors.
    pub fn poll_events(&self, timeout_ms: isize) -> io::Result<Vec<Event>> {
        self.poller.wait(timeout_ms)
    }

    // ── control plane ──────────────────────────────────────────────────

    /// Allocates a queue on the backend selected by `ty`. Stream sockets
    /// get TCP_NODELAY per configuration.
    pub fn socket(&mut self, ty: SocketType) -> Result<Qd, QueueError> {
        let queue = match ty {
            SocketType::Stream => {
                let handle = self.io.socket()?;
                if self.cfg.stream.nodelay {
                    self.io.set_nodelay(handle, true)?;
                }
                Queue::Stream(StreamQueue::new(handle))
            }
            SocketType::Dgram => Queue::Packet(PacketQueue::new()),
        };
        let qd = self.qds.alloc();
        self.queues.insert(qd.0, queue);
        self.metrics.open_queues.inc();
        debug!(%qd, %ty, "queue opened");
        Ok(qd)
    }

    /// Binds the queue's local address. On the packet backend an
    /// unspecified address resolves through the device MAC and the address
    /// table, and the port must be nonzero.
    pub fn bind(&mut self, qd: Qd, addr: SocketAddr) -> Result<(), QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => {
                if q.bound {
                    return Err(QueueError::AlreadyBound(qd));
                }
                self.io.bind(q.handle, addr)?;
                q.bound = true;
                Ok(())
            }
            Queue::Packet(q) => {
                let SocketAddr::V4(mut v4) = addr else {
                    return Err(QueueError::InvalidAddress(
                        "packet queues require an IPv4 address",
                    ));
                };
                if v4.port() == 0 {
                    return Err(QueueError::InvalidAddress("bind requires a nonzero port"));
                }
                if q.bound.is_some() {
                    return Err(QueueError::AlreadyBound(qd));
                }
                if v4.ip().is_unspecified() {
                    let ip = self.table.mac_to_ip(self.dev.mac()).ok_or(
                        QueueError::InvalidAddress("no address-table entry for the local device"),
                    )?;
                    v4 = SocketAddrV4::new(ip, v4.port());
                }
                q.bound = Some(v4);
                Ok(())
            }
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    /// Marks a stream queue listening: passive mode, non-blocking handle,
    /// read-readiness registered.
    pub fn listen(&mut self, qd: Qd, backlog: u32) -> Result<(), QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => {
                self.io.listen(q.handle, backlog)?;
                q.listening = true;
                self.io.set_nonblocking(q.handle, true)?;
                q.sync_interest(&self.io, &self.poller, qd)?;
                Ok(())
            }
            Queue::Packet(_) => Err(QueueError::WrongBackend {
                op: "listen",
                ty: SocketType::Dgram,
            }),
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    /// Stream: connects and switches the handle to non-blocking mode.
    /// Packet: records the default peer for subsequent pushes.
    pub fn connect(&mut self, qd: Qd, addr: SocketAddr) -> Result<(), QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => {
                // non-blocking before connect: a slow peer must not stall
                // the progress thread for the OS connect timeout
                self.io.set_nonblocking(q.handle, true)?;
                match self.io.connect(q.handle, addr) {
                    Ok(()) => {}
                    // establishment continues in the background;
                    // write-readiness signals completion
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err.into()),
                }
                q.register_with(&self.io, &self.poller, qd, Interest::WRITE)?;
                Ok(())
            }
            Queue::Packet(q) => {
                let SocketAddr::V4(v4) = addr else {
                    return Err(QueueError::InvalidAddress(
                        "packet queues require an IPv4 address",
                    ));
                };
                if q.bound.is_some() {
                    return Err(QueueError::AlreadyBound(qd));
                }
                if q.default_peer.is_some() {
                    return Err(QueueError::PeerExists(qd));
                }
                q.default_peer = Some(v4);
                Ok(())
            }
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    /// Progresses the accept pipeline and drains at most one connection.
    /// `Ok(None)` means no connection is ready yet; no descriptor is
    /// created in that case.
    pub fn accept(&mut self, qd: Qd) -> Result<Option<(Qd, SocketAddr)>, QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        let (handle, peer) = match queue {
            Queue::Stream(q) => {
                if !q.listening {
                    return Err(QueueError::NotListening(qd));
                }
                q.pump_accepts(&mut self.io)?;
                match q.accepts.pop_front() {
                    Some(entry) => entry,
                    None => return Ok(None),
                }
            }
            Queue::Packet(_) => {
                return Err(QueueError::WrongBackend {
                    op: "accept",
                    ty: SocketType::Dgram,
                })
            }
            Queue::Drained(_) => return Err(QueueError::Closed(qd)),
        };

        self.io.set_nonblocking(handle, true)?;
        if self.cfg.stream.nodelay {
            self.io.set_nodelay(handle, true)?;
        }

        let new_qd = self.qds.alloc();
        let mut queue = StreamQueue::new(handle);
        queue.bound = true;
        queue.register_with(&self.io, &self.poller, new_qd, Interest::READ)?;
        self.queues.insert(new_qd.0, Queue::Stream(queue));
        self.metrics.open_queues.inc();
        debug!(%qd, %new_qd, %peer, "connection accepted");
        Ok(Some((new_qd, peer)))
    }

    /// Tears down readiness interest, closes the transport handle, and
    /// cancels every outstanding request. Cancelled results stay claimable;
    /// the descriptor is released once the last one is consumed.
    pub fn close(&mut self, qd: Qd) -> Result<(), QueueError> {
        let queue = self
            .queues
            .remove(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;

        let reqs = match queue {
            Queue::Stream(mut q) => {
                q.deregister(&self.io, &self.poller);
                if let Err(err) = self.io.close(q.handle) {
                    warn!(?err, %qd, "failed to close stream handle");
                }
                for (handle, _) in q.accepts.drain(..) {
                    let _ = self.io.close(handle);
                }
                let mut reqs = std::mem::take(&mut q.reqs);
                let cancelled = reqs.cancel_all();
                self.metrics.requests_cancelled.inc_by(cancelled as u64);
                reqs
            }
            Queue::Packet(mut q) => {
                let mut reqs = std::mem::take(&mut q.reqs);
                let cancelled = reqs.cancel_all();
                self.metrics.requests_cancelled.inc_by(cancelled as u64);
                reqs
            }
            Queue::Drained(_) => {
                self.queues.insert(qd.0, queue);
                return Err(QueueError::Closed(qd));
            }
        };

        if reqs.is_empty() {
            self.qds.release(qd);
            self.metrics.open_queues.dec();
        } else {
            self.queues.insert(qd.0, Queue::Drained(reqs));
        }
        debug!(%qd, "queue closed");
        Ok(())
    }

    /// Local address of the queue.
    pub fn local_addr(&self, qd: Qd) -> Result<SocketAddr, QueueError> {
        match self.queues.get(&qd.0).ok_or(QueueError::UnknownQueue(qd))? {
            Queue::Stream(q) => Ok(self.io.local_addr(q.handle)?),
            Queue::Packet(q) => q
                .bound
                .map(SocketAddr::V4)
                .ok_or(QueueError::NotBound(qd)),
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    // ── data plane ─────────────────────────────────────────────────────

    /// Submits a push under `qt`. `Ok(Some(_))` on synchronous completion;
    /// `Ok(None)` parks the request for later progress.
    pub fn push(&mut self, qd: Qd, qt: QToken, sga: Sga) -> Result<Option<Completion>, QueueError> {
        if !qt.is_push() {
            return Err(QueueError::WrongOperation(qt));
        }
        sga.validate()?;

        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => {
                if q.reqs.contains(qt) {
                    return Err(QueueError::TokenInFlight(qt));
                }
                let mut req = PendingRequest::push(sga);
                // a parked push owns the write side; attempting now would
                // interleave frame bytes
                if !q.stream_busy(OpKind::Push) {
                    crate::stream::process_outgoing(
                        &mut self.io,
                        q.handle,
                        &mut req,
                        &self.metrics,
                    );
                }
                let outcome = Self::settle(&mut q.reqs, qt, req, &self.metrics);
                q.sync_interest(&self.io, &self.poller, qd)?;
                outcome
            }
            Queue::Packet(q) => {
                if q.reqs.contains(qt) {
                    return Err(QueueError::TokenInFlight(qt));
                }
                let dst = q.destination(&sga).ok_or(QueueError::NoDestination)?;
                let frame =
                    q.encode_push(&self.dev, &self.table, &self.cfg.packet, &sga, dst)?;
                let mut req = PendingRequest::push(sga);
                req.frame = Some(frame);
                q.attempt_send(&mut self.dev, &mut req, &self.metrics);
                let reqs = &mut q.reqs;
                Self::settle(reqs, qt, req, &self.metrics)
            }
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    /// Submits a pop under `qt`. On synchronous completion the decoded
    /// array rides in the completion; otherwise the request parks.
    pub fn pop(&mut self, qd: Qd, qt: QToken) -> Result<Option<Completion>, QueueError> {
        if qt.is_push() {
            return Err(QueueError::WrongOperation(qt));
        }

        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => {
                if q.reqs.contains(qt) {
                    return Err(QueueError::TokenInFlight(qt));
                }
                // adopt a partial peek so already-consumed bytes stay in
                // sequence
                let mut req = q.take_peek_slot().unwrap_or_else(PendingRequest::pop);
                // a parked pop owns the read side; attempting now would
                // steal its frame bytes
                if !q.stream_busy(OpKind::Pop) {
                    crate::stream::process_incoming(
                        &mut self.io,
                        q.handle,
                        &mut req,
                        &self.metrics,
                    );
                }
                let outcome = Self::settle(&mut q.reqs, qt, req, &self.metrics);
                q.sync_interest(&self.io, &self.poller, qd)?;
                outcome
            }
            Queue::Packet(q) => {
                if q.reqs.contains(qt) {
                    return Err(QueueError::TokenInFlight(qt));
                }
                let mut req = PendingRequest::pop();
                q.attempt_recv(&mut self.dev, &self.cfg.packet, &mut req, &self.metrics);
                let reqs = &mut q.reqs;
                Self::settle(reqs, qt, req, &self.metrics)
            }
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    /// Token-less best-effort pop: completes only when a full frame is
    /// already available; never parks.
    pub fn peek(&mut self, qd: Qd) -> Result<Option<Sga>, QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => Ok(q.peek(&mut self.io, &self.metrics)?),
            Queue::Packet(q) => Ok(q.peek(&mut self.dev, &self.cfg.packet, &self.metrics)?),
            Queue::Drained(_) => Err(QueueError::Closed(qd)),
        }
    }

    /// Blocks until `qt` completes, one progress step per iteration.
    pub fn wait(&mut self, qd: Qd, qt: QToken) -> Result<Completion, QueueError> {
        loop {
            if let Some(done) = self.poll(qd, qt)? {
                return Ok(done);
            }
            self.progress(qd)?;
        }
    }

    /// Non-blocking completion check. `Ok(None)` while the request is in
    /// flight; repeated calls do not alter queue state. A completed result
    /// is claimed exactly once.
    pub fn poll(&mut self, qd: Qd, qt: QToken) -> Result<Option<Completion>, QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        let table = match &mut *queue {
            Queue::Stream(q) => &mut q.reqs,
            Queue::Packet(q) => &mut q.reqs,
            Queue::Drained(t) => t,
        };

        let outcome = Self::claim(table, qt, &self.metrics);
        if matches!(queue, Queue::Drained(t) if t.is_empty()) {
            self.queues.remove(&qd.0);
            self.qds.release(qd);
            self.metrics.open_queues.dec();
        }
        outcome
    }

    /// A `poll` whose completed result is thrown away. `Ok(true)` when the
    /// token was consumed (successfully or not), `Ok(false)` while it is
    /// still in flight.
    pub fn discard(&mut self, qd: Qd, qt: QToken) -> Result<bool, QueueError> {
        match self.poll(qd, qt) {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(QueueError::Request(_)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// One progress step for the queue: attempt the head requests once and
    /// reconcile readiness interest.
    pub fn progress(&mut self, qd: Qd) -> Result<(), QueueError> {
        let queue = self
            .queues
            .get_mut(&qd.0)
            .ok_or(QueueError::UnknownQueue(qd))?;
        match queue {
            Queue::Stream(q) => {
                if q.listening {
                    q.pump_accepts(&mut self.io)?;
                }
                q.step(&mut self.io, &self.metrics);
                q.sync_interest(&self.io, &self.poller, qd)?;
            }
            Queue::Packet(q) => {
                q.step(&mut self.dev, &self.cfg.packet, &self.metrics);
            }
            Queue::Drained(_) => {}
        }
        Ok(())
    }

    // ── internals ──────────────────────────────────────────────────────

    /// Resolves a just-attempted request: a done request settles now, an
    /// unfinished one parks under its token.
    fn settle(
        reqs: &mut RequestTable,
        qt: QToken,
        req: PendingRequest,
        metrics: &Metrics,
    ) -> Result<Option<Completion>, QueueError> {
        if req.is_done() {
            let kind = req.kind;
            let (result, sga) = req.into_result();
            let bytes = result?;
            Ok(Some(match kind {
                OpKind::Push => Completion::push(bytes),
                OpKind::Pop => Completion::pop(sga),
            }))
        } else {
            reqs.park(qt, req);
            metrics.requests_parked.inc();
            metrics.work_queue_depth.inc();
            Ok(None)
        }
    }

    /// Claims a completed request under `qt`, if any.
    fn claim(
        table: &mut RequestTable,
        qt: QToken,
        metrics: &Metrics,
    ) -> Result<Option<Completion>, QueueError> {
        if !table.contains(qt) {
            return Err(QueueError::UnknownToken(qt));
        }
        let Some(req) = table.claim_done(qt) else {
            return Ok(None);
        };
        metrics.work_queue_depth.dec();
        let kind = req.kind;
        let (result, sga) = req.into_result();
        let bytes = result?;
        Ok(Some(match kind {
            OpKind::Push => Completion::push(bytes),
            OpKind::Pop => Completion::pop(sga),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::loopback::{LoopDevice, LoopStream};
    use crate::packet::MacAddr;
    use crate::token::TokenMint;
    use bytes::Bytes;
    use std::io::IoSlice;

    const MAC_CLIENT: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const MAC_SERVER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);

    type LoopStack = Stack<LoopStream, LoopDevice>;

    fn stream_stack() -> LoopStack {
        let (dev, _peer) = LoopDevice::pair(MAC_CLIENT, MAC_SERVER);
        Stack::new(
            LoopStream::new(),
            dev,
            Config::default(),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
    }

    fn packet_pair() -> (LoopStack, LoopStack) {
        let (dev_client, dev_server) = LoopDevice::pair(MAC_CLIENT, MAC_SERVER);
        let cfg = Config::from_toml_str(
            r#"
            [[packet.neighbors]]
            mac = "02:00:00:00:00:01"
            ip = "10.0.0.7"

            [[packet.neighbors]]
            mac = "02:00:00:00:00:02"
            ip = "10.0.0.5"
            "#,
        )
        .unwrap();
        let client = Stack::new(
            LoopStream::new(),
            dev_client,
            cfg.clone(),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap();
        let server = Stack::new(
            LoopStream::new(),
            dev_server,
            cfg,
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap();
        (client, server)
    }

    /// Listener, connected client, and the accepted server-side queue.
    fn connected(stack: &mut LoopStack, port: u16) -> (Qd, Qd, Qd) {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let listener = stack.socket(SocketType::Stream).unwrap();
        stack.bind(listener, addr).unwrap();
        stack.listen(listener, 16).unwrap();
        assert!(stack.accept(listener).unwrap().is_none());

        let client = stack.socket(SocketType::Stream).unwrap();
        stack.connect(client, addr).unwrap();
        let (server, _peer) = stack.accept(listener).unwrap().expect("connection ready");
        (listener, client, server)
    }

    fn hello_world() -> Sga {
        Sga::new(vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b"world"),
        ])
    }

    #[test]
    fn stream_push_pop_end_to_end() {
        let mut stack = stream_stack();
        let mut mint = TokenMint::new();
        let (_listener, client, server) = connected(&mut stack, 12345);

        let qt = mint.push_token();
        let done = stack
            .push(client, qt, hello_world())
            .unwrap()
            .expect("buffered connection completes synchronously");
        assert_eq!(done.bytes, 10);

        let qt = mint.pop_token();
        let done = match stack.pop(server, qt).unwrap() {
            Some(done) => done,
            None => stack.wait(server, qt).unwrap(),
        };
        assert_eq!(done.bytes, 10);
        assert_eq!(done.sga.unwrap().segments, hello_world().segments);
    }

    #[test]
    fn stream_push_pop_over_host_sockets() {
        let (dev, _peer) = LoopDevice::pair(MAC_CLIENT, MAC_SERVER);
        let mut stack: Stack<crate::io::host::HostStream, LoopDevice> = Stack::new(
            crate::io::host::HostStream::new(),
            dev,
            Config::default(),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap();
        let mut mint = TokenMint::new();

        let listener = stack.socket(SocketType::Stream).unwrap();
        stack.bind(listener, "127.0.0.1:0".parse().unwrap()).unwrap();
        stack.listen(listener, 16).unwrap();
        let addr = stack.local_addr(listener).unwrap();

        let client = stack.socket(SocketType::Stream).unwrap();
        stack.connect(client, addr).unwrap();

        let mut tries = 0;
        let (server, _peer_addr) = loop {
            if let Some(pair) = stack.accept(listener).unwrap() {
                break pair;
            }
            tries += 1;
            assert!(tries < 1000, "loopback connection never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        };

        let qt = mint.push_token();
        let done = match stack.push(client, qt, hello_world()).unwrap() {
            Some(done) => done,
            None => stack.wait(client, qt).unwrap(),
        };
        assert_eq!(done.bytes, 10);

        let qt = mint.pop_token();
        let done = match stack.pop(server, qt).unwrap() {
            Some(done) => done,
            None => stack.wait(server, qt).unwrap(),
        };
        assert_eq!(done.bytes, 10);
        assert_eq!(done.sga.unwrap().segments, hello_world().segments);
    }

    #[test]
    fn parked_pop_completes_under_one_byte_reads() {
        let mut stack = stream_stack();
        let mut mint = TokenMint::new();
        let (_listener, client, server) = connected(&mut stack, 12346);

        let pop_qt = mint.pop_token();
        assert!(stack.pop(server, pop_qt).unwrap().is_none(), "parks while idle");

        // repeated polls on a not-yet-done token change nothing
        for _ in 0..3 {
            assert!(stack.poll(server, pop_qt).unwrap().is_none());
        }

        let push_qt = mint.push_token();
        stack.push(client, push_qt, hello_world()).unwrap();

        stack.stream_transport_mut().set_read_cap(Some(1));
        let done = stack.wait(server, pop_qt).unwrap();
        assert_eq!(done.bytes, 10);
        assert_eq!(done.sga.unwrap().segments, hello_world().segments);
    }

    #[test]
    fn bad_magic_fails_only_the_affected_request() {
        let mut stack = stream_stack();
        let mut mint = TokenMint::new();

        let addr: SocketAddr = "127.0.0.1:12347".parse().unwrap();
        let listener = stack.socket(SocketType::Stream).unwrap();
        stack.bind(listener, addr).unwrap();
        stack.listen(listener, 16).unwrap();

        // a raw peer that speaks garbage
        let io = stack.stream_transport_mut();
        let raw = io.socket().unwrap();
        io.connect(raw, addr).unwrap();
        let mut junk = Vec::new();
        junk.extend_from_slice(&0xDEAD_BEEFu64.to_ne_bytes());
        junk.extend_from_slice(&[0u8; 16]);
        io.writev(raw, &[IoSlice::new(&junk)]).unwrap();

        let (server, _peer) = stack.accept(listener).unwrap().expect("connection ready");
        let qt = mint.pop_token();
        match stack.pop(server, qt) {
            Err(QueueError::Request(RequestFailure::Protocol(_))) => {}
            other => panic!("expected a protocol failure, got {other:?}"),
        }

        // the queue itself remains usable
        assert!(stack.peek(server).is_ok());
    }

    #[test]
    fn packet_push_pop_reports_the_sender() {
        let (mut client, mut server) = packet_pair();
        let mut mint = TokenMint::new();

        let server_qd = server.socket(SocketType::Dgram).unwrap();
        server
            .bind(server_qd, "10.0.0.5:9000".parse().unwrap())
            .unwrap();

        let client_qd = client.socket(SocketType::Dgram).unwrap();
        client
            .connect(client_qd, "10.0.0.5:9000".parse().unwrap())
            .unwrap();

        let qt = mint.push_token();
        let done = client
            .push(client_qd, qt, Sga::single("ping"))
            .unwrap()
            .expect("device ring has room");
        assert_eq!(done.bytes, 4);

        let qt = mint.pop_token();
        let done = match server.pop(server_qd, qt).unwrap() {
            Some(done) => done,
            None => server.wait(server_qd, qt).unwrap(),
        };
        let sga = done.sga.unwrap();
        assert_eq!(sga.segments, vec![Bytes::from_static(b"ping")]);
        // unbound sender: MAC-derived source IP, destination port echoed
        assert_eq!(sga.addr, Some("10.0.0.7:9000".parse().unwrap()));
    }

    #[test]
    fn unspecified_bind_resolves_through_the_table() {
        let (_client, mut server) = packet_pair();
        let qd = server.socket(SocketType::Dgram).unwrap();
        server.bind(qd, "0.0.0.0:9000".parse().unwrap()).unwrap();
        assert_eq!(
            server.local_addr(qd).unwrap(),
            "10.0.0.5:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn wrong_port_datagram_never_completes_a_token() {
        let (mut client, mut server) = packet_pair();
        let mut mint = TokenMint::new();

        let server_qd = server.socket(SocketType::Dgram).unwrap();
        server
            .bind(server_qd, "10.0.0.5:9000".parse().unwrap())
            .unwrap();

        let client_qd = client.socket(SocketType::Dgram).unwrap();
        let stray = Sga::single("stray").with_addr("10.0.0.5:9001".parse().unwrap());
        let qt = mint.push_token();
        client.push(client_qd, qt, stray).unwrap().expect("sent");

        let pop_qt = mint.pop_token();
        assert!(server.pop(server_qd, pop_qt).unwrap().is_none());
        for _ in 0..8 {
            server.progress(server_qd).unwrap();
            assert!(server.poll(server_qd, pop_qt).unwrap().is_none());
        }
    }

    #[test]
    fn parked_pop_overtakes_an_undrained_push() {
        let mut stack = stream_stack();
        let mut mint = TokenMint::new();
        let (_listener, client, server) = connected(&mut stack, 12348);
        stack.stream_transport_mut().set_capacity(16);

        // client: a large push that cannot drain, then a pop
        let push_qt = mint.push_token();
        let big = Sga::single(Bytes::from(vec![0x5a; 256]));
        assert!(stack.push(client, push_qt, big.clone()).unwrap().is_none());
        let pop_qt = mint.pop_token();
        assert!(stack.pop(client, pop_qt).unwrap().is_none());

        // server replies without ever reading the big push
        let reply_qt = mint.push_token();
        let reply = Sga::single("ok");
        let reply_sync = stack.push(server, reply_qt, reply.clone()).unwrap();

        let mut rounds = 0;
        let done = loop {
            stack.progress(server).unwrap();
            stack.progress(client).unwrap();
            if let Some(done) = stack.poll(client, pop_qt).unwrap() {
                break done;
            }
            rounds += 1;
            assert!(rounds < 256, "pop starved behind the push");
        };
        assert_eq!(done.sga.unwrap().segments, reply.segments);
        assert!(
            stack.poll(client, push_qt).unwrap().is_none(),
            "the big push must still be in flight"
        );
        if reply_sync.is_none() {
            stack.wait(server, reply_qt).unwrap();
        }

        // now drain the push through a server-side pop
        let spop_qt = mint.pop_token();
        let mut rounds = 0;
        let server_done = match stack.pop(server, spop_qt).unwrap() {
            Some(done) => done,
            None => loop {
                stack.progress(client).unwrap();
                stack.progress(server).unwrap();
                if let Some(done) = stack.poll(server, spop_qt).unwrap() {
                    break done;
                }
                rounds += 1;
                assert!(rounds < 256, "push never drained");
            },
        };
        assert_eq!(server_done.bytes, 256);
        assert_eq!(server_done.sga.unwrap().segments, big.segments);

        let pushed = stack.wait(client, push_qt).unwrap();
        assert_eq!(pushed.bytes, 256);
    }

    #[test]
    fn close_cancels_outstanding_tokens() {
        let mut stack = stream_stack();
        let mut mint = TokenMint::new();
        let (_listener, client, _server) = connected(&mut stack, 12349);
        stack.stream_transport_mut().set_capacity(8);

        let push_qt = mint.push_token();
        let big = Sga::single(Bytes::from(vec![1u8; 128]));
        assert!(stack.push(client, push_qt, big).unwrap().is_none());
        let pop_qt = mint.pop_token();
        assert!(stack.pop(client, pop_qt).unwrap().is_none());

        stack.close(client).unwrap();

        match stack.poll(client, push_qt) {
            Err(QueueError::Request(RequestFailure::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        match stack.poll(client, pop_qt) {
            Err(QueueError::Request(RequestFailure::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }

        // all results claimed: the descriptor is gone and may be reused
        assert!(matches!(
            stack.poll(client, push_qt),
            Err(QueueError::UnknownQueue(_))
        ));
        let fresh = stack.socket(SocketType::Stream).unwrap();
        assert_eq!(fresh, client);
    }

    #[test]
    fn close_without_pending_releases_immediately() {
        let mut stack = stream_stack();
        let qd = stack.socket(SocketType::Stream).unwrap();
        stack.close(qd).unwrap();
        assert!(matches!(
            stack.bind(qd, "127.0.0.1:1".parse().unwrap()),
            Err(QueueError::UnknownQueue(_))
        ));
    }

    #[test]
    fn packet_peek_never_parks() {
        let (mut client, mut server) = packet_pair();
        let mut mint = TokenMint::new();

        let server_qd = server.socket(SocketType::Dgram).unwrap();
        server
            .bind(server_qd, "10.0.0.5:9000".parse().unwrap())
            .unwrap();
        assert!(server.peek(server_qd).unwrap().is_none());

        let client_qd = client.socket(SocketType::Dgram).unwrap();
        let qt = mint.push_token();
        client
            .push(
                client_qd,
                qt,
                Sga::single("peeked").with_addr("10.0.0.5:9000".parse().unwrap()),
            )
            .unwrap()
            .expect("sent");

        let sga = server.peek(server_qd).unwrap().expect("frame available");
        assert_eq!(sga.segments, vec![Bytes::from_static(b"peeked")]);
        assert!(server.peek(server_qd).unwrap().is_none());
    }

    #[test]
    fn discard_consumes_a_completed_token() {
        let (mut client, mut server) = packet_pair();
        let mut mint = TokenMint::new();

        let server_qd = server.socket(SocketType::Dgram).unwrap();
        server
            .bind(server_qd, "10.0.0.5:9000".parse().unwrap())
            .unwrap();
        let pop_qt = mint.pop_token();
        assert!(server.pop(server_qd, pop_qt).unwrap().is_none());
        assert!(!server.discard(server_qd, pop_qt).unwrap());

        let client_qd = client.socket(SocketType::Dgram).unwrap();
        let qt = mint.push_token();
        client
            .push(
                client_qd,
                qt,
                Sga::single("x").with_addr("10.0.0.5:9000".parse().unwrap()),
            )
            .unwrap()
            .expect("sent");

        server.progress(server_qd).unwrap();
        assert!(server.discard(server_qd, pop_qt).unwrap());
        assert!(matches!(
            server.poll(server_qd, pop_qt),
            Err(QueueError::UnknownToken(_))
        ));
    }

    #[test]
    fn misuse_is_reported_not_propagated() {
        let mut stack = stream_stack();
        let mut mint = TokenMint::new();
        let (_listener, client, server) = connected(&mut stack, 12350);

        // operation bit mismatches
        let pop_tok = mint.pop_token();
        assert!(matches!(
            stack.push(client, pop_tok, Sga::single("x")),
            Err(QueueError::WrongOperation(_))
        ));
        let push_tok = mint.push_token();
        assert!(matches!(
            stack.pop(server, push_tok),
            Err(QueueError::WrongOperation(_))
        ));

        // duplicate in-flight token
        let qt = mint.pop_token();
        assert!(stack.pop(server, qt).unwrap().is_none());
        assert!(matches!(
            stack.pop(server, qt),
            Err(QueueError::TokenInFlight(_))
        ));

        // unknown token
        let stranger = mint.pop_token();
        assert!(matches!(
            stack.poll(server, stranger),
            Err(QueueError::UnknownToken(_))
        ));

        // empty array
        assert!(matches!(
            stack.push(client, mint.push_token(), Sga::default()),
            Err(QueueError::Sga(_))
        ));

        // accept on a non-listening queue
        assert!(matches!(
            stack.accept(client),
            Err(QueueError::NotListening(_))
        ));
    }

    #[test]
    fn backend_mismatches_are_rejected() {
        let (mut client, _server) = packet_pair();
        let qd = client.socket(SocketType::Dgram).unwrap();

        assert!(matches!(
            client.listen(qd, 8),
            Err(QueueError::WrongBackend { op: "listen", .. })
        ));
        assert!(matches!(
            client.accept(qd),
            Err(QueueError::WrongBackend { op: "accept", .. })
        ));

        client.connect(qd, "10.0.0.5:9000".parse().unwrap()).unwrap();
        assert!(matches!(
            client.connect(qd, "10.0.0.5:9001".parse().unwrap()),
            Err(QueueError::PeerExists(_))
        ));

        let bound = client.socket(SocketType::Dgram).unwrap();
        client.bind(bound, "10.0.0.7:4000".parse().unwrap()).unwrap();
        assert!(matches!(
            client.bind(bound, "10.0.0.7:4001".parse().unwrap()),
            Err(QueueError::AlreadyBound(_))
        ));
        assert!(matches!(
            client.bind(bound, "10.0.0.7:0".parse().unwrap()),
            Err(QueueError::AlreadyBound(_) | QueueError::InvalidAddress(_))
        ));

        // push with no address anywhere
        let loose = client.socket(SocketType::Dgram).unwrap();
        let mut mint = TokenMint::new();
        assert!(matches!(
            client.push(loose, mint.push_token(), Sga::single("x")),
            Err(QueueError::NoDestination)
        ));
    }

    #[test]
    fn errno_mapping_follows_the_c_convention() {
        assert_eq!(QueueError::UnknownQueue(Qd(9)).errno(), libc::EBADF);
        assert_eq!(
            QueueError::UnknownToken(QToken(3)).errno(),
            libc::EINVAL
        );
        assert_eq!(
            QueueError::WrongBackend {
                op: "listen",
                ty: SocketType::Dgram
            }
            .errno(),
            libc::ENOTSUP
        );
        assert_eq!(QueueError::AlreadyBound(Qd(1)).errno(), libc::EPERM);
        assert_eq!(
            QueueError::Request(RequestFailure::Cancelled).errno(),
            libc::ECANCELED
        );
        assert_eq!(
            QueueError::Request(RequestFailure::Protocol(
                crate::wire::WireError::ZeroSegments
            ))
            .errno(),
            libc::EPROTO
        );
    }
}
