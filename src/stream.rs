// Byte-stream queue backend: framed push/pop over a non-blocking
// socket-shaped transport.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;

use bytes::BytesMut;
use tracing::warn;

use crate::api::{Sga, StreamTransport};
use crate::io::poll::{Interest, Poller};
use crate::metrics::Metrics;
use crate::pending::{PendingRequest, RequestFailure, RequestTable};
use crate::token::Qd;
use crate::wire::{self, FrameHeader, FRAME_HDR_LEN};

/// Per-queue state for one stream endpoint.
#[derive(Debug)]
pub(crate) struct StreamQueue<H> {
    pub handle: H,
    pub bound: bool,
    pub listening: bool,
    pub reqs: RequestTable,
    pub accepts: VecDeque<(H, SocketAddr)>,
    peek_slot: Option<PendingRequest>,
    registered: bool,
    interest: Interest,
}

impl<H: Copy + Eq + std::hash::Hash + std::fmt::Debug> StreamQueue<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            bound: false,
            listening: false,
            reqs: RequestTable::new(),
            accepts: VecDeque::new(),
            peek_slot: None,
            registered: false,
            interest: Interest::NONE,
        }
    }

    /// Reconciles the poller registration with the queue's outstanding work:
    /// write interest while a push is parked, read interest while listening
    /// or a pop is parked. Interest is ORed in on submission and cleared
    /// here once no request of that direction remains.
    pub fn sync_interest<S>(&mut self, io: &S, poller: &Poller, qd: Qd) -> io::Result<()>
    where
        S: StreamTransport<Handle = H>,
    {
        let desired = Interest {
            read: self.listening
                || self.reqs.has_outstanding(crate::token::OpKind::Pop)
                || self.peek_slot.is_some(),
            write: self.reqs.has_outstanding(crate::token::OpKind::Push),
        };

        let Some(fd) = io.raw_fd(self.handle) else {
            self.interest = desired;
            return Ok(());
        };

        if !self.registered {
            poller.register(fd, u64::from(qd.0), desired)?;
            self.registered = true;
        } else if desired != self.interest {
            poller.modify(fd, u64::from(qd.0), desired)?;
        }
        self.interest = desired;
        Ok(())
    }

    /// Registers the handle with an explicit initial interest set, used at
    /// the accept and connect edges before any request is parked.
    pub fn register_with<S>(
        &mut self,
        io: &S,
        poller: &Poller,
        qd: Qd,
        interest: Interest,
    ) -> io::Result<()>
    where
        S: StreamTransport<Handle = H>,
    {
        if let Some(fd) = io.raw_fd(self.handle) {
            poller.register(fd, u64::from(qd.0), interest)?;
            self.registered = true;
        }
        self.interest = interest;
        Ok(())
    }

    /// Drops the poller registration ahead of closing the handle.
    pub fn deregister<S>(&mut self, io: &S, poller: &Poller)
    where
        S: StreamTransport<Handle = H>,
    {
        if self.registered {
            if let Some(fd) = io.raw_fd(self.handle) {
                if let Err(err) = poller.deregister(fd) {
                    warn!(?err, "failed to deregister stream queue");
                }
            }
            self.registered = false;
        }
        self.interest = Interest::NONE;
    }

    /// Attempts one accept against the transport, staging the result.
    pub fn pump_accepts<S>(&mut self, io: &mut S) -> io::Result<()>
    where
        S: StreamTransport<Handle = H>,
    {
        match io.accept(self.handle) {
            Ok((handle, addr)) => {
                self.accepts.push_back((handle, addr));
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// One progress step: attempt the first parked push and the first parked
    /// pop, in that order, each exactly once.
    pub fn step<S>(&mut self, io: &mut S, metrics: &Metrics)
    where
        S: StreamTransport<Handle = H>,
    {
        let (push, pop) = self.reqs.next_attempts();
        for qt in [push, pop].into_iter().flatten() {
            let mut req = match self.reqs.take(qt) {
                Some(req) => req,
                None => continue,
            };
            if req.kind == crate::token::OpKind::Push {
                process_outgoing(io, self.handle, &mut req, metrics);
            } else {
                process_incoming(io, self.handle, &mut req, metrics);
            }
            self.reqs.restore(qt, req);
        }
    }

    /// True when a parked request of `kind` would be corrupted by another
    /// reader or writer touching the stream.
    pub fn stream_busy(&self, kind: crate::token::OpKind) -> bool {
        self.reqs.has_outstanding(kind)
    }

    /// Hands a partially peeked frame over to a real pop, so the bytes the
    /// peek already consumed stay in sequence.
    pub fn take_peek_slot(&mut self) -> Option<PendingRequest> {
        self.peek_slot.take()
    }

    /// Token-less best-effort pop. Partial progress survives in a dedicated
    /// slot, so an incomplete frame is resumed by the next call rather than
    /// lost; observable queue state does not change. While a pop is parked
    /// the stream belongs to it, and peek reports nothing.
    pub fn peek<S>(
        &mut self,
        io: &mut S,
        metrics: &Metrics,
    ) -> Result<Option<Sga>, RequestFailure>
    where
        S: StreamTransport<Handle = H>,
    {
        if self.stream_busy(crate::token::OpKind::Pop) {
            return Ok(None);
        }
        let mut req = self.peek_slot.take().unwrap_or_else(PendingRequest::pop);
        process_incoming(io, self.handle, &mut req, metrics);
        if req.is_done() {
            let (result, sga) = req.into_result();
            result.map(|_| Some(sga))
        } else {
            self.peek_slot = Some(req);
            Ok(None)
        }
    }
}

/// Builds the I/O slices for the unsent tail of a push frame. The virtual
/// frame is header, then per segment a length cell and the body; `cursor`
/// bytes of it are already on the wire.
fn gather_slices<'a>(req: &'a PendingRequest) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(2 * req.sga.num_segments() + 1);
    let mut skip = req.cursor;

    let mut push = |chunk: &'a [u8]| {
        if skip >= chunk.len() {
            skip -= chunk.len();
        } else {
            slices.push(IoSlice::new(&chunk[skip..]));
            skip = 0;
        }
    };

    push(&req.header);
    for (cell, seg) in req.len_cells.iter().zip(req.sga.segments.iter()) {
        push(cell);
        push(seg);
    }
    slices
}

/// Drives a push forward until the frame is fully written, the transport
/// refuses, or a hard error lands on the request.
pub(crate) fn process_outgoing<S: StreamTransport>(
    io: &mut S,
    handle: S::Handle,
    req: &mut PendingRequest,
    metrics: &Metrics,
) {
    let total = req.push_frame_len();
    while req.cursor < total {
        let written = {
            let slices = gather_slices(req);
            io.writev(handle, &slices)
        };
        match written {
            Ok(0) => {
                metrics.would_block_total.inc();
                return;
            }
            Ok(n) => req.cursor += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                metrics.would_block_total.inc();
                return;
            }
            Err(err) => {
                warn!(?err, "stream push failed");
                req.finish(Err(RequestFailure::Io(err)));
                return;
            }
        }
    }

    let bytes = req.sga.total_len();
    metrics.frames_tx.inc();
    metrics.bytes_pushed.inc_by(bytes as u64);
    req.finish(Ok(bytes));
}

/// Drives a pop forward: progressive header read, magic check, payload
/// read, then segment slicing. Would-block leaves the cursor where it is;
/// protocol violations and hard errors finish the request.
pub(crate) fn process_incoming<S: StreamTransport>(
    io: &mut S,
    handle: S::Handle,
    req: &mut PendingRequest,
    metrics: &Metrics,
) {
    while req.cursor < FRAME_HDR_LEN {
        match io.read(handle, &mut req.header[req.cursor..]) {
            Ok(0) => {
                metrics.would_block_total.inc();
                return;
            }
            Ok(n) => req.cursor += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                metrics.would_block_total.inc();
                return;
            }
            Err(err) => {
                warn!(?err, "stream pop failed reading header");
                req.finish(Err(RequestFailure::Io(err)));
                return;
            }
        }
    }

    let header = match FrameHeader::parse(&req.header) {
        Ok(header) => header,
        Err(err) => {
            metrics.protocol_errors.inc();
            req.finish(Err(RequestFailure::Protocol(err)));
            return;
        }
    };

    let payload_len = header.payload_len as usize;
    if req.payload.is_none() {
        req.payload = Some(BytesMut::zeroed(payload_len));
    }
    let total = FRAME_HDR_LEN + payload_len;

    while req.cursor < total {
        let offset = req.cursor - FRAME_HDR_LEN;
        let payload = req.payload.as_mut().expect("allocated above");
        match io.read(handle, &mut payload[offset..]) {
            Ok(0) => {
                metrics.would_block_total.inc();
                return;
            }
            Ok(n) => req.cursor += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                metrics.would_block_total.inc();
                return;
            }
            Err(err) => {
                warn!(?err, "stream pop failed reading payload");
                req.finish(Err(RequestFailure::Io(err)));
                return;
            }
        }
    }

    let payload = req.payload.take().expect("allocated above").freeze();
    match wire::split_payload(&payload, header.seg_count) {
        Ok(segments) => {
            let sga = Sga::new(segments);
            let bytes = sga.total_len();
            req.sga = sga;
            metrics.frames_rx.inc();
            metrics.bytes_popped.inc_by(bytes as u64);
            req.finish(Ok(bytes));
        }
        Err(err) => {
            metrics.protocol_errors.inc();
            req.finish(Err(RequestFailure::Protocol(err)));
        }
    }
}
