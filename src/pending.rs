// Per-queue in-flight request state: the pending map and the work queue.

use std::collections::VecDeque;
use std::io;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::api::Sga;
use crate::token::{OpKind, QToken};
use crate::wire::{self, FrameHeader, WireError, FRAME_HDR_LEN, LEN_CELL};

/// Terminal failure recorded on a request. Would-block never reaches this
/// type; it leaves the request parked.
#[derive(Debug, Error)]
pub enum RequestFailure {
    /// Malformed frame; the request is dead but the queue keeps operating.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Hard error from the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// The owning queue was closed before the request completed.
    #[error("queue closed before completion")]
    Cancelled,
}

/// One in-flight push or pop.
///
/// `cursor` counts frame bytes transferred so far (header included). For
/// pushes the header and length cells are precomputed so a short write can
/// resume from any offset; for pops the header region doubles as receive
/// staging and `payload` is allocated once the header has been decoded.
#[derive(Debug)]
pub struct PendingRequest {
    pub kind: OpKind,
    pub sga: Sga,
    pub header: [u8; FRAME_HDR_LEN],
    pub len_cells: Vec<[u8; LEN_CELL]>,
    pub cursor: usize,
    pub payload: Option<BytesMut>,
    /// Packet-backend pushes carry their frame pre-encoded, so a refused
    /// burst retries without re-walking the array.
    pub frame: Option<Bytes>,
    result: Option<Result<usize, RequestFailure>>,
}

impl PendingRequest {
    /// Prepares a push of `sga`.
    pub fn push(sga: Sga) -> Self {
        let header = FrameHeader::describe(&sga).encode();
        let len_cells = wire::length_cells(&sga);
        Self {
            kind: OpKind::Push,
            sga,
            header,
            len_cells,
            cursor: 0,
            payload: None,
            frame: None,
            result: None,
        }
    }

    /// Prepares a pop. The array is filled by the decoder on completion.
    pub fn pop() -> Self {
        Self {
            kind: OpKind::Pop,
            sga: Sga::default(),
            header: [0u8; FRAME_HDR_LEN],
            len_cells: Vec::new(),
            cursor: 0,
            payload: None,
            frame: None,
            result: None,
        }
    }

    /// Total on-wire length of the frame a push transmits.
    pub fn push_frame_len(&self) -> usize {
        FRAME_HDR_LEN
            + self
                .sga
                .segments
                .iter()
                .map(|seg| LEN_CELL + seg.len())
                .sum::<usize>()
    }

    /// True once the request has a result.
    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }

    /// Records the terminal result. A request completes exactly once.
    pub fn finish(&mut self, result: Result<usize, RequestFailure>) {
        debug_assert!(self.result.is_none(), "request completed twice");
        self.result = Some(result);
    }

    /// Consumes the request, yielding its result and the (pop-side) array.
    pub fn into_result(self) -> (Result<usize, RequestFailure>, Sga) {
        let result = self
            .result
            .unwrap_or(Err(RequestFailure::Cancelled));
        (result, self.sga)
    }
}

/// Pending map plus work-queue FIFO for one queue.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: AHashMap<QToken, PendingRequest>,
    work: VecDeque<QToken>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the token names a submitted, unclaimed request.
    pub fn contains(&self, qt: QToken) -> bool {
        self.pending.contains_key(&qt)
    }

    /// Parks a request that failed to complete synchronously. The token must
    /// not already be in flight.
    pub fn park(&mut self, qt: QToken, req: PendingRequest) {
        debug_assert!(!self.pending.contains_key(&qt), "token {qt} double-parked");
        self.pending.insert(qt, req);
        self.work.push_back(qt);
    }

    /// Removes a request for processing; pair with [`RequestTable::restore`].
    pub fn take(&mut self, qt: QToken) -> Option<PendingRequest> {
        self.pending.remove(&qt)
    }

    /// Puts a processed request back.
    pub fn restore(&mut self, qt: QToken, req: PendingRequest) {
        self.pending.insert(qt, req);
    }

    /// True when the named request is done.
    pub fn is_done(&self, qt: QToken) -> Option<bool> {
        self.pending.get(&qt).map(PendingRequest::is_done)
    }

    /// Claims a completed request, removing it. `None` while not done or
    /// when the token is unknown.
    pub fn claim_done(&mut self, qt: QToken) -> Option<PendingRequest> {
        if self.pending.get(&qt)?.is_done() {
            self.pending.remove(&qt)
        } else {
            None
        }
    }

    /// Selects the tokens to attempt in one progress step: the first
    /// not-yet-done push and the first not-yet-done pop in submission order.
    ///
    /// Requests behind the first of their kind cannot advance on a byte
    /// stream without corrupting framing, so this is the round-robin the
    /// transport admits; it keeps a parked pop live behind an undrained
    /// push. Stale tokens (claimed or cancelled) and completed requests are
    /// purged from the work queue during the scan.
    pub fn next_attempts(&mut self) -> (Option<QToken>, Option<QToken>) {
        let mut first_push = None;
        let mut first_pop = None;
        let pending = &self.pending;
        self.work.retain(|qt| {
            match pending.get(qt) {
                None => false,
                Some(req) if req.is_done() => false,
                Some(req) => {
                    match req.kind {
                        OpKind::Push if first_push.is_none() => first_push = Some(*qt),
                        OpKind::Pop if first_pop.is_none() => first_pop = Some(*qt),
                        _ => {}
                    }
                    true
                }
            }
        });
        (first_push, first_pop)
    }

    /// Any not-yet-done request of the given kind?
    pub fn has_outstanding(&self, kind: OpKind) -> bool {
        self.pending
            .values()
            .any(|req| req.kind == kind && !req.is_done())
    }

    /// Number of parked tokens awaiting progress.
    pub fn depth(&self) -> usize {
        self.work.len()
    }

    /// Fails every unfinished request, returning how many were actually
    /// cancelled; their results stay claimable. Requests that already
    /// completed keep their results and are not counted.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for req in self.pending.values_mut() {
            if !req.is_done() {
                req.finish(Err(RequestFailure::Cancelled));
                cancelled += 1;
            }
        }
        self.work.clear();
        cancelled
    }

    /// True when nothing is left to claim.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenMint;
    use bytes::Bytes;

    #[test]
    fn requests_complete_independently() {
        let mut mint = TokenMint::new();
        let mut table = RequestTable::new();
        let a = mint.push_token();
        let b = mint.pop_token();
        table.park(a, PendingRequest::push(Sga::single("x")));
        table.park(b, PendingRequest::pop());

        let mut req = table.take(a).unwrap();
        req.finish(Ok(1));
        table.restore(a, req);

        assert_eq!(table.is_done(a), Some(true));
        assert_eq!(table.is_done(b), Some(false));
        assert!(table.claim_done(b).is_none());
        assert!(table.claim_done(a).is_some());
        assert!(table.contains(b));
    }

    #[test]
    fn next_attempts_picks_first_of_each_kind() {
        let mut mint = TokenMint::new();
        let mut table = RequestTable::new();
        let push1 = mint.push_token();
        let push2 = mint.push_token();
        let pop1 = mint.pop_token();
        table.park(push1, PendingRequest::push(Sga::single("a")));
        table.park(push2, PendingRequest::push(Sga::single("b")));
        table.park(pop1, PendingRequest::pop());

        let (push, pop) = table.next_attempts();
        assert_eq!(push, Some(push1));
        assert_eq!(pop, Some(pop1));
    }

    #[test]
    fn done_and_cancelled_tokens_leave_the_work_queue() {
        let mut mint = TokenMint::new();
        let mut table = RequestTable::new();
        let a = mint.push_token();
        let b = mint.pop_token();
        table.park(a, PendingRequest::push(Sga::single("x")));
        table.park(b, PendingRequest::pop());
        assert_eq!(table.depth(), 2);

        // claim-free cancellation: entry vanishes from the map entirely
        table.take(a);
        // completion: entry stays claimable but leaves the work queue
        let mut req = table.take(b).unwrap();
        req.finish(Ok(0));
        table.restore(b, req);

        let (push, pop) = table.next_attempts();
        assert_eq!(push, None);
        assert_eq!(pop, None);
        assert_eq!(table.depth(), 0);
        assert!(table.claim_done(b).is_some());
    }

    #[test]
    fn cancel_all_fails_unfinished_requests() {
        let mut mint = TokenMint::new();
        let mut table = RequestTable::new();
        let a = mint.push_token();
        let b = mint.pop_token();
        table.park(a, PendingRequest::push(Sga::single("x")));
        table.park(b, PendingRequest::pop());

        assert_eq!(table.cancel_all(), 2);
        assert_eq!(table.depth(), 0);
        let (result, _) = table.claim_done(a).unwrap().into_result();
        assert!(matches!(result, Err(RequestFailure::Cancelled)));
        let (result, _) = table.claim_done(b).unwrap().into_result();
        assert!(matches!(result, Err(RequestFailure::Cancelled)));
    }

    #[test]
    fn cancel_all_spares_completed_requests() {
        let mut mint = TokenMint::new();
        let mut table = RequestTable::new();
        let a = mint.push_token();
        let b = mint.pop_token();
        table.park(a, PendingRequest::push(Sga::single("x")));
        table.park(b, PendingRequest::pop());

        // a completed but its token is still sitting in the work queue
        let mut req = table.take(a).unwrap();
        req.finish(Ok(1));
        table.restore(a, req);
        assert_eq!(table.depth(), 2);

        assert_eq!(table.cancel_all(), 1);
        let (result, _) = table.claim_done(a).unwrap().into_result();
        assert_eq!(result.unwrap(), 1);
        let (result, _) = table.claim_done(b).unwrap().into_result();
        assert!(matches!(result, Err(RequestFailure::Cancelled)));
    }

    #[test]
    fn push_frame_len_counts_header_and_cells() {
        let req = PendingRequest::push(Sga::new(vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b"world"),
        ]));
        assert_eq!(req.push_frame_len(), FRAME_HDR_LEN + 2 * LEN_CELL + 10);
    }
}
