// Packet queue backend: scatter-gather datagrams over a poll-mode device.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use tracing::debug;

use crate::api::{PacketDevice, Sga};
use crate::config::{AddrTable, PacketConfig};
use crate::metrics::Metrics;
use crate::packet::{self, PacketError};
use crate::pending::{PendingRequest, RequestFailure, RequestTable};
use crate::token::OpKind;

/// Per-queue state for one datagram endpoint.
#[derive(Debug)]
pub(crate) struct PacketQueue {
    pub bound: Option<SocketAddrV4>,
    pub default_peer: Option<SocketAddrV4>,
    pub reqs: RequestTable,
    /// Frames pulled from the device and not yet matched against this
    /// queue's binding.
    rx_staging: VecDeque<Bytes>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            bound: None,
            default_peer: None,
            reqs: RequestTable::new(),
            rx_staging: VecDeque::new(),
        }
    }

    /// Resolves the destination for a push: the array's explicit address,
    /// else the connected default peer.
    pub fn destination(&self, sga: &Sga) -> Option<SocketAddrV4> {
        match self.default_peer {
            Some(peer) => Some(peer),
            None => sga.addr,
        }
    }

    /// Source address stamped on outgoing frames: the bound address, else
    /// the MAC-derived IP with the destination's port (matching the
    /// unbound-sender convention of the wire format).
    pub fn source<D: PacketDevice>(
        &self,
        dev: &D,
        table: &AddrTable,
        dst: SocketAddrV4,
    ) -> SocketAddrV4 {
        match self.bound {
            Some(addr) => addr,
            None => {
                let ip = table.mac_to_ip(dev.mac()).unwrap_or(Ipv4Addr::UNSPECIFIED);
                SocketAddrV4::new(ip, dst.port())
            }
        }
    }

    /// Encodes the frame for a push at submission time. Errors here are
    /// synchronous; the request is never parked.
    pub fn encode_push<D: PacketDevice>(
        &self,
        dev: &D,
        table: &AddrTable,
        cfg: &PacketConfig,
        sga: &Sga,
        dst: SocketAddrV4,
    ) -> Result<Bytes, PacketError> {
        let src = self.source(dev, table, dst);
        let dst_mac = table.ip_to_mac(*dst.ip());
        packet::build_frame(sga, dev.mac(), dst_mac, src, dst, cfg.mtu)
    }

    /// One progress step: attempt the first parked push and the first
    /// parked pop once each.
    pub fn step<D: PacketDevice>(&mut self, dev: &mut D, cfg: &PacketConfig, metrics: &Metrics) {
        let (push, pop) = self.reqs.next_attempts();
        for qt in [push, pop].into_iter().flatten() {
            let mut req = match self.reqs.take(qt) {
                Some(req) => req,
                None => continue,
            };
            if req.kind == OpKind::Push {
                self.attempt_send(dev, &mut req, metrics);
            } else {
                self.attempt_recv(dev, cfg, &mut req, metrics);
            }
            self.reqs.restore(qt, req);
        }
    }

    /// Offers the prepared frame to the device; an unaccepted burst leaves
    /// the request parked.
    pub fn attempt_send<D: PacketDevice>(
        &mut self,
        dev: &mut D,
        req: &mut PendingRequest,
        metrics: &Metrics,
    ) {
        let frame = match &req.frame {
            Some(frame) => frame.clone(),
            None => {
                req.finish(Err(RequestFailure::Cancelled));
                return;
            }
        };
        let mut burst = VecDeque::from([frame]);
        match dev.tx_burst(&mut burst) {
            Ok(0) => {
                metrics.would_block_total.inc();
            }
            Ok(_) => {
                metrics.frames_tx.inc();
                metrics.bytes_pushed.inc_by(req.sga.total_len() as u64);
                req.finish(Ok(req.sga.total_len()));
            }
            Err(err) => {
                req.finish(Err(RequestFailure::Io(err)));
            }
        }
    }

    /// Services the receive path for one pop: drains staged frames against
    /// this queue's binding, pulling at most one burst from the device.
    pub fn attempt_recv<D: PacketDevice>(
        &mut self,
        dev: &mut D,
        cfg: &PacketConfig,
        req: &mut PendingRequest,
        metrics: &Metrics,
    ) {
        let mut pulled = false;
        loop {
            while let Some(frame) = self.rx_staging.pop_front() {
                match packet::parse_frame(&frame, dev.mac(), self.bound) {
                    Ok((sga, _peer)) => {
                        let bytes = sga.total_len();
                        req.sga = sga;
                        metrics.frames_rx.inc();
                        metrics.bytes_popped.inc_by(bytes as u64);
                        req.finish(Ok(bytes));
                        return;
                    }
                    Err(reason) => {
                        debug!(reason = reason.as_str(), "dropped frame");
                        metrics.rx_drops.with_label_values(&[reason.as_str()]).inc();
                    }
                }
            }

            if pulled {
                metrics.would_block_total.inc();
                return;
            }
            match dev.rx_burst(cfg.rx_burst) {
                Ok(frames) if frames.is_empty() => {
                    metrics.would_block_total.inc();
                    return;
                }
                Ok(frames) => {
                    self.rx_staging.extend(frames);
                    pulled = true;
                }
                Err(err) => {
                    req.finish(Err(RequestFailure::Io(err)));
                    return;
                }
            }
        }
    }

    /// Token-less best-effort pop.
    pub fn peek<D: PacketDevice>(
        &mut self,
        dev: &mut D,
        cfg: &PacketConfig,
        metrics: &Metrics,
    ) -> Result<Option<Sga>, RequestFailure> {
        let mut req = PendingRequest::pop();
        self.attempt_recv(dev, cfg, &mut req, metrics);
        if req.is_done() {
            let (result, sga) = req.into_result();
            result.map(|_| Some(sga))
        } else {
            Ok(None)
        }
    }
}
