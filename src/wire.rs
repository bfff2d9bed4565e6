// Wire format primitives for the byte-stream backend: magic-tagged
// scatter-gather framing.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::api::{Sga, MAX_SGA_SEGMENTS};

/// Sentinel that begins every stream frame.
pub const FRAME_MAGIC: u64 = u64::from_ne_bytes(*b"QPORTFRM");

/// Length of the fixed frame header in bytes: three 64-bit words.
pub const FRAME_HDR_LEN: usize = 24;

/// Length of the per-segment length cell preceding each segment body.
pub const LEN_CELL: usize = 8;

/// Upper bound on the declared payload length of a single frame. A peer
/// declaring more is treated as a protocol error rather than an allocation
/// request.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Stream-framing error. All variants are terminal for the affected request.
#[derive(Debug, Error)]
pub enum WireError {
    /// The first header word was not [`FRAME_MAGIC`].
    #[error("bad frame magic {0:#018x}")]
    BadMagic(u64),

    /// The header declared zero segments.
    #[error("frame declares zero segments")]
    ZeroSegments,

    /// The header declared more segments than [`MAX_SGA_SEGMENTS`].
    #[error("frame declares {0} segments, limit is {MAX_SGA_SEGMENTS}")]
    TooManySegments(u64),

    /// The header declared a payload larger than [`MAX_FRAME_PAYLOAD`].
    #[error("frame declares {0} payload bytes, limit is {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(u64),

    /// A segment record extended past the declared payload.
    #[error("segment {index} overruns the payload")]
    SegmentOverrun { index: usize },

    /// The segment records did not consume the payload exactly.
    #[error("{0} payload bytes left over after the last segment")]
    TrailingBytes(usize),

    /// A contiguous frame was shorter than its declared length.
    #[error("frame truncated")]
    Truncated,
}

/// The fixed header as carried on the wire.
///
/// Word order is magic, payload length, segment count; words are host
/// byte order (the format is point-to-point within one architecture).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes following the header: segment length cells plus segment bodies.
    pub payload_len: u64,
    /// Number of (length, body) records in the payload.
    pub seg_count: u64,
}

impl FrameHeader {
    /// Builds the header describing `sga`.
    pub fn describe(sga: &Sga) -> Self {
        let payload_len = sga
            .segments
            .iter()
            .map(|seg| (LEN_CELL + seg.len()) as u64)
            .sum();
        Self {
            payload_len,
            seg_count: sga.num_segments() as u64,
        }
    }

    /// Encodes the header into its 24-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HDR_LEN] {
        let mut buf = [0u8; FRAME_HDR_LEN];
        buf[0..8].copy_from_slice(&FRAME_MAGIC.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.seg_count.to_ne_bytes());
        buf
    }

    /// Parses and validates a 24-byte header.
    pub fn parse(bytes: &[u8; FRAME_HDR_LEN]) -> Result<Self, WireError> {
        let magic = u64::from_ne_bytes(bytes[0..8].try_into().expect("8-byte slice"));
        if magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let payload_len = u64::from_ne_bytes(bytes[8..16].try_into().expect("8-byte slice"));
        let seg_count = u64::from_ne_bytes(bytes[16..24].try_into().expect("8-byte slice"));
        if seg_count == 0 {
            return Err(WireError::ZeroSegments);
        }
        if seg_count > MAX_SGA_SEGMENTS as u64 {
            return Err(WireError::TooManySegments(seg_count));
        }
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            payload_len,
            seg_count,
        })
    }

    /// Total on-wire frame length including the header.
    pub fn frame_len(&self) -> u64 {
        FRAME_HDR_LEN as u64 + self.payload_len
    }
}

/// Per-segment length cells in wire form, in segment order.
pub fn length_cells(sga: &Sga) -> Vec<[u8; LEN_CELL]> {
    sga.segments
        .iter()
        .map(|seg| (seg.len() as u64).to_ne_bytes())
        .collect()
}

/// Slices a fully received payload into its segments.
///
/// The returned segment buffers alias `payload`; no copies are made. The
/// records must consume the payload exactly.
pub fn split_payload(payload: &Bytes, seg_count: u64) -> Result<Vec<Bytes>, WireError> {
    let mut segments = Vec::with_capacity(seg_count as usize);
    let mut offset = 0usize;

    for index in 0..seg_count as usize {
        let cell_end = offset
            .checked_add(LEN_CELL)
            .filter(|end| *end <= payload.len())
            .ok_or(WireError::SegmentOverrun { index })?;
        let len = u64::from_ne_bytes(
            payload[offset..cell_end]
                .try_into()
                .expect("8-byte slice"),
        ) as usize;
        let body_end = cell_end
            .checked_add(len)
            .filter(|end| *end <= payload.len())
            .ok_or(WireError::SegmentOverrun { index })?;
        segments.push(payload.slice(cell_end..body_end));
        offset = body_end;
    }

    if offset != payload.len() {
        return Err(WireError::TrailingBytes(payload.len() - offset));
    }
    Ok(segments)
}

/// Serialises a whole frame contiguously. The gather path in the stream
/// backend avoids this copy; this form exists for tests and tooling.
pub fn encode_frame(sga: &Sga) -> Vec<u8> {
    let header = FrameHeader::describe(sga);
    let mut out = BytesMut::with_capacity(header.frame_len() as usize);
    out.put_slice(&header.encode());
    for seg in &sga.segments {
        out.put_slice(&(seg.len() as u64).to_ne_bytes());
        out.put_slice(seg);
    }
    out.to_vec()
}

/// Parses a contiguous frame. Counterpart of [`encode_frame`].
pub fn decode_frame(bytes: &[u8]) -> Result<Sga, WireError> {
    let header_bytes: &[u8; FRAME_HDR_LEN] = bytes
        .get(..FRAME_HDR_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(WireError::Truncated)?;
    let header = FrameHeader::parse(header_bytes)?;
    let rest = &bytes[FRAME_HDR_LEN..];
    if (rest.len() as u64) < header.payload_len {
        return Err(WireError::Truncated);
    }
    if (rest.len() as u64) > header.payload_len {
        return Err(WireError::TrailingBytes(rest.len() - header.payload_len as usize));
    }
    let payload = Bytes::copy_from_slice(rest);
    let segments = split_payload(&payload, header.seg_count)?;
    Ok(Sga::new(segments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_sga() -> impl Strategy<Value = Sga> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..=8)
            .prop_map(|segs| Sga::new(segs.into_iter().map(Bytes::from).collect()))
    }

    #[test]
    fn header_round_trip() {
        let sga = Sga::new(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
        let header = FrameHeader::describe(&sga);
        assert_eq!(header.seg_count, 2);
        assert_eq!(header.payload_len, 10 + 2 * LEN_CELL as u64);

        let parsed = FrameHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FrameHeader::describe(&Sga::single("x")).encode();
        bytes[0..8].copy_from_slice(&0xDEAD_BEEFu64.to_ne_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(WireError::BadMagic(m)) if m == 0xDEAD_BEEF
        ));
    }

    #[test]
    fn rejects_zero_segments() {
        let header = FrameHeader {
            payload_len: 0,
            seg_count: 0,
        };
        assert!(matches!(
            FrameHeader::parse(&header.encode()),
            Err(WireError::ZeroSegments)
        ));
    }

    #[test]
    fn rejects_oversized_declarations() {
        let header = FrameHeader {
            payload_len: MAX_FRAME_PAYLOAD + 1,
            seg_count: 1,
        };
        assert!(matches!(
            FrameHeader::parse(&header.encode()),
            Err(WireError::PayloadTooLarge(_))
        ));

        let header = FrameHeader {
            payload_len: 0,
            seg_count: MAX_SGA_SEGMENTS as u64 + 1,
        };
        assert!(matches!(
            FrameHeader::parse(&header.encode()),
            Err(WireError::TooManySegments(_))
        ));
    }

    #[test]
    fn split_rejects_short_payload() {
        let sga = Sga::single("abcdef");
        let frame = encode_frame(&sga);
        let truncated = Bytes::copy_from_slice(&frame[FRAME_HDR_LEN..frame.len() - 1]);
        assert!(matches!(
            split_payload(&truncated, 1),
            Err(WireError::SegmentOverrun { index: 0 })
        ));
    }

    #[test]
    fn split_rejects_trailing_bytes() {
        let sga = Sga::single("abc");
        let mut frame = encode_frame(&sga);
        frame.push(0);
        let payload = Bytes::copy_from_slice(&frame[FRAME_HDR_LEN..]);
        assert!(matches!(
            split_payload(&payload, 1),
            Err(WireError::TrailingBytes(1))
        ));
    }

    proptest! {
        #[test]
        fn frame_round_trip(sga in arb_sga()) {
            let frame = encode_frame(&sga);
            let decoded = decode_frame(&frame).unwrap();
            prop_assert_eq!(decoded.num_segments(), sga.num_segments());
            prop_assert_eq!(decoded.segments, sga.segments);
        }

        #[test]
        fn segments_alias_one_allocation(sga in arb_sga()) {
            let frame = encode_frame(&sga);
            let payload = Bytes::copy_from_slice(&frame[FRAME_HDR_LEN..]);
            let segments = split_payload(&payload, sga.num_segments() as u64).unwrap();
            let total: usize = segments.iter().map(Bytes::len).sum();
            prop_assert_eq!(total, sga.total_len());
        }
    }
}
