//! # Wire Codec
//!
//! Byte-exact encode/decode for the FPPROTO datagram format (§4.2, §6).
//!
//! ## Header (8 bytes)
//!
//! ```text
//!  63 62 61                 46 45                 30 29           16 15            0
//! +--+--+----------------------+----------------------+---------------+------------+
//! |RR|        ack_vec (16)     |    ack_seq low (16)   | seqno low(14)|  checksum  |
//! +--+--+----------------------+----------------------+---------------+------------+
//! ```
//!
//! Full sequence numbers are never sent; they are reconstructed from the
//! peer's last-known window (`reconstruct_seqno`).
//!
//! ## Payload
//!
//! One or more typed chunks follow the header, each starting with a 1-byte
//! type tag. A packet ends at `PADDING` or at the transport datagram's exact
//! length — there is no outer length prefix.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::DecodeError;

pub const HEADER_LEN: usize = 8;

// ─── Header ──────────────────────────────────────────────────────────────

/// Decoded fixed 8-byte header, present on every FPPROTO packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Low 16 bits of the peer's checksum, validated separately by the caller.
    pub checksum: u16,
    /// Low 14 bits of this packet's sequence number.
    pub seqno_low: u16,
    /// Low 16 bits of the highest sequence number acked by the sender.
    pub ack_seq_low: u16,
    /// Bitmap of the 16 predecessors of `ack_seq`.
    pub ack_vec: u16,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        let word: u64 = (self.checksum as u64)
            | ((self.seqno_low as u64 & 0x3FFF) << 16)
            | ((self.ack_seq_low as u64) << 30)
            | ((self.ack_vec as u64) << 46);
        buf.put_u64(word);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let word = buf.get_u64();
        Ok(Header {
            checksum: (word & 0xFFFF) as u16,
            seqno_low: ((word >> 16) & 0x3FFF) as u16,
            ack_seq_low: ((word >> 30) & 0xFFFF) as u16,
            ack_vec: ((word >> 46) & 0xFFFF) as u16,
        })
    }

    /// Reconstruct the full 64-bit sequence number from the 14 low bits,
    /// choosing the candidate nearest to `expected` (§4.2).
    pub fn reconstruct_seqno(low14: u16, expected: u64) -> u64 {
        reconstruct_low_bits(low14 as u64, 14, expected)
    }

    pub fn reconstruct_ack_seq(low16: u16, expected: u64) -> u64 {
        reconstruct_low_bits(low16 as u64, 16, expected)
    }
}

/// Reconstruct a full value from its low `bits` bits, picking whichever
/// candidate (rounding the high bits down or up) lands closest to `expected`.
fn reconstruct_low_bits(low: u64, bits: u32, expected: u64) -> u64 {
    let span = 1u64 << bits;
    let mask = span - 1;
    let expected_high = expected >> bits;
    let candidate = (expected_high << bits) | low;

    let below = candidate.wrapping_sub(span);
    let above = candidate.wrapping_add(span);

    let mut best = candidate;
    let mut best_dist = expected.abs_diff(candidate);
    for c in [below, above] {
        let d = expected.abs_diff(c);
        if d < best_dist {
            best = c;
            best_dist = d;
        }
    }
    debug_assert_eq!(best & mask, low);
    best
}

/// 16-bit one's-complement Internet checksum over a UDP-style pseudo-header
/// (src IP, dst IP, protocol 222, length) followed by the payload.
pub fn checksum(src_ip: [u8; 4], dst_ip: [u8; 4], payload: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut add_bytes = |chunk: &[u8]| {
        let mut iter = chunk.chunks(2);
        while let Some(pair) = iter.next() {
            let word = if pair.len() == 2 {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], 0])
            };
            sum += word as u32;
        }
    };
    add_bytes(&src_ip);
    add_bytes(&dst_ip);
    let proto_and_len: [u8; 4] = [0, PROTOCOL_NUMBER, (payload.len() >> 8) as u8, payload.len() as u8];
    add_bytes(&proto_and_len);
    add_bytes(payload);

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Protocol number reserved for FPPROTO datagrams (§6).
pub const PROTOCOL_NUMBER: u8 = 222;

// ─── Payload type tags ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadTag {
    Reset = 1,
    Areq = 2,
    Alloc = 3,
    Ack = 4,
    Padding = 5,
}

impl PayloadTag {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(PayloadTag::Reset),
            2 => Some(PayloadTag::Areq),
            3 => Some(PayloadTag::Alloc),
            4 => Some(PayloadTag::Ack),
            5 => Some(PayloadTag::Padding),
            _ => None,
        }
    }
}

// ─── RESET ────────────────────────────────────────────────────────────────

/// `RESET` payload (9 bytes: 1-byte tag + 8-byte timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPayload {
    pub reset_timestamp: u64,
}

impl ResetPayload {
    pub const ENCODED_LEN: usize = 9;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PayloadTag::Reset as u8);
        buf.put_u64(self.reset_timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 8 {
            return Err(DecodeError::Truncated);
        }
        Ok(ResetPayload {
            reset_timestamp: buf.get_u64(),
        })
    }
}

// ─── AREQ ─────────────────────────────────────────────────────────────────

/// A single `{dst_id, cumulative_requested}` entry within an AREQ payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub dst_id: u16,
    /// Low 16 bits of the cumulative timeslot count requested for this dst.
    pub cumulative_low: u16,
}

/// `AREQ` payload: 1-byte tag, 1-byte count N, N * 4 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AreqPayload {
    pub requests: Vec<AllocRequest>,
}

impl AreqPayload {
    pub const MAX_ENTRIES: usize = 255;

    pub fn encoded_len(&self) -> usize {
        2 + self.requests.len() * 4
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PayloadTag::Areq as u8);
        buf.put_u8(self.requests.len() as u8);
        for r in &self.requests {
            buf.put_u16(r.dst_id);
            buf.put_u16(r.cumulative_low);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let n = buf.get_u8() as usize;
        if buf.remaining() < n * 4 {
            return Err(DecodeError::Truncated);
        }
        let mut requests = Vec::with_capacity(n);
        for _ in 0..n {
            let dst_id = buf.get_u16();
            let cumulative_low = buf.get_u16();
            requests.push(AllocRequest {
                dst_id,
                cumulative_low,
            });
        }
        Ok(AreqPayload { requests })
    }
}

// ─── ALLOC ────────────────────────────────────────────────────────────────

/// Per-slot descriptor byte: `(dst_index << 4) | flags`. `dst_index == 0`
/// means "skip" rather than "allocate".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor(pub u8);

impl SlotDescriptor {
    pub fn new(dst_index: u8, flags: u8) -> Self {
        SlotDescriptor(((dst_index & 0x0F) << 4) | (flags & 0x0F))
    }

    pub fn dst_index(self) -> u8 {
        (self.0 >> 4) & 0x0F
    }

    pub fn flags(self) -> u8 {
        self.0 & 0x0F
    }

    pub fn is_skip(self) -> bool {
        self.dst_index() == 0
    }
}

pub const EMU_FLAGS_DROP: u8 = 0x1;
pub const EMU_FLAGS_NONE: u8 = 0x0;

/// `ALLOC` payload, arbiter→endpoint only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocPayload {
    /// Low 16 bits of the base timeslot.
    pub base_tslot_low: u16,
    /// Destinations referenced by this ALLOC, indexed from 1 by slot descriptors.
    pub dst_ids: Vec<u16>,
    /// One descriptor byte per slot (skips and allocations interleaved).
    pub descriptors: Vec<SlotDescriptor>,
    /// Optional per-slot packet ids (emulation mode only), parallel to
    /// non-skip entries in `descriptors`.
    pub slot_ids: Option<Vec<u16>>,
}

impl AllocPayload {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PayloadTag::Alloc as u8);
        buf.put_u16(self.base_tslot_low);
        buf.put_u8(self.dst_ids.len() as u8);
        for &d in &self.dst_ids {
            buf.put_u16(d);
        }
        buf.put_u8(self.descriptors.len() as u8);
        for d in &self.descriptors {
            buf.put_u8(d.0);
        }
        match &self.slot_ids {
            Some(ids) => {
                buf.put_u8(1);
                for &id in ids {
                    buf.put_u16(id);
                }
            }
            None => buf.put_u8(0),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 3 {
            return Err(DecodeError::Truncated);
        }
        let base_tslot_low = buf.get_u16();
        let dst_count = buf.get_u8() as usize;
        if buf.remaining() < dst_count * 2 + 1 {
            return Err(DecodeError::Truncated);
        }
        let mut dst_ids = Vec::with_capacity(dst_count);
        for _ in 0..dst_count {
            dst_ids.push(buf.get_u16());
        }
        let desc_count = buf.get_u8() as usize;
        if buf.remaining() < desc_count + 1 {
            return Err(DecodeError::Truncated);
        }
        let mut descriptors = Vec::with_capacity(desc_count);
        let mut non_skip = 0usize;
        for _ in 0..desc_count {
            let d = SlotDescriptor(buf.get_u8());
            if !d.is_skip() {
                non_skip += 1;
            }
            descriptors.push(d);
        }
        let has_slot_ids = buf.get_u8();
        let slot_ids = match has_slot_ids {
            0 => None,
            1 => {
                if buf.remaining() < non_skip * 2 {
                    return Err(DecodeError::Truncated);
                }
                Some((0..non_skip).map(|_| buf.get_u16()).collect())
            }
            _ => return Err(DecodeError::UnknownPayloadType(has_slot_ids)),
        };
        Ok(AllocPayload {
            base_tslot_low,
            dst_ids,
            descriptors,
            slot_ids,
        })
    }
}

// ─── ACK ──────────────────────────────────────────────────────────────────

/// Extended `ACK` payload: an out-of-band acknowledgment carrying a wider
/// seqno/vector pair than fits in the per-packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub ack_seq: u32,
    pub ack_vec: u32,
}

impl AckPayload {
    pub const ENCODED_LEN: usize = 9;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PayloadTag::Ack as u8);
        buf.put_u32(self.ack_seq);
        buf.put_u32(self.ack_vec);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 8 {
            return Err(DecodeError::Truncated);
        }
        Ok(AckPayload {
            ack_seq: buf.get_u32(),
            ack_vec: buf.get_u32(),
        })
    }
}

// ─── PADDING ──────────────────────────────────────────────────────────────

pub fn encode_padding(buf: &mut BytesMut, min_size: usize) {
    buf.put_u8(PayloadTag::Padding as u8);
    while buf.len() < min_size {
        buf.put_u8(0);
    }
}

// ─── Parsed payload enum ──────────────────────────────────────────────────

/// One decoded payload chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Reset(ResetPayload),
    Areq(AreqPayload),
    Alloc(AllocPayload),
    Ack(AckPayload),
    Padding,
}

/// Decode every payload chunk from `buf` until exhausted or `PADDING` is hit.
pub fn decode_payloads(buf: &mut impl Buf) -> Result<Vec<Payload>, DecodeError> {
    let mut out = Vec::new();
    while buf.has_remaining() {
        let tag_byte = buf.chunk()[0];
        let tag = PayloadTag::from_byte(tag_byte).ok_or(DecodeError::UnknownPayloadType(tag_byte))?;
        buf.advance(1);
        match tag {
            PayloadTag::Reset => out.push(Payload::Reset(ResetPayload::decode(buf)?)),
            PayloadTag::Areq => out.push(Payload::Areq(AreqPayload::decode(buf)?)),
            PayloadTag::Alloc => out.push(Payload::Alloc(AllocPayload::decode(buf)?)),
            PayloadTag::Ack => out.push(Payload::Ack(AckPayload::decode(buf)?)),
            PayloadTag::Padding => {
                out.push(Payload::Padding);
                break;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    fn roundtrip_header(h: Header) -> Header {
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let mut cursor = buf.freeze();
        Header::decode(&mut cursor).unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let h = Header {
            checksum: 0xBEEF,
            seqno_low: 0x1234 & 0x3FFF,
            ack_seq_low: 0xABCD,
            ack_vec: 0xFACE,
        };
        assert_eq!(roundtrip_header(h), h);
    }

    #[test]
    fn reconstruct_seqno_nearest_candidate() {
        let expected = 1_000_000u64;
        let low14 = (expected as u16) & 0x3FFF;
        let got = Header::reconstruct_seqno(low14, expected);
        assert_eq!(got, expected);
    }

    #[test]
    fn reconstruct_seqno_across_wrap_boundary() {
        // expected is just past a 14-bit wrap boundary; low bits should still
        // resolve to the same candidate nearest `expected`.
        let span = 1u64 << 14;
        let expected = span * 10 + 2; // low bits = 2
        let low = 16383u16; // span - 1, i.e. "one before" expected's low bits
        let got = Header::reconstruct_seqno(low, expected);
        assert_eq!(got, span * 10 - 1);
    }

    #[test]
    fn reset_payload_roundtrip() {
        let p = ResetPayload {
            reset_timestamp: 0x0102030405060708,
        };
        let mut buf = BytesMut::new();
        p.encode(&mut buf);
        assert_eq!(buf.len(), ResetPayload::ENCODED_LEN);
        let mut cursor = buf.freeze();
        assert_eq!(cursor.get_u8(), PayloadTag::Reset as u8);
        assert_eq!(ResetPayload::decode(&mut cursor).unwrap(), p);
    }

    #[test]
    fn areq_payload_roundtrip() {
        let p = AreqPayload {
            requests: vec![
                AllocRequest {
                    dst_id: 7,
                    cumulative_low: 42,
                },
                AllocRequest {
                    dst_id: 99,
                    cumulative_low: 1000,
                },
            ],
        };
        let mut buf = BytesMut::new();
        p.encode(&mut buf);
        let mut cursor = buf.freeze();
        assert_eq!(cursor.get_u8(), PayloadTag::Areq as u8);
        assert_eq!(AreqPayload::decode(&mut cursor).unwrap(), p);
    }

    #[test]
    fn alloc_payload_roundtrip_with_slot_ids() {
        let p = AllocPayload {
            base_tslot_low: 0x1234,
            dst_ids: vec![3, 7, 9],
            descriptors: vec![
                SlotDescriptor::new(0, 2), // skip 3 timeslots
                SlotDescriptor::new(1, 0), // dst_ids[0] = 3
                SlotDescriptor::new(2, EMU_FLAGS_DROP),
            ],
            slot_ids: Some(vec![111, 222]),
        };
        let mut buf = BytesMut::new();
        p.encode(&mut buf);
        let mut cursor = buf.freeze();
        assert_eq!(cursor.get_u8(), PayloadTag::Alloc as u8);
        assert_eq!(AllocPayload::decode(&mut cursor).unwrap(), p);
    }

    #[test]
    fn alloc_payload_roundtrip_without_slot_ids() {
        let p = AllocPayload {
            base_tslot_low: 7,
            dst_ids: vec![1],
            descriptors: vec![SlotDescriptor::new(1, 0)],
            slot_ids: None,
        };
        let mut buf = BytesMut::new();
        p.encode(&mut buf);
        let mut cursor = buf.freeze();
        cursor.advance(1);
        assert_eq!(AllocPayload::decode(&mut cursor).unwrap(), p);
    }

    #[test]
    fn ack_payload_roundtrip() {
        let p = AckPayload {
            ack_seq: 0xCAFEBABE,
            ack_vec: 0xDEADBEEF,
        };
        let mut buf = BytesMut::new();
        p.encode(&mut buf);
        let mut cursor = buf.freeze();
        cursor.advance(1);
        assert_eq!(AckPayload::decode(&mut cursor).unwrap(), p);
    }

    #[test]
    fn truncated_payload_is_rejected_not_thrown() {
        let mut buf = BytesMut::new();
        buf.put_u8(PayloadTag::Reset as u8);
        buf.put_u32(1); // only 4 of 8 bytes
        let mut cursor = buf.freeze();
        cursor.advance(1);
        assert!(matches!(
            ResetPayload::decode(&mut cursor),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn decode_payloads_stops_at_padding() {
        let mut buf = BytesMut::new();
        ResetPayload {
            reset_timestamp: 5,
        }
        .encode(&mut buf);
        encode_padding(&mut buf, buf.len() + 16);
        let mut cursor = buf.freeze();
        let payloads = decode_payloads(&mut cursor).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(matches!(payloads[0], Payload::Reset(_)));
        assert!(matches!(payloads[1], Payload::Padding));
    }

    #[test]
    fn checksum_detects_corruption() {
        let payload = b"hello fastpass";
        let src = [10, 0, 0, 1];
        let dst = [10, 0, 0, 2];
        let good = checksum(src, dst, payload);
        let mut corrupted = payload.to_vec();
        corrupted[0] ^= 0xFF;
        let bad = checksum(src, dst, &corrupted);
        assert_ne!(good, bad);
    }

    #[test]
    fn unknown_payload_tag_increments_stat_not_panic() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xEE); // not a valid tag
        let mut cursor = buf.freeze();
        assert!(matches!(
            decode_payloads(&mut cursor),
            Err(DecodeError::UnknownPayloadType(0xEE))
        ));
    }
}
