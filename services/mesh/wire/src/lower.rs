//! Lower transport PDU headers.
//!
//! ```text
//! unsegmented access:   SEG=0 | AKF | AID(6)         + upper transport PDU
//! unsegmented control:  SEG=0 | OPCODE(7)            + parameters
//! segmented access:     SEG=1 | AKF | AID(6) | SZMIC | SeqZero(13) | SegO(5) | SegN(5)
//! segmented control:    SEG=1 | OPCODE(7)    | RFU   | SeqZero(13) | SegO(5) | SegN(5)
//! ```

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest payload sent unsegmented (access payload before TransMIC, or control parameters)
pub const SDU_UNSEG_MAX: usize = 11;

/// Segment payload size for access messages
pub const APP_SEG_LEN: usize = 12;

/// Segment payload size for control messages
pub const CTL_SEG_LEN: usize = 8;

/// Segmented header length
pub const SEG_HDR_LEN: usize = 4;

/// Segments per message (SegN is 5 bits)
pub const MAX_SEGMENTS: usize = 32;

/// SeqZero field mask
pub const SEQ_ZERO_MASK: u16 = 0x1fff;

/// TransMIC length for 32-bit MIC
pub const APP_MIC_SHORT: usize = 4;

/// TransMIC length for 64-bit MIC
pub const APP_MIC_LONG: usize = 8;

/// Segment payload size for the given message type
pub fn seg_len(ctl: bool) -> usize {
    if ctl {
        CTL_SEG_LEN
    } else {
        APP_SEG_LEN
    }
}

/// First byte of an unsegmented access PDU
pub fn unseg_hdr(akf: bool, aid: u8) -> u8 {
    ((akf as u8) << 6) | (aid & 0x3f)
}

/// First byte of a segmented access PDU
pub fn seg_hdr(akf: bool, aid: u8) -> u8 {
    unseg_hdr(akf, aid) | 0x80
}

/// First byte of a control PDU
pub fn ctl_hdr(op: u8, seg: bool) -> u8 {
    (op & 0x7f) | ((seg as u8) << 7)
}

/// SEG bit
pub fn is_seg(hdr: u8) -> bool {
    hdr & 0x80 != 0
}

/// AKF bit of an access header
pub fn akf(hdr: u8) -> bool {
    hdr & 0x40 != 0
}

/// AID of an access header
pub fn aid(hdr: u8) -> u8 {
    hdr & 0x3f
}

/// Opcode of a control header
pub fn ctl_op(hdr: u8) -> u8 {
    hdr & 0x7f
}

/// Block mask with every segment up to `seg_n` set
pub fn block_complete(seg_n: u8) -> u32 {
    ((1u64 << (seg_n as u32 + 1)) - 1) as u32
}

/// Combine IV index and sequence number into a SeqAuth value
pub fn seq_auth(iv_index: u32, seq: u32) -> u64 {
    ((iv_index as u64) << 24) | (seq & crate::network::SEQ_MAX) as u64
}

/// SeqZero carried for a message that started at `seq`
pub fn seq_zero(seq: u32) -> u16 {
    (seq as u16) & SEQ_ZERO_MASK
}

/// Recover the first sequence number of a message from the sequence number
/// of one of its segments and the SeqZero it carries.
pub fn base_seq(seq: u32, seq_zero: u16) -> u32 {
    let delta = ((seq & 0x3fff).wrapping_sub(seq_zero as u32)) & SEQ_ZERO_MASK as u32;
    seq.wrapping_sub(delta) & crate::network::SEQ_MAX
}

/// Segmentation fields of a segmented lower transport PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// First byte (SEG, AKF/AID or opcode)
    pub hdr: u8,
    /// SZMIC for access messages (RFU for control)
    pub szmic: bool,
    /// Low 13 bits of the first sequence number
    pub seq_zero: u16,
    /// Segment offset
    pub seg_o: u8,
    /// Last segment number
    pub seg_n: u8,
}

impl SegmentHeader {
    /// Encode the 4-byte segmented header
    pub fn encode(&self, buf: &mut BytesMut) {
        let seq_zero = self.seq_zero & SEQ_ZERO_MASK;
        buf.put_u8(self.hdr | 0x80);
        buf.put_u8(((self.szmic as u8) << 7) | (seq_zero >> 6) as u8);
        buf.put_u8((((seq_zero & 0x3f) as u8) << 2) | ((self.seg_o & 0x1f) >> 3));
        buf.put_u8(((self.seg_o & 0x07) << 5) | (self.seg_n & 0x1f));
    }

    /// Decode the 4-byte segmented header
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < SEG_HDR_LEN {
            return Err(WireError::Truncated {
                need: SEG_HDR_LEN,
                got: buf.remaining(),
            });
        }

        let hdr = buf.get_u8();
        let b1 = buf.get_u8();
        let b2 = buf.get_u8();
        let b3 = buf.get_u8();

        let szmic = b1 & 0x80 != 0;
        let seq_zero = (((b1 & 0x7f) as u16) << 6) | (b2 >> 2) as u16;
        let seg_o = ((b2 & 0x03) << 3) | (b3 >> 5);
        let seg_n = b3 & 0x1f;

        if seg_o > seg_n {
            return Err(WireError::SegmentOffset { seg_o, seg_n });
        }

        Ok(Self {
            hdr,
            szmic,
            seq_zero,
            seg_o,
            seg_n,
        })
    }

    /// Split a segmented PDU into its header and segment payload.
    ///
    /// A segment must carry at least one payload byte.
    pub fn split(pdu: &Bytes) -> Result<(Self, Bytes), WireError> {
        if pdu.len() < SEG_HDR_LEN + 1 {
            return Err(WireError::Truncated {
                need: SEG_HDR_LEN + 1,
                got: pdu.len(),
            });
        }
        let mut buf = pdu.clone();
        let header = Self::decode(&mut buf)?;
        Ok((header, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes() {
        assert_eq!(unseg_hdr(true, 0x26), 0x66);
        assert_eq!(seg_hdr(false, 0), 0x80);
        assert_eq!(ctl_hdr(0x0a, false), 0x0a);
        assert_eq!(ctl_hdr(0x8a, true), 0x8a);
        assert!(is_seg(0x80));
        assert!(akf(0x66));
        assert_eq!(aid(0x66), 0x26);
    }

    #[test]
    fn test_segment_header_layout() {
        let header = SegmentHeader {
            hdr: seg_hdr(true, 0x26),
            szmic: false,
            seq_zero: 0x1234 & SEQ_ZERO_MASK,
            seg_o: 1,
            seg_n: 3,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[0xe6, 0x48, 0xd0, 0x23]);

        let mut bytes = buf.freeze();
        assert_eq!(SegmentHeader::decode(&mut bytes).unwrap(), header);
    }

    #[test]
    fn test_segment_offset_checked() {
        let header = SegmentHeader {
            hdr: 0x80,
            szmic: false,
            seq_zero: 7,
            seg_o: 4,
            seg_n: 2,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.put_u8(0xaa);

        let err = SegmentHeader::split(&buf.freeze()).unwrap_err();
        assert_eq!(err, WireError::SegmentOffset { seg_o: 4, seg_n: 2 });
    }

    #[test]
    fn test_segment_requires_payload() {
        let pdu = Bytes::from_static(&[0x80, 0x00, 0x00, 0x00]);
        assert!(matches!(
            SegmentHeader::split(&pdu),
            Err(WireError::Truncated { need: 5, got: 4 })
        ));
    }

    #[test]
    fn test_block_complete() {
        assert_eq!(block_complete(0), 0b1);
        assert_eq!(block_complete(1), 0b11);
        assert_eq!(block_complete(31), u32::MAX);
    }

    #[test]
    fn test_base_seq() {
        assert_eq!(base_seq(0x1005, seq_zero(0x1003)), 0x1003);
        // SeqZero wraps at 13 bits
        assert_eq!(base_seq(0x2001, seq_zero(0x1ffe)), 0x1ffe);
        assert_eq!(seq_auth(2, 0x1003), 0x0200_1003);
    }
}
