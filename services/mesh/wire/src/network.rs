//! Network PDU header.
//!
//! ```text
//! +-----+-----+-----+-----------+---------+---------+---------+----------+
//! | IVI | NID | CTL | TTL       | SEQ     | SRC     | DST     | payload  |
//! | 1b  | 7b  | 1b  | 7b        | 24b BE  | 16b BE  | 16b BE  | + NetMIC |
//! +-----+-----+-----+-----------+---------+---------+---------+----------+
//! ```
//!
//! Byte 0 stays in the clear. Bytes 1..7 (CTL/TTL, SEQ, SRC) are obfuscated
//! and DST onwards is encrypted; the NetMIC is 4 bytes for access PDUs and
//! 8 bytes for control PDUs.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cleartext network header length
pub const NET_HDR_LEN: usize = 9;

/// NetMIC length for access PDUs
pub const NET_MIC_SHORT: usize = 4;

/// NetMIC length for control PDUs
pub const NET_MIC_LONG: usize = 8;

/// Shortest PDU worth attempting to decrypt
pub const MIN_PDU_LEN: usize = 18;

/// Largest network PDU (advertising bearer payload)
pub const MAX_PDU_LEN: usize = 29;

/// Sequence numbers are 24 bits
pub const SEQ_MAX: u32 = 0x00ff_ffff;

/// Largest TTL that fits the header field
pub const TTL_MAX: u8 = 0x7f;

/// Offset of the obfuscated header region
pub const OBFUSCATED_RANGE: std::ops::Range<usize> = 1..7;

/// NetMIC length for the given CTL bit
pub fn mic_len(ctl: bool) -> usize {
    if ctl {
        NET_MIC_LONG
    } else {
        NET_MIC_SHORT
    }
}

/// Cleartext network header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHeader {
    /// Least significant bit of the IV index used to protect the PDU
    pub ivi: bool,
    /// Network identifier derived from the key
    pub nid: u8,
    /// Control PDU
    pub ctl: bool,
    /// Time to live
    pub ttl: u8,
    /// Sequence number
    pub seq: u32,
    /// Source (always unicast)
    pub src: u16,
    /// Destination
    pub dst: u16,
}

impl NetHeader {
    /// Encode the header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.ttl > TTL_MAX {
            return Err(WireError::Ttl(self.ttl));
        }
        if self.seq > SEQ_MAX {
            return Err(WireError::Size(self.seq as usize));
        }

        buf.put_u8(((self.ivi as u8) << 7) | (self.nid & 0x7f));
        buf.put_u8(((self.ctl as u8) << 7) | self.ttl);
        buf.put_uint(self.seq as u64, 3);
        buf.put_u16(self.src);
        buf.put_u16(self.dst);
        Ok(())
    }

    /// Decode the header from a buffer, consuming 9 bytes
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < NET_HDR_LEN {
            return Err(WireError::Truncated {
                need: NET_HDR_LEN,
                got: buf.remaining(),
            });
        }

        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        let seq = buf.get_uint(3) as u32;
        let src = buf.get_u16();
        let dst = buf.get_u16();

        Ok(Self {
            ivi: b0 & 0x80 != 0,
            nid: b0 & 0x7f,
            ctl: b1 & 0x80 != 0,
            ttl: b1 & 0x7f,
            seq,
            src,
            dst,
        })
    }

    /// Decode the header from the front of a deobfuscated PDU
    pub fn parse(pdu: &[u8]) -> Result<Self, WireError> {
        let mut buf = Bytes::copy_from_slice(&pdu[..pdu.len().min(NET_HDR_LEN)]);
        Self::decode(&mut buf)
    }

    /// NetMIC length for this header
    pub fn mic_len(&self) -> usize {
        mic_len(self.ctl)
    }
}

/// IVI bit and NID of a raw PDU (byte 0 is never obfuscated)
pub fn ivi_nid(pdu: &[u8]) -> Option<(bool, u8)> {
    pdu.first().map(|b| (b & 0x80 != 0, b & 0x7f))
}

/// Rewrite the NID keeping the IVI bit
pub fn set_nid(pdu: &mut [u8], nid: u8) {
    if let Some(b) = pdu.first_mut() {
        *b = (*b & 0x80) | (nid & 0x7f);
    }
}

/// Rewrite the TTL keeping the CTL bit
pub fn set_ttl(pdu: &mut [u8], ttl: u8) {
    if let Some(b) = pdu.get_mut(1) {
        *b = (*b & 0x80) | (ttl & 0x7f);
    }
}

/// Rewrite the 24-bit sequence number
pub fn set_seq(pdu: &mut [u8], seq: u32) {
    if pdu.len() >= 5 {
        pdu[2] = (seq >> 16) as u8;
        pdu[3] = (seq >> 8) as u8;
        pdu[4] = seq as u8;
    }
}
