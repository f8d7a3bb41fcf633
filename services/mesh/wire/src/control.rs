//! Transport control PDUs.
//!
//! ```text
//! Segment Acknowledgment:  OBO(1) | SeqZero(13) | RFU(2) | BlockAck(32)
//! Heartbeat:               RFU(1) | InitTTL(7)  | Features(16)
//! ```

use crate::WireError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Transport control opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtlOp {
    /// Segment Acknowledgment
    Ack = 0x00,
    /// Friend Poll
    FriendPoll = 0x01,
    /// Friend Update
    FriendUpdate = 0x02,
    /// Friend Request
    FriendReq = 0x03,
    /// Friend Offer
    FriendOffer = 0x04,
    /// Friend Clear
    FriendClear = 0x05,
    /// Friend Clear Confirm
    FriendClearCfm = 0x06,
    /// Friend Subscription List Add
    FriendSubAdd = 0x07,
    /// Friend Subscription List Remove
    FriendSubRem = 0x08,
    /// Friend Subscription List Confirm
    FriendSubCfm = 0x09,
    /// Heartbeat
    Heartbeat = 0x0a,
}

impl TryFrom<u8> for CtlOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CtlOp::Ack),
            0x01 => Ok(CtlOp::FriendPoll),
            0x02 => Ok(CtlOp::FriendUpdate),
            0x03 => Ok(CtlOp::FriendReq),
            0x04 => Ok(CtlOp::FriendOffer),
            0x05 => Ok(CtlOp::FriendClear),
            0x06 => Ok(CtlOp::FriendClearCfm),
            0x07 => Ok(CtlOp::FriendSubAdd),
            0x08 => Ok(CtlOp::FriendSubRem),
            0x09 => Ok(CtlOp::FriendSubCfm),
            0x0a => Ok(CtlOp::Heartbeat),
            _ => Err(WireError::Opcode(value)),
        }
    }
}

impl CtlOp {
    /// Opcodes a Friend node handles on behalf of its Low Power nodes
    pub fn is_friend_server_op(self) -> bool {
        matches!(
            self,
            CtlOp::FriendPoll
                | CtlOp::FriendReq
                | CtlOp::FriendClear
                | CtlOp::FriendClearCfm
                | CtlOp::FriendSubAdd
                | CtlOp::FriendSubRem
        )
    }
}

/// Segment Acknowledgment parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Sent by a Friend on behalf of a Low Power node
    pub obo: bool,
    /// SeqZero of the acknowledged message
    pub seq_zero: u16,
    /// Bitmap of received segments; zero rejects the message
    pub block: u32,
}

impl SegmentAck {
    /// Encoded parameter length
    pub const LEN: usize = 6;

    /// Encode the acknowledgment parameters
    pub fn encode(&self, buf: &mut BytesMut) {
        let field = ((self.seq_zero << 2) & 0x7ffc) | ((self.obo as u16) << 15);
        buf.put_u16(field);
        buf.put_u32(self.block);
    }

    /// Decode the acknowledgment parameters
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() != Self::LEN {
            return Err(WireError::Length {
                what: "segment ack",
                expected: Self::LEN,
                got: buf.remaining(),
            });
        }

        let field = buf.get_u16();
        Ok(Self {
            obo: field & 0x8000 != 0,
            seq_zero: (field >> 2) & crate::lower::SEQ_ZERO_MASK,
            block: buf.get_u32(),
        })
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

bitflags! {
    /// Features advertised in a Heartbeat
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Features: u16 {
        /// Relay feature in use
        const RELAY = 1 << 0;
        /// Proxy feature in use
        const PROXY = 1 << 1;
        /// Friend feature in use
        const FRIEND = 1 << 2;
        /// Low Power feature in use
        const LOW_POWER = 1 << 3;
    }
}

/// Heartbeat parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// TTL the heartbeat was originally sent with
    pub init_ttl: u8,
    /// Active features of the sender
    pub features: Features,
}

impl Heartbeat {
    /// Encoded parameter length
    pub const LEN: usize = 3;

    /// Encode the heartbeat parameters
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.init_ttl & 0x7f);
        buf.put_u16(self.features.bits());
    }

    /// Decode the heartbeat parameters
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() != Self::LEN {
            return Err(WireError::Length {
                what: "heartbeat",
                expected: Self::LEN,
                got: buf.remaining(),
            });
        }

        Ok(Self {
            init_ttl: buf.get_u8() & 0x7f,
            features: Features::from_bits_retain(buf.get_u16()),
        })
    }

    /// Hop count for a heartbeat received with `recv_ttl`
    pub fn hops(&self, recv_ttl: u8) -> u8 {
        self.init_ttl.wrapping_sub(recv_ttl).wrapping_add(1)
    }
}
