//! Bit-exact PDU formats for the Bluetooth mesh network and lower transport layers.
//!
//! This crate contains no protocol state. It packs and unpacks the byte layouts
//! that must interoperate with other mesh nodes, and provides the mechanics of
//! splitting an upper transport PDU into segments and collecting them again.
//!
//! ## Layers
//!
//! ```text
//! +---------------------------+
//! | upper transport PDU       |  access payload + TransMIC, or control params
//! +---------------------------+
//! | lower transport header    |  1 byte unsegmented, 4 bytes segmented
//! +---------------------------+
//! | network header            |  IVI/NID, CTL/TTL, SEQ, SRC, DST
//! +---------------------------+
//! | NetMIC                    |  32 or 64 bits
//! +---------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod control;
pub mod error;
pub mod lower;
pub mod network;
pub mod segment;

// Re-export main types
pub use control::{CtlOp, Features, Heartbeat, SegmentAck};
pub use error::WireError;
pub use lower::{
    block_complete, seg_len, seq_auth, SegmentHeader, APP_SEG_LEN, CTL_SEG_LEN, MAX_SEGMENTS,
    SDU_UNSEG_MAX, SEG_HDR_LEN,
};
pub use network::{NetHeader, MIN_PDU_LEN, NET_HDR_LEN, SEQ_MAX, TTL_MAX};
pub use segment::{build_segment, ReassemblyBuffer, SegmentOutcome, Segmenter, Segments};
