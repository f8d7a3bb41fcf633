//! Wire format error types.

use thiserror::Error;

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the format requires
    #[error("truncated pdu: need {need} bytes, got {got}")]
    Truncated {
        /// Minimum length for the format
        need: usize,
        /// Length actually available
        got: usize,
    },

    /// Unexpected PDU length for a fixed-size format
    #[error("bad length {got} for {what}, expected {expected}")]
    Length {
        /// Name of the PDU
        what: &'static str,
        /// Expected length
        expected: usize,
        /// Length actually available
        got: usize,
    },

    /// Segment offset beyond the last segment
    #[error("segment offset {seg_o} exceeds last segment {seg_n}")]
    SegmentOffset {
        /// SegO field
        seg_o: u8,
        /// SegN field
        seg_n: u8,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown transport control opcode
    #[error("unknown control opcode 0x{0:02x}")]
    Opcode(u8),

    /// Invalid address for the field it was placed in
    #[error("invalid address 0x{0:04x}")]
    Address(u16),

    /// Invalid TTL
    #[error("invalid ttl {0}")]
    Ttl(u8),
}
