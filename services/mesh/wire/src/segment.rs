//! Segmentation and reassembly of upper transport PDUs.
//!
//! This module provides the byte-level mechanics: splitting an SDU into
//! fixed-size segment payloads and collecting segment payloads back into a
//! contiguous buffer with a received-block bitmap. Retransmission and
//! acknowledgement policy live in the transport crate.

use crate::lower::{block_complete, seg_len, SegmentHeader, MAX_SEGMENTS};
use crate::WireError;
use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

/// Segment payloads of one message
pub type Segments = SmallVec<[Bytes; 4]>;

/// Number of segments needed for `len` bytes
pub fn segment_count(len: usize, ctl: bool) -> usize {
    if len == 0 {
        return 0;
    }
    (len - 1) / seg_len(ctl) + 1
}

/// Splitter for upper transport PDUs
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    seg_len: usize,
}

impl Segmenter {
    /// Create a segmenter for access (`ctl == false`) or control messages
    pub fn new(ctl: bool) -> Self {
        Self {
            seg_len: seg_len(ctl),
        }
    }

    /// Payload bytes per segment
    pub fn seg_len(&self) -> usize {
        self.seg_len
    }

    /// Split a payload into segment payloads
    pub fn split(&self, sdu: &Bytes) -> Result<Segments, WireError> {
        if sdu.is_empty() {
            return Err(WireError::Size(0));
        }

        let total = (sdu.len() - 1) / self.seg_len + 1;
        if total > MAX_SEGMENTS {
            return Err(WireError::Size(sdu.len()));
        }

        let mut segments = Segments::with_capacity(total);
        let mut offset = 0;
        while offset < sdu.len() {
            let end = std::cmp::min(offset + self.seg_len, sdu.len());
            segments.push(sdu.slice(offset..end));
            offset = end;
        }

        Ok(segments)
    }
}

/// Build a complete segmented lower transport PDU
pub fn build_segment(header: &SegmentHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(crate::lower::SEG_HDR_LEN + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Result of storing one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Segment stored, more are missing
    Stored,
    /// Segment was already received
    Duplicate,
    /// Every segment has been received
    Complete,
}

/// Collects segments of one message into a contiguous buffer
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    data: BytesMut,
    seg_len: usize,
    seg_n: u8,
    block: u32,
    len: usize,
    max_len: usize,
}

impl ReassemblyBuffer {
    /// Create a buffer for a message of `seg_n + 1` segments.
    ///
    /// Fails when the largest possible message would not fit `max_len`.
    pub fn new(ctl: bool, seg_n: u8, max_len: usize) -> Result<Self, WireError> {
        let seg_len = seg_len(ctl);
        let upper = (seg_n as usize + 1) * seg_len;
        if seg_n as usize >= MAX_SEGMENTS || upper > max_len {
            return Err(WireError::Size(upper));
        }

        let mut data = BytesMut::with_capacity(upper);
        data.resize(upper, 0);

        Ok(Self {
            data,
            seg_len,
            seg_n,
            block: 0,
            len: 0,
            max_len,
        })
    }

    /// Store the payload of segment `seg_o`
    pub fn insert(&mut self, seg_o: u8, payload: &[u8]) -> Result<SegmentOutcome, WireError> {
        if seg_o > self.seg_n {
            return Err(WireError::SegmentOffset {
                seg_o,
                seg_n: self.seg_n,
            });
        }

        if self.block & (1 << seg_o) != 0 {
            return Ok(SegmentOutcome::Duplicate);
        }

        if seg_o == self.seg_n {
            let total = self.seg_n as usize * self.seg_len + payload.len();
            if total > self.max_len {
                return Err(WireError::Size(total));
            }
            if payload.is_empty() || payload.len() > self.seg_len {
                return Err(WireError::Length {
                    what: "last segment",
                    expected: self.seg_len,
                    got: payload.len(),
                });
            }
            self.len = total;
        } else if payload.len() != self.seg_len {
            return Err(WireError::Length {
                what: "segment",
                expected: self.seg_len,
                got: payload.len(),
            });
        }

        let offset = seg_o as usize * self.seg_len;
        self.data[offset..offset + payload.len()].copy_from_slice(payload);
        self.block |= 1 << seg_o;

        if self.is_complete() {
            Ok(SegmentOutcome::Complete)
        } else {
            Ok(SegmentOutcome::Stored)
        }
    }

    /// Bitmap of received segments
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Last segment number
    pub fn seg_n(&self) -> u8 {
        self.seg_n
    }

    /// Whether all segments are in
    pub fn is_complete(&self) -> bool {
        self.block == block_complete(self.seg_n)
    }

    /// Take the reassembled message
    pub fn take(&mut self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        data.truncate(self.len);
        Some(data.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RX_SDU_MAX: usize = 384;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 + 3) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(0, false), 0);
        assert_eq!(segment_count(12, false), 1);
        assert_eq!(segment_count(13, false), 2);
        assert_eq!(segment_count(20, false), 2);
        assert_eq!(segment_count(24, false), 2);
        assert_eq!(segment_count(9, true), 2);
    }

    #[test]
    fn test_split_rejects_empty_and_oversized() {
        let segmenter = Segmenter::new(false);
        assert_eq!(segmenter.split(&Bytes::new()), Err(WireError::Size(0)));
        assert!(segmenter.split(&payload(385)).is_err());
        assert_eq!(segmenter.split(&payload(384)).unwrap().len(), 32);
    }

    #[test]
    fn test_reassembly_reproduces_payload() {
        for ctl in [false, true] {
            let segmenter = Segmenter::new(ctl);
            let max = MAX_SEGMENTS * segmenter.seg_len();
            for len in 1..=max.min(RX_SDU_MAX) {
                let sdu = payload(len);
                let segments = segmenter.split(&sdu).unwrap();
                let seg_n = (segments.len() - 1) as u8;
                let mut buf = ReassemblyBuffer::new(ctl, seg_n, RX_SDU_MAX).unwrap();

                // Deliver in reverse to exercise the out-of-order path
                for (seg_o, seg) in segments.iter().enumerate().rev() {
                    let outcome = buf.insert(seg_o as u8, seg).unwrap();
                    if seg_o == 0 {
                        assert_eq!(outcome, SegmentOutcome::Complete);
                    } else {
                        assert_eq!(outcome, SegmentOutcome::Stored);
                    }
                }

                assert_eq!(buf.take().unwrap(), sdu, "len {} ctl {}", len, ctl);
            }
        }
    }

    #[test]
    fn test_reassembly_duplicate_segment() {
        let mut buf = ReassemblyBuffer::new(false, 1, RX_SDU_MAX).unwrap();
        assert_eq!(buf.insert(0, &[1; 12]).unwrap(), SegmentOutcome::Stored);
        assert_eq!(buf.insert(0, &[9; 12]).unwrap(), SegmentOutcome::Duplicate);
        assert_eq!(buf.block(), 0b01);
        assert!(buf.take().is_none());
    }

    #[test]
    fn test_reassembly_rejects_short_middle_segment() {
        let mut buf = ReassemblyBuffer::new(false, 2, RX_SDU_MAX).unwrap();
        assert!(matches!(
            buf.insert(1, &[0; 5]),
            Err(WireError::Length { got: 5, .. })
        ));
        assert_eq!(buf.block(), 0);
    }

    #[test]
    fn test_reassembly_size_limit() {
        assert_eq!(
            ReassemblyBuffer::new(true, 3, 30).unwrap_err(),
            WireError::Size(32)
        );

        let mut buf = ReassemblyBuffer::new(false, 2, 36).unwrap();
        assert!(matches!(
            buf.insert(2, &[0; 13]),
            Err(WireError::Size(37))
        ));
        assert_eq!(buf.insert(2, &[0; 12]).unwrap(), SegmentOutcome::Stored);
    }
}
