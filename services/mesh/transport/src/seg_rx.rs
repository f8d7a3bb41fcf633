//! Reassembly of segmented messages.
//!
//! A slot is allocated on the first segment of a new SeqAuth and collects
//! segments until the block is complete or the discard timer fires. After
//! completion the slot keeps its source, destination, SeqAuth and block so
//! late copies of the last segment are answered with an acknowledgment
//! instead of a second delivery.

use crate::sar::SarConfig;
use crate::TransportError;
use bytes::Bytes;
use mesh_net::{NetRx, Scheduler, SlotId, SlotTimer, TimerEvent};
use mesh_storage::{ReplayList, RplQuery, RplSlot};
use mesh_wire::address::{self, UNASSIGNED};
use mesh_wire::lower::{block_complete, SEQ_ZERO_MASK};
use mesh_wire::{ReassemblyBuffer, SegmentAck, SegmentHeader, SegmentOutcome, WireError};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of concurrent reassemblies
pub const DEFAULT_RX_SLOTS: usize = 4;

/// Largest reassembled upper transport PDU
pub const RX_SDU_MAX: usize = 384;

/// A Segment Acknowledgment to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRequest {
    /// Subnet of the message
    pub net_idx: u16,
    /// Destination the message was received on
    pub recv_dst: u16,
    /// Original sender, destination of the ack
    pub dst: u16,
    /// TTL for the ack
    pub ttl: u8,
    /// Acknowledgment parameters
    pub ack: SegmentAck,
    /// Slot to notify once the ack is sent
    pub slot: Option<SlotId>,
}

/// A reassembly abandoned while a Friend queue held some of its segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned {
    /// Subnet
    pub net_idx: u16,
    /// Source
    pub src: u16,
    /// Destination
    pub dst: u16,
    /// SeqAuth
    pub seq_auth: u64,
}

/// Progress of a message after one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegStatus {
    /// Stored, more segments missing
    Stored,
    /// The last missing segment arrived
    Complete {
        /// Reassembled upper transport PDU
        sdu: Bytes,
        /// First byte of the segment header
        hdr: u8,
        /// SZMIC of the message
        szmic: bool,
    },
}

/// Outcome of [`RxPool::receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegRecv {
    /// What happened to the segment
    pub result: Result<SegStatus, TransportError>,
    /// Acknowledgment to send
    pub ack: Option<AckRequest>,
    /// Reassemblies dropped on the way
    pub abandoned: Vec<Abandoned>,
}

/// Replay list update deferred until the segment is accepted
pub struct RplReservation<'a> {
    /// List holding the reservation
    pub list: &'a ReplayList,
    /// Reserved slot
    pub slot: RplSlot,
    /// Message fields
    pub query: RplQuery,
}

impl RplReservation<'_> {
    fn commit(&self) {
        self.list.commit(self.slot, &self.query);
    }
}

/// A received segment
#[derive(Debug, Clone)]
pub struct SegmentIn<'a> {
    /// Receive descriptor
    pub rx: &'a NetRx,
    /// Segment header
    pub header: SegmentHeader,
    /// Segment payload
    pub payload: Bytes,
    /// SeqAuth of the message
    pub seq_auth: u64,
    /// A Friend queue can take the message (only asked for LPN-only traffic)
    pub friend_space: bool,
}

#[derive(Default)]
struct RxSlot {
    generation: u64,
    in_use: bool,
    net_idx: u16,
    src: u16,
    dst: u16,
    seq_auth: u64,
    hdr: u8,
    szmic: bool,
    seg_n: u8,
    ctl: bool,
    ttl: u8,
    obo: bool,
    block: u32,
    new_seg: bool,
    sarc: u8,
    last_ack: Option<Duration>,
    buf: Option<ReassemblyBuffer>,
    ack_timer: SlotTimer,
    dis_timer: SlotTimer,
}

impl RxSlot {
    fn ack_request(&self, slot: Option<SlotId>) -> AckRequest {
        AckRequest {
            net_idx: self.net_idx,
            recv_dst: self.dst,
            dst: self.src,
            ttl: self.ttl,
            ack: SegmentAck {
                obo: self.obo,
                seq_zero: self.seq_auth as u16 & SEQ_ZERO_MASK,
                block: self.block,
            },
            slot,
        }
    }

    fn is_complete(&self) -> bool {
        self.block == block_complete(self.seg_n)
    }
}

/// Pool of reassembly slots
pub struct RxPool {
    sar: SarConfig,
    sdu_max: usize,
    slots: Vec<RxSlot>,
}

impl RxPool {
    /// Create a pool with `count` slots accepting messages up to `sdu_max` bytes
    pub fn new(count: usize, sdu_max: usize, sar: SarConfig) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, RxSlot::default);
        Self {
            sar,
            sdu_max,
            slots,
        }
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut RxSlot> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
    }

    fn id(&self, index: usize) -> SlotId {
        SlotId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Number of reassemblies in progress
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    fn reset_slot(&mut self, index: usize, full: bool, sched: &dyn Scheduler) -> Option<Abandoned> {
        let slot = &mut self.slots[index];
        slot.ack_timer.cancel(sched);
        slot.dis_timer.cancel(sched);

        let abandoned = (slot.obo && slot.src != UNASSIGNED && !slot.is_complete()).then(|| {
            warn!("Clearing incomplete buffers from Friend queue");
            Abandoned {
                net_idx: slot.net_idx,
                src: slot.src,
                dst: slot.dst,
                seq_auth: slot.seq_auth,
            }
        });

        slot.in_use = false;
        slot.buf = None;
        if full {
            let generation = slot.generation.wrapping_add(1);
            *slot = RxSlot {
                generation,
                ..RxSlot::default()
            };
        }
        abandoned
    }

    fn zero_ack(seg: &SegmentIn<'_>) -> AckRequest {
        AckRequest {
            net_idx: seg.rx.net_idx,
            recv_dst: seg.rx.dst,
            dst: seg.rx.src,
            ttl: seg.rx.send_ttl,
            ack: SegmentAck {
                obo: seg.rx.friend_match,
                seq_zero: seg.header.seq_zero,
                block: 0,
            },
            slot: None,
        }
    }

    /// Process one segment
    pub fn receive(
        &mut self,
        seg: SegmentIn<'_>,
        rpl: Option<RplReservation<'_>>,
        sched: &dyn Scheduler,
    ) -> SegRecv {
        let rx = seg.rx;
        let header = seg.header;
        let mut out = SegRecv {
            result: Ok(SegStatus::Stored),
            ack: None,
            abandoned: Vec::new(),
        };

        // A newer message replaces any unfinished older one from the same pair
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.in_use && slot.src == rx.src && slot.dst == rx.dst && slot.seq_auth < seg.seq_auth {
                debug!("Dropping unfinished SeqAuth 0x{:x}", slot.seq_auth);
                out.abandoned.extend(self.reset_slot(index, true, sched));
            }
        }

        let mut found = None;
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.src != rx.src || slot.dst != rx.dst || slot.seq_auth < seg.seq_auth {
                continue;
            }

            if slot.seq_auth > seg.seq_auth {
                warn!("Ignoring old SeqAuth 0x{:x}", seg.seq_auth);
                out.result = Err(TransportError::InvalidPdu("old SeqAuth"));
                return out;
            }

            if slot.hdr != header.hdr || slot.seg_n != header.seg_n || slot.ctl != rx.ctl {
                warn!("Invalid segment for ongoing session");
                out.result = Err(TransportError::InvalidPdu("inconsistent segment"));
                return out;
            }

            if slot.in_use {
                found = Some(index);
                break;
            }

            if slot.is_complete() {
                debug!("Got segment for already complete SDU");
                let now = sched.now();
                let due = slot
                    .last_ack
                    .map_or(true, |last| now.saturating_sub(last) >= self.sar.ack_period());
                if due {
                    out.ack = Some(slot.ack_request(Some(self.id(index))));
                }
                if let Some(rpl) = rpl.as_ref() {
                    rpl.commit();
                }
                out.result = Err(TransportError::Already);
                return out;
            }

            warn!("Got segment for canceled SDU");
            out.result = Err(TransportError::InvalidPdu("canceled message"));
            return out;
        }

        let index = match found {
            Some(index) => index,
            None => match self.allocate(&seg, &mut out) {
                Some(index) => index,
                None => return out,
            },
        };

        self.store(index, seg, rpl, out, sched)
    }

    fn allocate(&mut self, seg: &SegmentIn<'_>, out: &mut SegRecv) -> Option<usize> {
        let rx = seg.rx;
        let header = seg.header;

        let buf = match ReassemblyBuffer::new(rx.ctl, header.seg_n, self.sdu_max) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("Too long SDU ({}), sending zero ack", e);
                out.ack = Some(Self::zero_ack(seg));
                out.result = Err(TransportError::Oversized(
                    (header.seg_n as usize + 1) * mesh_wire::seg_len(rx.ctl),
                ));
                return None;
            }
        };

        if rx.friend_match && !rx.local_match && !seg.friend_space {
            warn!("No space in Friend Queue for {} segments", header.seg_n + 1);
            out.ack = Some(Self::zero_ack(seg));
            out.result = Err(TransportError::NoFriendQueueSpace);
            return None;
        }

        let Some(index) = self.slots.iter().position(|s| !s.in_use) else {
            warn!("No free slots for new incoming segmented messages");
            if address::is_unicast(rx.dst) {
                out.ack = Some(Self::zero_ack(seg));
            }
            out.result = Err(TransportError::NoMemory);
            return None;
        };

        let slot = &mut self.slots[index];
        let generation = slot.generation.wrapping_add(1);
        *slot = RxSlot {
            generation,
            in_use: true,
            net_idx: rx.net_idx,
            src: rx.src,
            dst: rx.dst,
            seq_auth: seg.seq_auth,
            hdr: header.hdr,
            szmic: header.szmic,
            seg_n: header.seg_n,
            ctl: rx.ctl,
            ttl: rx.send_ttl,
            obo: rx.friend_match,
            buf: Some(buf),
            ..RxSlot::default()
        };
        debug!(
            "New reassembly src 0x{:04x} dst 0x{:04x} seq_auth 0x{:x} seg_n {}",
            rx.src, rx.dst, seg.seq_auth, header.seg_n
        );
        Some(index)
    }

    fn store(
        &mut self,
        index: usize,
        seg: SegmentIn<'_>,
        rpl: Option<RplReservation<'_>>,
        mut out: SegRecv,
        sched: &dyn Scheduler,
    ) -> SegRecv {
        let header = seg.header;
        let sar = self.sar;
        let id = self.id(index);
        let slot = &mut self.slots[index];

        if slot.block & (1 << header.seg_o) != 0 {
            debug!("Received already received fragment");
            out.result = Err(TransportError::Already);
            return out;
        }

        let Some(buf) = slot.buf.as_mut() else {
            out.result = Err(TransportError::InvalidPdu("no reassembly buffer"));
            return out;
        };
        match buf.insert(header.seg_o, &seg.payload) {
            Ok(SegmentOutcome::Duplicate) => {
                out.result = Err(TransportError::Already);
                return out;
            }
            Ok(_) => {}
            Err(WireError::Size(total)) => {
                warn!("Too large SDU len {}", total);
                out.ack = Some(Self::zero_ack(&seg));
                out.abandoned.extend(self.reset_slot(index, true, sched));
                out.result = Err(TransportError::Oversized(total));
                return out;
            }
            Err(e) => {
                warn!("Invalid segment: {}", e);
                out.result = Err(TransportError::Wire(e));
                return out;
            }
        }

        debug!("seg_o {} of seg_n {} stored", header.seg_o, header.seg_n);

        slot.dis_timer
            .start(sched, sar.discard_interval(), TimerEvent::SegRxDiscard(id));

        if address::is_unicast(slot.dst) {
            slot.sarc = if slot.seg_n > sar.segments_threshold {
                sar.ack_retrans_count
            } else {
                0
            };
            slot.new_seg = true;
            slot.ack_timer
                .start(sched, sar.ack_timeout(slot.seg_n), TimerEvent::SegRxAck(id));
        }

        if let Some(rpl) = rpl.as_ref() {
            rpl.commit();
        }

        slot.block |= 1 << header.seg_o;
        if !slot.is_complete() {
            return out;
        }

        debug!("Complete SDU");
        slot.dis_timer.cancel(sched);
        slot.ack_timer.cancel(sched);
        let sdu = slot.buf.as_mut().and_then(|b| b.take()).unwrap_or_default();
        out.ack = Some(slot.ack_request(Some(id)));
        out.result = Ok(SegStatus::Complete {
            sdu,
            hdr: slot.hdr,
            szmic: slot.szmic,
        });
        // Keep src/dst/SeqAuth/block to answer late segments
        self.reset_slot(index, false, sched);
        out
    }

    /// Acknowledgment timer fired
    pub fn ack_timer_fired(&mut self, id: SlotId) -> Option<AckRequest> {
        let slot = self.slot_mut(id)?;
        slot.ack_timer.fired();
        // A finished message was acked when its last segment arrived
        if !slot.in_use {
            return None;
        }
        debug!("rx timeout");
        let ack = slot.ack_request(Some(id));
        slot.new_seg = false;
        Some(ack)
    }

    /// An acknowledgment for a slot left the bearer
    pub fn ack_sent(&mut self, id: SlotId, sched: &dyn Scheduler) {
        let sar = self.sar;
        let now = sched.now();
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        slot.last_ack = Some(now);

        if slot.in_use && slot.seg_n > sar.segments_threshold && slot.sarc > 0 && !slot.new_seg {
            slot.sarc -= 1;
            slot.ack_timer
                .start(sched, sar.rx_interval(), TimerEvent::SegRxAck(id));
        }
    }

    /// Discard timer fired
    pub fn discard_fired(&mut self, id: SlotId, sched: &dyn Scheduler) -> Option<Abandoned> {
        let index = id.index;
        let slot = self.slot_mut(id)?;
        slot.dis_timer.fired();
        if !slot.in_use {
            return None;
        }
        warn!(
            "Incomplete timer expired, src 0x{:04x} block 0x{:08x}",
            slot.src, slot.block
        );
        self.reset_slot(index, false, sched)
    }

    /// Forget every reassembly
    pub fn reset(&mut self, sched: &dyn Scheduler) -> Vec<Abandoned> {
        (0..self.slots.len())
            .filter_map(|index| self.reset_slot(index, true, sched))
            .collect()
    }

    /// Forget reassemblies from one unicast source
    pub fn reset_src(&mut self, src: u16, sched: &dyn Scheduler) -> Vec<Abandoned> {
        if !address::is_unicast(src) {
            return Vec::new();
        }
        let matching: Vec<usize> = (0..self.slots.len())
            .filter(|&index| self.slots[index].src == src)
            .collect();
        matching
            .into_iter()
            .filter_map(|index| self.reset_slot(index, true, sched))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_net::{ManualScheduler, NetIf, TTL_DEFAULT};
    use mesh_subnet::Credential;
    use mesh_wire::lower::seg_hdr;

    fn rx(seq: u32) -> NetRx {
        NetRx {
            net_idx: 0,
            net_if: NetIf::Adv,
            credential: Credential::Flooding,
            new_key: false,
            old_iv: false,
            iv_index: 0,
            ctl: false,
            ttl: 5,
            send_ttl: TTL_DEFAULT,
            seq,
            src: 0x0002,
            dst: 0x0001,
            local_match: true,
            friend_match: false,
            msg_cache_idx: None,
        }
    }

    fn segment<'a>(rx: &'a NetRx, seg_o: u8, seg_n: u8, len: usize) -> SegmentIn<'a> {
        SegmentIn {
            rx,
            header: SegmentHeader {
                hdr: seg_hdr(true, 0x11),
                szmic: false,
                seq_zero: 0x20,
                seg_o,
                seg_n,
            },
            payload: Bytes::from(vec![seg_o; len]),
            seq_auth: 0x20,
            friend_space: true,
        }
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(2, RX_SDU_MAX, SarConfig::default());
        let r = rx(0x21);

        let out = pool.receive(segment(&r, 1, 1, 4), None, &sched);
        assert_eq!(out.result, Ok(SegStatus::Stored));
        assert!(out.ack.is_none());
        assert_eq!(pool.active(), 1);

        let out = pool.receive(segment(&r, 0, 1, 12), None, &sched);
        let Ok(SegStatus::Complete { sdu, .. }) = out.result else {
            panic!("expected completion, got {:?}", out.result);
        };
        assert_eq!(sdu.len(), 16);
        assert_eq!(&sdu[..12], &[0u8; 12]);
        assert_eq!(&sdu[12..], &[1u8; 4]);
        assert_eq!(out.ack.map(|a| a.ack.block), Some(0b11));
        assert_eq!(pool.active(), 0);
        assert!(sched.pending().is_empty());
    }

    #[test]
    fn test_complete_message_answers_with_ack_once_per_period() {
        let sched = ManualScheduler::new();
        let sar = SarConfig::default();
        let mut pool = RxPool::new(1, RX_SDU_MAX, sar);
        let r = rx(0x20);

        let out = pool.receive(segment(&r, 0, 0, 8), None, &sched);
        let id = out.ack.and_then(|a| a.slot).unwrap();
        pool.ack_sent(id, &sched);

        let out = pool.receive(segment(&r, 0, 0, 8), None, &sched);
        assert_eq!(out.result, Err(TransportError::Already));
        assert!(out.ack.is_none());

        sched.advance(sar.ack_period());
        let out = pool.receive(segment(&r, 0, 0, 8), None, &sched);
        assert_eq!(out.result, Err(TransportError::Already));
        assert_eq!(out.ack.map(|a| a.ack.block), Some(1));
    }

    #[test]
    fn test_oversized_gets_zero_ack() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, 24, SarConfig::default());
        let r = rx(0x20);
        let out = pool.receive(segment(&r, 0, 2, 12), None, &sched);
        assert!(matches!(out.result, Err(TransportError::Oversized(36))));
        assert_eq!(out.ack.map(|a| a.ack.block), Some(0));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_no_free_slot() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, RX_SDU_MAX, SarConfig::default());
        let a = rx(0x20);
        pool.receive(segment(&a, 0, 1, 12), None, &sched);

        let mut b = rx(0x40);
        b.src = 0x0003;
        let out = pool.receive(segment(&b, 0, 1, 12), None, &sched);
        assert_eq!(out.result, Err(TransportError::NoMemory));
        assert_eq!(out.ack.map(|a| a.ack.block), Some(0));
    }

    #[test]
    fn test_inconsistent_segment_rejected() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, RX_SDU_MAX, SarConfig::default());
        let r = rx(0x20);
        pool.receive(segment(&r, 0, 2, 12), None, &sched);

        let out = pool.receive(segment(&r, 1, 3, 12), None, &sched);
        assert!(matches!(out.result, Err(TransportError::InvalidPdu(_))));

        // Non-last segments must be full
        let out = pool.receive(segment(&r, 1, 2, 5), None, &sched);
        assert!(matches!(out.result, Err(TransportError::Wire(_))));
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn test_newer_seq_auth_replaces_unfinished() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, RX_SDU_MAX, SarConfig::default());
        let r = rx(0x20);
        pool.receive(segment(&r, 0, 1, 12), None, &sched);

        let mut newer = segment(&r, 0, 1, 12);
        newer.seq_auth = 0x30;
        newer.header.seq_zero = 0x30;
        let out = pool.receive(newer, None, &sched);
        assert_eq!(out.result, Ok(SegStatus::Stored));
        assert_eq!(pool.active(), 1);

        // The old message is gone for good
        let out = pool.receive(segment(&r, 1, 1, 4), None, &sched);
        assert!(matches!(out.result, Err(TransportError::InvalidPdu(_))));
    }

    #[test]
    fn test_newer_seq_auth_reports_every_abandoned() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(3, RX_SDU_MAX, SarConfig::default());
        let mut r = rx(0x20);
        r.friend_match = true;
        pool.receive(segment(&r, 0, 1, 12), None, &sched);

        let mut other = rx(0x24);
        other.src = 0x0003;
        other.friend_match = true;
        let mut seg = segment(&other, 0, 1, 12);
        seg.seq_auth = 0x24;
        pool.receive(seg, None, &sched);
        assert_eq!(pool.active(), 2);

        // Two unfinished messages from the same pair
        pool.slots[1].src = 0x0002;

        let mut newer = segment(&r, 0, 1, 12);
        newer.seq_auth = 0x30;
        newer.header.seq_zero = 0x30;
        let out = pool.receive(newer, None, &sched);
        assert_eq!(out.result, Ok(SegStatus::Stored));
        let mut dropped: Vec<u64> = out.abandoned.iter().map(|a| a.seq_auth).collect();
        dropped.sort_unstable();
        assert_eq!(dropped, vec![0x20, 0x24]);
        assert!(out.abandoned.iter().all(|a| a.src == 0x0002 && a.dst == 0x0001));
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn test_ack_timer_after_completion_is_ignored() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, RX_SDU_MAX, SarConfig::default());
        let r = rx(0x21);
        pool.receive(segment(&r, 0, 1, 12), None, &sched);
        let Some(TimerEvent::SegRxAck(id)) = sched.fire_next() else {
            panic!("expected ack timer");
        };

        let out = pool.receive(segment(&r, 1, 1, 4), None, &sched);
        assert!(matches!(out.result, Ok(SegStatus::Complete { .. })));
        assert_eq!(out.ack.map(|a| a.ack.block), Some(0b11));

        // Same generation, but the completion already answered
        assert!(pool.ack_timer_fired(id).is_none());
    }

    #[test]
    fn test_discard_timer() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, RX_SDU_MAX, SarConfig::default());
        let r = rx(0x20);
        pool.receive(segment(&r, 0, 1, 12), None, &sched);

        // Ack timer first, then discard
        let Some(TimerEvent::SegRxAck(id)) = sched.fire_next() else {
            panic!("expected ack timer");
        };
        let ack = pool.ack_timer_fired(id).unwrap();
        assert_eq!(ack.ack.block, 0b01);
        assert_eq!(ack.dst, 0x0002);

        let Some(TimerEvent::SegRxDiscard(id)) = sched.fire_next() else {
            panic!("expected discard timer");
        };
        assert!(pool.discard_fired(id, &sched).is_none());
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_group_destination_not_acked() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(1, RX_SDU_MAX, SarConfig::default());
        let mut r = rx(0x20);
        r.dst = 0xc001;
        pool.receive(segment(&r, 0, 1, 12), None, &sched);
        assert_eq!(sched.pending().len(), 1);
    }

    #[test]
    fn test_reset_src_unicast_only() {
        let sched = ManualScheduler::new();
        let mut pool = RxPool::new(2, RX_SDU_MAX, SarConfig::default());
        let r = rx(0x20);
        pool.receive(segment(&r, 0, 1, 12), None, &sched);
        pool.reset_src(0xc000, &sched);
        assert_eq!(pool.active(), 1);
        pool.reset_src(0x0002, &sched);
        assert_eq!(pool.active(), 0);
        assert!(sched.pending().is_empty());
    }
}
