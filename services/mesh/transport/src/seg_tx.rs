//! Segmented transmission.
//!
//! Each outstanding segmented message occupies one [`TxPool`] slot. The pool
//! only moves state; every network send it wants is returned as a
//! [`TxAction`] for the caller to execute outside the pool lock, and the
//! outcome is fed back through [`TxPool::dispatched`],
//! [`TxPool::segment_sent`] or [`TxPool::resent`].
//!
//! Timeline of a slot:
//!
//! ```text
//! start ──► seg 0 ──► (seg interval) ──► seg 1 … seg N ──► retransmit timer
//!                                                              │
//!            ack: all acked ──► complete(Ok)                   ▼
//!            ack: zero      ──► complete(Cancelled)      resend first unacked,
//!            budget gone    ──► complete(Timeout)        pace the rest
//! ```

use crate::sar::SarConfig;
use crate::upper::SendCallback;
use crate::TransportError;
use bytes::Bytes;
use mesh_net::{NetError, NetTx, Scheduler, SendStatus, SlotId, SlotTimer, TimerEvent};
use mesh_subnet::{Credential, SendTag};
use mesh_wire::address::{self, UNASSIGNED};
use mesh_wire::lower::SEQ_ZERO_MASK;
use mesh_wire::SegmentAck;
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Default number of concurrent segmented messages
pub const DEFAULT_TX_SLOTS: usize = 4;

/// Parameters of a segmented message about to be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentedTx {
    /// Network parameters; `ttl` already resolved
    pub tx: NetTx,
    /// SeqAuth of the message
    pub seq_auth: u64,
    /// Subnet was in key refresh when the message was built
    pub new_key: bool,
}

/// Network work requested by the pool
pub enum TxAction {
    /// First transmission of a segment
    Send {
        /// Owning slot
        slot: SlotId,
        /// Segment offset
        seg_o: u8,
        /// Network parameters
        tx: NetTx,
        /// Segmented lower transport PDU
        lower: Bytes,
    },
    /// Retransmission of an encoded segment with a fresh sequence number
    Resend {
        /// Owning slot
        slot: SlotId,
        /// Segment offset
        seg_o: u8,
        /// Subnet
        net_idx: u16,
        /// Destination
        dst: u16,
        /// Encoded network PDU of the previous transmission
        pdu: Bytes,
        /// Key generation the message was built with
        new_key: bool,
        /// Credential used so far
        credential: Credential,
        /// Send tags
        tag: SendTag,
    },
    /// The message finished; the slot is already free
    Complete(TxCompletion),
}

/// Result of a finished segmented message
pub struct TxCompletion {
    /// Destination of the message
    pub dst: u16,
    /// Outcome
    pub result: Result<(), TransportError>,
    callback: Option<SendCallback>,
}

impl TxCompletion {
    /// Invoke the completion callback, if any
    pub fn notify(self) {
        if let Some(callback) = self.callback {
            callback(self.result);
        }
    }
}

/// Actions produced by one transition
pub type TxActions = SmallVec<[TxAction; 2]>;

struct TxSegment {
    lower: Bytes,
    encoded: Option<Bytes>,
    busy: bool,
}

#[derive(Default)]
struct TxSlot {
    generation: u64,
    msg: Option<SegmentedTx>,
    seg_n: u8,
    segs: SmallVec<[Option<TxSegment>; 4]>,
    nack_count: u8,
    last_seg_n: u8,
    lsn_updated: bool,
    resend: bool,
    cred_fixed: bool,
    surc: u8,
    surwpc: u8,
    smrc: u8,
    seg_timer: SlotTimer,
    rtx_timer: SlotTimer,
    callback: Option<SendCallback>,
}

impl TxSlot {
    fn in_use(&self) -> bool {
        self.msg.is_some()
    }

    fn dst(&self) -> u16 {
        self.msg.map(|m| m.tx.dst).unwrap_or(UNASSIGNED)
    }

    fn unacked(&self, seg_o: usize) -> bool {
        matches!(self.segs.get(seg_o), Some(Some(_)))
    }

    /// First unacked segment at or after `from`
    fn next_unacked(&self, from: u8) -> Option<u8> {
        (from..=self.seg_n).find(|&i| self.unacked(i as usize))
    }
}

/// Pool of segmented transmission slots
pub struct TxPool {
    sar: SarConfig,
    slots: Vec<TxSlot>,
}

impl TxPool {
    /// Create a pool with `count` slots
    pub fn new(count: usize, sar: SarConfig) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, TxSlot::default);
        Self { sar, slots }
    }

    /// SAR configuration in use
    pub fn sar(&self) -> &SarConfig {
        &self.sar
    }

    /// Whether any segmented message is outstanding
    pub fn in_progress(&self) -> bool {
        self.slots.iter().any(|s| s.nack_count > 0)
    }

    /// Check that a message from `src` to `dst` can be accepted
    pub fn check_admission(&self, src: u16, dst: u16) -> Result<(), TransportError> {
        let mut free = false;
        for slot in self.slots.iter() {
            match slot.msg {
                Some(m) if m.tx.src == src && m.tx.dst == dst => {
                    warn!("Busy sending to 0x{:04x}", dst);
                    return Err(TransportError::Busy);
                }
                Some(_) => {}
                None => free = true,
            }
        }
        if !free {
            warn!("No multi-segment message contexts available");
            return Err(TransportError::Busy);
        }
        Ok(())
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut TxSlot> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation && s.in_use())
    }

    fn id(&self, index: usize) -> SlotId {
        SlotId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Take a slot for a message and emit its first segment.
    ///
    /// `segments[i]` is `None` when a Friend queue already took segment `i`.
    pub fn start(
        &mut self,
        msg: SegmentedTx,
        segments: Vec<Option<Bytes>>,
        callback: Option<SendCallback>,
    ) -> Result<TxActions, TransportError> {
        self.check_admission(msg.tx.src, msg.tx.dst)?;
        if segments.is_empty() || segments.len() > mesh_wire::MAX_SEGMENTS {
            return Err(TransportError::Oversized(segments.len()));
        }

        let mut actions = TxActions::new();
        let nack_count = segments.iter().filter(|s| s.is_some()).count() as u8;
        if nack_count == 0 {
            debug!("Every segment to 0x{:04x} went to the friend queue", msg.tx.dst);
            actions.push(TxAction::Complete(TxCompletion {
                dst: msg.tx.dst,
                result: Ok(()),
                callback,
            }));
            return Ok(actions);
        }

        let index = self
            .slots
            .iter()
            .position(|s| !s.in_use())
            .ok_or(TransportError::Busy)?;
        let unicast = address::is_unicast(msg.tx.dst);
        let sar = self.sar;
        let slot = &mut self.slots[index];
        slot.msg = Some(msg);
        slot.seg_n = (segments.len() - 1) as u8;
        slot.segs = segments
            .into_iter()
            .map(|s| {
                s.map(|lower| TxSegment {
                    lower,
                    encoded: None,
                    busy: false,
                })
            })
            .collect();
        slot.nack_count = nack_count;
        slot.resend = false;
        slot.lsn_updated = false;
        slot.cred_fixed = false;
        if unicast {
            slot.surc = sar.unicast_retrans_count;
            slot.surwpc = sar.unicast_retrans_without_progress_count;
        } else {
            slot.smrc = sar.multicast_retrans_count;
        }
        slot.callback = callback;

        debug!(
            "Segmented send src 0x{:04x} dst 0x{:04x} seq_zero 0x{:04x} seg_n {}",
            msg.tx.src,
            msg.tx.dst,
            msg.seq_auth as u16 & SEQ_ZERO_MASK,
            slot.seg_n
        );

        let first = slot.next_unacked(0).unwrap_or(0);
        slot.last_seg_n = first;
        let id = self.id(index);
        if let Some(action) = self.take_send(id, first) {
            actions.push(action);
        }
        Ok(actions)
    }

    /// Mark a segment busy and build the send for it
    fn take_send(&mut self, id: SlotId, seg_o: u8) -> Option<TxAction> {
        let slot = self.slot_mut(id)?;
        let msg = slot.msg?;
        let resend = slot.resend;
        let seg = slot.segs.get_mut(seg_o as usize)?.as_mut()?;
        if seg.busy {
            debug!("Skipping busy segment {}", seg_o);
            return None;
        }
        seg.busy = true;

        match (&seg.encoded, resend) {
            (Some(pdu), true) => Some(TxAction::Resend {
                slot: id,
                seg_o,
                net_idx: msg.tx.net_idx,
                dst: msg.tx.dst,
                pdu: pdu.clone(),
                new_key: msg.new_key,
                credential: msg.tx.credential,
                tag: msg.tx.tag,
            }),
            _ => Some(TxAction::Send {
                slot: id,
                seg_o,
                tx: msg.tx,
                lower: seg.lower.clone(),
            }),
        }
    }

    /// Finish a message and free its slot
    fn finish(&mut self, index: usize, result: Result<(), TransportError>, sched: &dyn Scheduler) -> TxAction {
        let slot = &mut self.slots[index];
        let dst = slot.dst();
        let callback = slot.callback.take();
        self.reset_slot(index, sched);
        TxAction::Complete(TxCompletion {
            dst,
            result,
            callback,
        })
    }

    fn reset_slot(&mut self, index: usize, sched: &dyn Scheduler) {
        let slot = &mut self.slots[index];
        slot.seg_timer.cancel(sched);
        slot.rtx_timer.cancel(sched);
        let generation = slot.generation.wrapping_add(1);
        *slot = TxSlot {
            generation,
            ..TxSlot::default()
        };
    }

    /// Arm the timer for whatever comes after the segment just sent
    fn prepare_next(&mut self, id: SlotId, sched: &dyn Scheduler) {
        let seg_interval = self.sar.seg_interval();
        let sar = self.sar;
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        if slot.nack_count == 0 {
            return;
        }

        if slot.last_seg_n < slot.seg_n && slot.next_unacked(slot.last_seg_n + 1).is_some() {
            slot.seg_timer
                .start(sched, seg_interval, TimerEvent::SegTxInterval(id));
            return;
        }

        // Round exhausted; retransmissions restart from the first unacked
        slot.resend = true;
        slot.last_seg_n = slot.next_unacked(0).unwrap_or(0);
        slot.lsn_updated = true;
        let (dst, ttl) = slot.msg.map(|m| (m.tx.dst, m.tx.ttl)).unwrap_or_default();
        slot.rtx_timer.start(
            sched,
            sar.retrans_interval(dst, ttl),
            TimerEvent::SegTxRetransmit(id),
        );
    }

    /// Outcome of a first transmission handed to the network layer
    pub fn dispatched(
        &mut self,
        id: SlotId,
        seg_o: u8,
        result: Result<(Bytes, Credential, SendStatus), NetError>,
        sched: &dyn Scheduler,
    ) -> TxActions {
        let mut actions = TxActions::new();
        let Some(slot) = self.slot_mut(id) else {
            return actions;
        };

        let (pdu, credential, status) = match result {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Sending segment failed: {}", e);
                actions.push(self.finish(id.index, Err(TransportError::Io(e.to_string())), sched));
                return actions;
            }
        };

        if let Some(msg) = slot.msg.as_mut() {
            if !slot.cred_fixed {
                msg.tx.credential = credential;
                slot.cred_fixed = true;
            } else if msg.tx.credential != credential {
                warn!("Message credential changed to {} mid-send", credential);
                actions.push(self.finish(
                    id.index,
                    Err(TransportError::Io("credential changed".into())),
                    sched,
                ));
                return actions;
            }
        }

        if let Some(Some(seg)) = slot.segs.get_mut(seg_o as usize) {
            seg.encoded = Some(pdu);
            if status == SendStatus::Delivered {
                seg.busy = false;
            }
        }

        if status == SendStatus::Delivered {
            self.prepare_next(id, sched);
        }
        actions
    }

    /// Outcome of a retransmission handed to the network layer
    pub fn resent(
        &mut self,
        id: SlotId,
        seg_o: u8,
        result: Result<(Bytes, Credential), NetError>,
        sched: &dyn Scheduler,
    ) -> TxActions {
        let mut actions = TxActions::new();
        let Some(slot) = self.slot_mut(id) else {
            return actions;
        };

        match result {
            Ok((pdu, credential)) => {
                if let Some(msg) = slot.msg.as_mut() {
                    msg.tx.credential = credential;
                }
                if let Some(Some(seg)) = slot.segs.get_mut(seg_o as usize) {
                    seg.encoded = Some(pdu);
                }
            }
            Err(e) => {
                warn!("Resending segment failed: {}", e);
                actions.push(self.finish(id.index, Err(TransportError::Io(e.to_string())), sched));
            }
        }
        actions
    }

    /// The bearer finished with a segment
    pub fn segment_sent(
        &mut self,
        id: SlotId,
        seg_o: u8,
        result: Result<(), NetError>,
        sched: &dyn Scheduler,
    ) -> TxActions {
        let mut actions = TxActions::new();
        let Some(slot) = self.slot_mut(id) else {
            return actions;
        };
        if let Some(Some(seg)) = slot.segs.get_mut(seg_o as usize) {
            seg.busy = false;
        }

        if let Err(e) = result {
            warn!("Segment {} not sent: {}", seg_o, e);
            actions.push(self.finish(id.index, Err(TransportError::Io(e.to_string())), sched));
            return actions;
        }

        self.prepare_next(id, sched);
        actions
    }

    /// Segment interval timer fired
    pub fn send_next(&mut self, id: SlotId) -> TxActions {
        let mut actions = TxActions::new();
        let Some(slot) = self.slot_mut(id) else {
            return actions;
        };
        slot.seg_timer.fired();
        if slot.nack_count == 0 {
            return actions;
        }

        let from = if slot.lsn_updated {
            slot.last_seg_n
        } else {
            slot.last_seg_n.saturating_add(1)
        };
        slot.lsn_updated = false;
        if from > slot.seg_n {
            return actions;
        }
        let Some(seg_o) = slot.next_unacked(from) else {
            return actions;
        };
        slot.last_seg_n = seg_o;

        if let Some(action) = self.take_send(id, seg_o) {
            actions.push(action);
        }
        actions
    }

    /// Retransmission timer fired
    pub fn retransmit(&mut self, id: SlotId, sched: &dyn Scheduler) -> TxActions {
        let mut actions = TxActions::new();
        let Some(slot) = self.slot_mut(id) else {
            return actions;
        };
        slot.rtx_timer.fired();
        if slot.nack_count == 0 {
            return actions;
        }

        if address::is_unicast(slot.dst()) {
            if slot.surc == 0 || slot.surwpc == 0 {
                warn!("Ran out of retransmit attempts to 0x{:04x}", slot.dst());
                actions.push(self.finish(id.index, Err(TransportError::Timeout), sched));
                return actions;
            }
            slot.surc -= 1;
            slot.surwpc -= 1;
        } else {
            if slot.smrc == 0 {
                debug!("Multicast retransmissions to 0x{:04x} done", slot.dst());
                actions.push(self.finish(id.index, Ok(()), sched));
                return actions;
            }
            slot.smrc -= 1;
        }

        if !slot.resend {
            return actions;
        }

        let Some(seg_o) = slot.next_unacked(slot.last_seg_n) else {
            return actions;
        };
        slot.last_seg_n = seg_o;
        slot.lsn_updated = false;
        if let Some(action) = self.take_send(id, seg_o) {
            actions.push(action);
        }
        actions
    }

    /// Process a Segment Acknowledgment from `src` on `net_idx`
    pub fn ack(
        &mut self,
        net_idx: u16,
        src: u16,
        ack: &SegmentAck,
        sched: &dyn Scheduler,
    ) -> Result<TxActions, TransportError> {
        let mut actions = TxActions::new();
        let sar = self.sar;

        let index = self
            .slots
            .iter_mut()
            .position(|slot| {
                let Some(msg) = slot.msg.as_mut() else {
                    return false;
                };
                if msg.seq_auth as u16 & SEQ_ZERO_MASK != ack.seq_zero || msg.tx.net_idx != net_idx {
                    return false;
                }
                if msg.tx.dst == src {
                    return true;
                }
                // First ack of a message may come from the Friend of the destination
                if ack.obo && slot.nack_count == slot.seg_n + 1 {
                    msg.tx.dst = src;
                    return true;
                }
                false
            })
            .ok_or_else(|| {
                debug!("No matching TX context for ack seq_zero 0x{:04x}", ack.seq_zero);
                TransportError::NotFound
            })?;

        let id = self.id(index);
        let slot = &mut self.slots[index];
        if !address::is_unicast(slot.dst()) {
            warn!("Received ack for group seg");
            return Err(TransportError::InvalidPdu("ack for group message"));
        }

        if ack.block == 0 {
            warn!("SDU canceled by 0x{:04x}", src);
            actions.push(self.finish(index, Err(TransportError::Cancelled), sched));
            return Ok(actions);
        }

        if 31 - ack.block.leading_zeros() > slot.seg_n as u32 {
            warn!("Too large segment number in ack");
            return Err(TransportError::InvalidPdu("ack beyond last segment"));
        }

        slot.rtx_timer.cancel(sched);

        let mut newly_acked = false;
        let mut block = ack.block;
        while block != 0 {
            let bit = block.trailing_zeros() as usize;
            block &= block - 1;
            if let Some(seg) = slot.segs.get_mut(bit) {
                if seg.take().is_some() {
                    debug!("seg {}/{} acked", bit, slot.seg_n);
                    slot.nack_count -= 1;
                    newly_acked = true;
                }
            }
        }

        if slot.nack_count == 0 {
            actions.push(self.finish(index, Ok(()), sched));
            return Ok(actions);
        }

        if newly_acked {
            slot.surwpc = sar.unicast_retrans_without_progress_count;
        }

        if slot.surc == 0 || slot.surwpc == 0 {
            actions.push(self.finish(index, Err(TransportError::Timeout), sched));
            return Ok(actions);
        }

        if slot.resend {
            slot.last_seg_n = slot.next_unacked(0).unwrap_or(0);
            slot.lsn_updated = true;
        }

        let (dst, ttl) = slot.msg.map(|m| (m.tx.dst, m.tx.ttl)).unwrap_or_default();
        slot.rtx_timer.start(
            sched,
            sar.retrans_interval(dst, ttl),
            TimerEvent::SegTxRetransmit(id),
        );
        Ok(actions)
    }

    /// SeqAuth of an outstanding message, for acks a Friend relays
    pub fn seq_auth_of(&self, seq_zero: u16, dst: u16) -> Option<u64> {
        self.slots
            .iter()
            .filter_map(|s| s.msg)
            .find(|m| m.seq_auth as u16 & SEQ_ZERO_MASK == seq_zero && m.tx.dst == dst)
            .map(|m| m.seq_auth)
    }

    /// Abandon every outstanding message without notifying its sender
    pub fn reset(&mut self, sched: &dyn Scheduler) -> usize {
        let mut count = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].in_use() {
                self.reset_slot(index, sched);
                count += 1;
            }
        }
        count
    }

    /// Abandon messages to one unicast destination without notifying their sender
    pub fn reset_dst(&mut self, dst: u16, sched: &dyn Scheduler) -> usize {
        if !address::is_unicast(dst) {
            return 0;
        }
        let mut count = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].in_use() && self.slots[index].dst() == dst {
                self.reset_slot(index, sched);
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_net::ManualScheduler;
    use std::sync::Arc;
    use parking_lot::Mutex;

    fn msg(dst: u16) -> SegmentedTx {
        SegmentedTx {
            tx: NetTx {
                net_idx: 0,
                src: 0x0001,
                dst,
                ttl: 7,
                ctl: false,
                credential: Credential::Flooding,
                tag: SendTag::SEGMENTED,
            },
            seq_auth: 0x10,
            new_key: false,
        }
    }

    fn segments(n: usize) -> Vec<Option<Bytes>> {
        (0..n).map(|i| Some(Bytes::from(vec![i as u8; 16]))).collect()
    }

    fn first_send(actions: &TxActions) -> (SlotId, u8) {
        match actions.first() {
            Some(TxAction::Send { slot, seg_o, .. }) => (*slot, *seg_o),
            _ => panic!("expected a send"),
        }
    }

    fn completion(actions: TxActions) -> Result<(), TransportError> {
        for action in actions {
            if let TxAction::Complete(c) = action {
                return c.result;
            }
        }
        panic!("expected a completion");
    }

    fn dispatch_ok(pool: &mut TxPool, id: SlotId, seg_o: u8, sched: &ManualScheduler) {
        let actions = pool.dispatched(
            id,
            seg_o,
            Ok((Bytes::from_static(b"net"), Credential::Flooding, SendStatus::Queued)),
            sched,
        );
        assert!(actions.is_empty());
        let actions = pool.segment_sent(id, seg_o, Ok(()), sched);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_admission_busy_same_pair() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(2, SarConfig::default());
        pool.start(msg(0x0002), segments(2), None).unwrap();
        assert!(pool.in_progress());
        assert_eq!(pool.check_admission(0x0001, 0x0002), Err(TransportError::Busy));
        assert!(pool.check_admission(0x0001, 0x0003).is_ok());

        pool.start(msg(0x0003), segments(2), None).unwrap();
        assert_eq!(pool.check_admission(0x0001, 0x0004), Err(TransportError::Busy));
    }

    #[test]
    fn test_first_round_pacing() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(1, SarConfig::default());
        let actions = pool.start(msg(0x0002), segments(3), None).unwrap();
        let (id, seg_o) = first_send(&actions);
        assert_eq!(seg_o, 0);

        dispatch_ok(&mut pool, id, 0, &sched);
        assert_eq!(sched.pending(), vec![TimerEvent::SegTxInterval(id)]);

        sched.fire_next();
        let actions = pool.send_next(id);
        assert_eq!(first_send(&actions).1, 1);
        dispatch_ok(&mut pool, id, 1, &sched);

        sched.fire_next();
        let actions = pool.send_next(id);
        assert_eq!(first_send(&actions).1, 2);
        dispatch_ok(&mut pool, id, 2, &sched);

        // Round done, waiting for acks
        assert_eq!(sched.pending(), vec![TimerEvent::SegTxRetransmit(id)]);
    }

    #[test]
    fn test_busy_segment_skipped() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(1, SarConfig::default());
        let actions = pool.start(msg(0x0002), segments(1), None).unwrap();
        let (id, _) = first_send(&actions);
        dispatch_ok(&mut pool, id, 0, &sched);

        sched.fire_next();
        let actions = pool.retransmit(id, &sched);
        let Some(TxAction::Resend { seg_o, .. }) = actions.first() else {
            panic!("expected a resend");
        };
        assert_eq!(*seg_o, 0);

        // Still with the bearer: nothing to do this cycle
        let actions = pool.retransmit(id, &sched);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_ack_completes_and_notifies() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(1, SarConfig::default());
        let result = Arc::new(Mutex::new(None));
        let seen = result.clone();
        let callback: SendCallback = Box::new(move |r| *seen.lock() = Some(r));

        let actions = pool
            .start(msg(0x0002), segments(2), Some(callback))
            .unwrap();
        let (id, _) = first_send(&actions);

        let ack = SegmentAck {
            obo: false,
            seq_zero: 0x10,
            block: 0b11,
        };
        let actions = pool.ack(0, 0x0002, &ack, &sched).unwrap();
        for action in actions {
            if let TxAction::Complete(c) = action {
                c.notify();
            }
        }
        assert_eq!(*result.lock(), Some(Ok(())));
        assert!(!pool.in_progress());

        // Late bearer report for a freed slot is ignored
        assert!(pool.segment_sent(id, 0, Ok(()), &sched).is_empty());
    }

    #[test]
    fn test_zero_ack_cancels() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(1, SarConfig::default());
        pool.start(msg(0x0002), segments(2), None).unwrap();
        let ack = SegmentAck {
            obo: false,
            seq_zero: 0x10,
            block: 0,
        };
        let actions = pool.ack(0, 0x0002, &ack, &sched).unwrap();
        assert_eq!(completion(actions), Err(TransportError::Cancelled));
    }

    #[test]
    fn test_ack_beyond_seg_n_rejected() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(1, SarConfig::default());
        pool.start(msg(0x0002), segments(2), None).unwrap();
        let ack = SegmentAck {
            obo: false,
            seq_zero: 0x10,
            block: 0b100,
        };
        assert!(matches!(
            pool.ack(0, 0x0002, &ack, &sched),
            Err(TransportError::InvalidPdu(_))
        ));
        assert!(pool.in_progress());
    }

    #[test]
    fn test_obo_ack_corrects_destination() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(1, SarConfig::default());
        pool.start(msg(0x0002), segments(2), None).unwrap();
        let ack = SegmentAck {
            obo: true,
            seq_zero: 0x10,
            block: 0b01,
        };
        pool.ack(0, 0x0009, &ack, &sched).unwrap();
        assert_eq!(pool.seq_auth_of(0x10, 0x0009), Some(0x10));
    }

    #[test]
    fn test_unicast_timeout() {
        let sched = ManualScheduler::new();
        let sar = SarConfig::default();
        let mut pool = TxPool::new(1, sar);
        let actions = pool.start(msg(0x0002), segments(1), None).unwrap();
        let (id, _) = first_send(&actions);
        dispatch_ok(&mut pool, id, 0, &sched);

        let rounds = std::cmp::min(
            sar.unicast_retrans_count,
            sar.unicast_retrans_without_progress_count,
        );
        for _ in 0..rounds {
            assert_eq!(sched.fire_next(), Some(TimerEvent::SegTxRetransmit(id)));
            let actions = pool.retransmit(id, &sched);
            assert!(matches!(actions.first(), Some(TxAction::Resend { .. })));
            pool.resent(id, 0, Ok((Bytes::from_static(b"net2"), Credential::Flooding)), &sched);
            pool.segment_sent(id, 0, Ok(()), &sched);
        }

        assert_eq!(sched.fire_next(), Some(TimerEvent::SegTxRetransmit(id)));
        let actions = pool.retransmit(id, &sched);
        assert_eq!(completion(actions), Err(TransportError::Timeout));
    }

    #[test]
    fn test_reset_dst_drops_slot() {
        let sched = ManualScheduler::new();
        let mut pool = TxPool::new(2, SarConfig::default());
        pool.start(msg(0x0002), segments(2), None).unwrap();
        pool.start(msg(0x0003), segments(2), None).unwrap();
        assert_eq!(pool.reset_dst(0xc000, &sched), 0);
        assert_eq!(pool.reset_dst(0x0002, &sched), 1);
        assert!(pool.check_admission(0x0001, 0x0002).is_ok());
        assert_eq!(pool.reset(&sched), 1);
        assert!(!pool.in_progress());
    }
}
