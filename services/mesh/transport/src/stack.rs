//! The per-node transport stack.
//!
//! [`MeshStack`] owns the [`Network`] context and both segmentation pools,
//! and connects them to the upper layers and the Friend queue. Every entry
//! point is synchronous: PDUs from bearers ([`MeshStack::net_recv`]), timer
//! events ([`MeshStack::on_timer`]) and bearer completions
//! ([`MeshStack::on_sent`]) are fed in by the driver.
//!
//! Pool transitions run under the pool locks and return the network work to
//! do. That work, the crypto calls and every user callback run after the
//! lock is released.

use crate::control::{self, CtlRoute};
use crate::sar::SarConfig;
use crate::seg_rx::{
    Abandoned, AckRequest, RplReservation, RxPool, SegStatus, SegmentIn, DEFAULT_RX_SLOTS,
    RX_SDU_MAX,
};
use crate::seg_tx::{SegmentedTx, TxAction, TxActions, TxCompletion, TxPool, DEFAULT_TX_SLOTS};
use crate::upper::{FriendPduKind, FriendQueue, SendCallback, UpperTransport};
use crate::TransportError;
use bytes::{BufMut, Bytes, BytesMut};
use mesh_net::{
    BeaconOutcome, NetError, NetIf, NetRx, NetTx, Network, SendStatus, SendToken, SlotId,
    TimerEvent, TTL_DEFAULT,
};
use mesh_storage::RplCheck;
use mesh_subnet::{AppNonce, Credential, IvTick, IvTransition, Key, SendTag, SubnetError, KEY_DEV};
use mesh_wire::address::{self, UNASSIGNED};
use mesh_wire::lower::{self, SegmentHeader, APP_MIC_LONG, APP_MIC_SHORT};
use mesh_wire::{build_segment, segment::segment_count, CtlOp, Features, SegmentAck, Segmenter};
use mesh_wire::{NET_HDR_LEN, SDU_UNSEG_MAX};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// SAR Transmitter and Receiver states
    pub sar: SarConfig,
    /// Concurrent outgoing segmented messages
    pub tx_slots: usize,
    /// Concurrent reassemblies
    pub rx_slots: usize,
    /// Largest reassembled upper transport PDU
    pub rx_sdu_max: usize,
    /// Device key of this node
    pub dev_key: Key,
    /// Heartbeat subscription destination, or unassigned
    pub heartbeat_sub_dst: u16,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            sar: SarConfig::default(),
            tx_slots: DEFAULT_TX_SLOTS,
            rx_slots: DEFAULT_RX_SLOTS,
            rx_sdu_max: RX_SDU_MAX,
            dev_key: [0; 16],
            heartbeat_sub_dst: UNASSIGNED,
        }
    }
}

/// Parameters of an access message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgCtx {
    /// NetKey index
    pub net_idx: u16,
    /// AppKey index, or [`KEY_DEV`]
    pub app_idx: u16,
    /// Source element
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// TTL, or [`TTL_DEFAULT`]
    pub ttl: u8,
    /// Requested network credential
    pub credential: Credential,
    /// Send tags; [`SendTag::SEGMENTED`] forces segmentation
    pub tag: SendTag,
    /// Use a 64-bit TransMIC when the message is segmented
    pub szmic_long: bool,
}

impl MsgCtx {
    /// Context with default TTL, flooding credentials and no tags
    pub fn new(net_idx: u16, app_idx: u16, src: u16, dst: u16) -> Self {
        Self {
            net_idx,
            app_idx,
            src,
            dst,
            ttl: TTL_DEFAULT,
            credential: Credential::Flooding,
            tag: SendTag::empty(),
            szmic_long: false,
        }
    }
}

/// What a bearer completion belongs to
enum TokenUse {
    Segment { slot: SlotId, seg_o: u8 },
    Ack { slot: SlotId },
    Message(Option<SendCallback>),
}

/// Key material selected for an access message
struct UpperKey {
    key: Key,
    aid: u8,
    dev_key: bool,
    new_key: bool,
}

/// Network layer plus lower transport of one node
pub struct MeshStack {
    net: Network,
    upper: Arc<dyn UpperTransport>,
    friend: Arc<dyn FriendQueue>,
    dev_key: Key,
    hb_sub_dst: AtomicU16,
    tx: Mutex<TxPool>,
    rx: Mutex<RxPool>,
    tokens: Mutex<HashMap<SendToken, TokenUse>>,
    next_token: AtomicU64,
    // Serialises a sequence number peek with the send that consumes it
    seq_lock: Mutex<()>,
    draining: AtomicBool,
}

impl MeshStack {
    /// Build the stack around a network context
    pub fn new(
        config: StackConfig,
        net: Network,
        upper: Arc<dyn UpperTransport>,
        friend: Arc<dyn FriendQueue>,
    ) -> Self {
        info!(
            "Transport stack: {} TX slots, {} RX slots, RX SDU max {}",
            config.tx_slots, config.rx_slots, config.rx_sdu_max
        );
        Self {
            net,
            upper,
            friend,
            dev_key: config.dev_key,
            hb_sub_dst: AtomicU16::new(config.heartbeat_sub_dst),
            tx: Mutex::new(TxPool::new(config.tx_slots, config.sar)),
            rx: Mutex::new(RxPool::new(config.rx_slots, config.rx_sdu_max, config.sar)),
            tokens: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            seq_lock: Mutex::new(()),
            draining: AtomicBool::new(false),
        }
    }

    /// Network layer context
    pub fn net(&self) -> &Network {
        &self.net
    }

    /// Set the Heartbeat subscription destination
    pub fn set_heartbeat_sub(&self, dst: u16) {
        self.hb_sub_dst.store(dst, Ordering::Relaxed);
    }

    /// Whether any segmented send is outstanding
    pub fn tx_in_progress(&self) -> bool {
        self.tx.lock().in_progress()
    }

    /// Number of reassemblies in progress
    pub fn rx_active(&self) -> usize {
        self.rx.lock().active()
    }

    fn token(&self, use_: TokenUse) -> SendToken {
        let token = SendToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.tokens.lock().insert(token, use_);
        token
    }

    fn forget(&self, token: Option<SendToken>) -> Option<TokenUse> {
        token.and_then(|t| self.tokens.lock().remove(&t))
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Send an access payload.
    ///
    /// Payloads longer than [`SDU_UNSEG_MAX`] are segmented. `callback`
    /// reports the final outcome; errors returned here mean nothing was
    /// sent and the callback is dropped.
    pub fn send(
        &self,
        ctx: &MsgCtx,
        payload: &[u8],
        callback: Option<SendCallback>,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::InvalidPdu("empty payload"));
        }

        let mut tag = ctx.tag;
        if payload.len() > SDU_UNSEG_MAX {
            tag |= SendTag::SEGMENTED;
        }
        let segmented = tag.contains(SendTag::SEGMENTED);
        let aszmic = segmented && ctx.szmic_long;

        let key = self.upper_key(ctx.net_idx, ctx.app_idx)?;
        debug!(
            "net_idx 0x{:04x} app_idx 0x{:04x} src 0x{:04x} dst 0x{:04x} len {}",
            ctx.net_idx,
            ctx.app_idx,
            ctx.src,
            ctx.dst,
            payload.len()
        );

        let mut tx = NetTx {
            net_idx: ctx.net_idx,
            src: ctx.src,
            dst: ctx.dst,
            ttl: ctx.ttl,
            ctl: false,
            credential: ctx.credential,
            tag,
        };
        if tx.ttl == TTL_DEFAULT {
            tx.ttl = self.net.config().default_ttl;
        }

        let result = if segmented {
            let actions = {
                let _seq = self.seq_lock.lock();
                let seq = self.net.seq();
                let iv_index = self.net.ivi_tx();
                let sdu = self.encrypt(&key, aszmic, seq, iv_index, &tx, payload)?;
                let hdr = lower::seg_hdr(!key.dev_key, key.aid);
                let msg = SegmentedTx {
                    tx,
                    seq_auth: lower::seq_auth(iv_index, seq),
                    new_key: key.new_key,
                };
                let actions = self.send_seg(msg, hdr, aszmic, sdu, callback)?;
                self.claim_seq_auth(actions)
            };
            self.run_tx(actions);
            Ok(())
        } else {
            let finished = {
                let _seq = self.seq_lock.lock();
                let sdu =
                    self.encrypt(&key, false, self.net.seq(), self.net.ivi_tx(), &tx, payload)?;
                let mut lower = BytesMut::with_capacity(1 + sdu.len());
                lower.put_u8(lower::unseg_hdr(!key.dev_key, key.aid));
                lower.extend_from_slice(&sdu);
                self.send_unseg(tx, lower.freeze(), callback)
            };
            finished.map(Self::complete_now)
        };

        self.drain_local();
        result
    }

    /// Send a transport control message
    pub fn send_ctl(
        &self,
        mut tx: NetTx,
        opcode: u8,
        params: &[u8],
        callback: Option<SendCallback>,
    ) -> Result<(), TransportError> {
        tx.ctl = true;
        if tx.ttl == TTL_DEFAULT {
            tx.ttl = self.net.config().default_ttl;
        }
        if params.len() > SDU_UNSEG_MAX {
            tx.tag |= SendTag::SEGMENTED;
        }
        debug!(
            "src 0x{:04x} dst 0x{:04x} ttl 0x{:02x} ctl 0x{:02x} len {}",
            tx.src,
            tx.dst,
            tx.ttl,
            opcode,
            params.len()
        );

        let result = if tx.tag.contains(SendTag::SEGMENTED) {
            let new_key = self
                .net
                .subnets()
                .get(tx.net_idx)
                .map(|s| s.kr_flag)
                .ok_or(SubnetError::NotFound(tx.net_idx))?;
            let sdu = Bytes::copy_from_slice(params);
            let actions = {
                let _seq = self.seq_lock.lock();
                let msg = SegmentedTx {
                    tx,
                    seq_auth: lower::seq_auth(self.net.ivi_tx(), self.net.seq()),
                    new_key,
                };
                let actions = self.send_seg(msg, lower::ctl_hdr(opcode, true), false, sdu, callback)?;
                self.claim_seq_auth(actions)
            };
            self.run_tx(actions);
            Ok(())
        } else {
            let mut lower = BytesMut::with_capacity(1 + params.len());
            lower.put_u8(lower::ctl_hdr(opcode, false));
            lower.extend_from_slice(params);
            let finished = {
                let _seq = self.seq_lock.lock();
                self.send_unseg(tx, lower.freeze(), callback)
            };
            finished.map(Self::complete_now)
        };

        self.drain_local();
        result
    }

    /// Publish a Heartbeat from the primary element
    pub fn send_heartbeat(
        &self,
        net_idx: u16,
        dst: u16,
        init_ttl: u8,
        features: Features,
    ) -> Result<(), TransportError> {
        let tx = NetTx {
            net_idx,
            src: self.net.primary_addr(),
            dst,
            ttl: init_ttl,
            ctl: true,
            credential: Credential::Flooding,
            tag: SendTag::empty(),
        };
        let pdu = control::heartbeat_pdu(init_ttl, features);
        self.send_ctl(tx, CtlOp::Heartbeat as u8, &pdu, None)
    }

    fn upper_key(&self, net_idx: u16, app_idx: u16) -> Result<UpperKey, TransportError> {
        let subnets = self.net.subnets();
        let sub = subnets.get(net_idx).ok_or(SubnetError::NotFound(net_idx))?;

        if app_idx == KEY_DEV {
            return Ok(UpperKey {
                key: self.dev_key,
                aid: 0,
                dev_key: true,
                new_key: sub.kr_flag,
            });
        }

        let app = subnets
            .app_key(app_idx)
            .filter(|k| k.net_idx == net_idx)
            .ok_or_else(|| {
                warn!("Unknown AppKey 0x{:03x} for subnet 0x{:03x}", app_idx, net_idx);
                TransportError::NotFound
            })?;
        let generation = app.tx_key(sub.kr_phase);
        Ok(UpperKey {
            key: generation.key,
            aid: generation.aid,
            dev_key: false,
            new_key: sub.kr_flag,
        })
    }

    fn encrypt(
        &self,
        key: &UpperKey,
        aszmic: bool,
        seq: u32,
        iv_index: u32,
        tx: &NetTx,
        payload: &[u8],
    ) -> Result<Bytes, TransportError> {
        let nonce = AppNonce {
            dev_key: key.dev_key,
            aszmic,
            seq,
            src: tx.src,
            dst: tx.dst,
            iv_index,
        };
        let mut buf = BytesMut::from(payload);
        self.net.crypto().app_encrypt(&key.key, &nonce, &mut buf).map_err(|e| {
            error!("Encrypt failed: {}", e);
            e
        })?;
        Ok(buf.freeze())
    }

    fn complete_now(callback: Option<SendCallback>) {
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    /// Hand an unsegmented PDU to the Friend queue and the network layer.
    ///
    /// The caller holds `seq_lock`. A send that is already complete returns
    /// its callback so the caller can run it after releasing the lock.
    fn send_unseg(
        &self,
        mut tx: NetTx,
        lower: Bytes,
        callback: Option<SendCallback>,
    ) -> Result<Option<SendCallback>, TransportError> {
        if !self.friend.has_space(tx.net_idx, tx.src, tx.dst, None, 1) {
            if address::is_unicast(tx.dst) {
                error!("Not enough space in Friend Queue");
                return Err(TransportError::NoFriendQueueSpace);
            }
            error!("No space in Friend Queue");
        } else if self.friend.enqueue_tx(&tx, None, 1, &lower) && address::is_unicast(tx.dst) {
            // Messages for an LPN only leave through its Friend queue
            return Ok(callback);
        }

        let token = callback.map(|cb| self.token(TokenUse::Message(Some(cb))));
        match self.net.send(&mut tx, &lower, token) {
            Ok((_, SendStatus::Queued)) => Ok(None),
            Ok((_, SendStatus::Delivered)) => match self.forget(token) {
                Some(TokenUse::Message(callback)) => Ok(callback),
                _ => Ok(None),
            },
            Err(e) => {
                self.forget(token);
                Err(e.into())
            }
        }
    }

    /// Split an SDU into segments and claim a TX slot for them.
    ///
    /// The caller holds `seq_lock` from the sequence number peek used for
    /// SeqAuth until [`MeshStack::claim_seq_auth`] returns.
    fn send_seg(
        &self,
        msg: SegmentedTx,
        hdr: u8,
        szmic: bool,
        sdu: Bytes,
        callback: Option<SendCallback>,
    ) -> Result<TxActions, TransportError> {
        let tx = msg.tx;
        self.tx.lock().check_admission(tx.src, tx.dst)?;

        let count = segment_count(sdu.len(), tx.ctl);
        if !self
            .friend
            .has_space(tx.net_idx, tx.src, tx.dst, Some(msg.seq_auth), count)
        {
            if address::is_unicast(tx.dst) {
                error!("Not enough space in Friend Queue for {} segments", count);
                return Err(TransportError::NoFriendQueueSpace);
            }
            error!("No space in Friend Queue for {} segments", count);
        }

        let payloads = Segmenter::new(tx.ctl).split(&sdu).map_err(|e| {
            warn!("Unable to segment {} bytes: {}", sdu.len(), e);
            TransportError::Oversized(sdu.len())
        })?;
        let seg_n = (payloads.len() - 1) as u8;
        let seq_zero = lower::seq_zero(msg.seq_auth as u32);
        debug!(
            "SeqZero 0x{:04x} SegN {} ctl {} dst 0x{:04x}",
            seq_zero, seg_n, tx.ctl, tx.dst
        );

        let mut segments = Vec::with_capacity(payloads.len());
        for (seg_o, payload) in payloads.iter().enumerate() {
            let header = SegmentHeader {
                hdr,
                szmic,
                seq_zero,
                seg_o: seg_o as u8,
                seg_n,
            };
            let pdu = build_segment(&header, payload);
            if self.friend.enqueue_tx(&tx, Some(msg.seq_auth), count, &pdu)
                && address::is_unicast(tx.dst)
            {
                segments.push(None);
            } else {
                segments.push(Some(pdu));
            }
        }

        self.tx.lock().start(msg, segments, callback)
    }

    /// Make the first network PDU of a new segmented message consume the
    /// sequence number its SeqAuth was built from.
    ///
    /// The caller holds `seq_lock`. When every segment went to the Friend
    /// queue the sequence number is consumed without sending.
    fn claim_seq_auth(&self, mut actions: TxActions) -> TxActions {
        let first = actions
            .iter()
            .position(|a| matches!(a, TxAction::Send { .. }));
        match first.map(|i| actions.remove(i)) {
            Some(TxAction::Send {
                slot,
                seg_o,
                tx,
                lower,
            }) => {
                let more = self.send_segment(slot, seg_o, tx, &lower);
                actions.extend(more);
            }
            _ => {
                self.net.next_seq();
            }
        }
        actions
    }

    /// First transmission of a segment. The caller holds `seq_lock`.
    fn send_segment(&self, slot: SlotId, seg_o: u8, mut tx: NetTx, lower: &[u8]) -> TxActions {
        let token = Some(self.token(TokenUse::Segment { slot, seg_o }));
        let result = self
            .net
            .send(&mut tx, lower, token)
            .map(|(encoded, status)| (encoded.pdu, encoded.credential, status));
        if !matches!(result, Ok((_, _, SendStatus::Queued))) {
            self.forget(token);
        }
        let sched = self.net.scheduler().clone();
        self.tx.lock().dispatched(slot, seg_o, result, sched.as_ref())
    }

    fn net_send(
        &self,
        tx: &mut NetTx,
        lower: &[u8],
        token: Option<SendToken>,
    ) -> Result<(mesh_net::Encoded, SendStatus), NetError> {
        let _seq = self.seq_lock.lock();
        self.net.send(tx, lower, token)
    }

    /// Perform the network work requested by the TX pool
    fn run_tx(&self, actions: TxActions) {
        let sched = self.net.scheduler().clone();
        let mut queue: VecDeque<TxAction> = actions.into_iter().collect();
        let mut completions: Vec<TxCompletion> = Vec::new();

        while let Some(action) = queue.pop_front() {
            let more = match action {
                TxAction::Send {
                    slot,
                    seg_o,
                    tx,
                    lower,
                } => {
                    let _seq = self.seq_lock.lock();
                    self.send_segment(slot, seg_o, tx, &lower)
                }
                TxAction::Resend {
                    slot,
                    seg_o,
                    net_idx,
                    dst,
                    pdu,
                    new_key,
                    mut credential,
                    tag,
                } => {
                    let token = Some(self.token(TokenUse::Segment { slot, seg_o }));
                    let result = {
                        let _seq = self.seq_lock.lock();
                        self.net
                            .resend(net_idx, dst, &pdu, new_key, &mut credential, tag, token)
                    };
                    if result.is_err() {
                        self.forget(token);
                    }
                    let result = result.map(|pdu| (pdu, credential));
                    self.tx.lock().resent(slot, seg_o, result, sched.as_ref())
                }
                TxAction::Complete(completion) => {
                    completions.push(completion);
                    TxActions::new()
                }
            };
            queue.extend(more);
        }

        if completions.is_empty() {
            return;
        }
        self.net.retry_pending_iv_update(self.tx_in_progress());
        for completion in completions {
            debug!(
                "Segmented message to 0x{:04x} finished: {:?}",
                completion.dst, completion.result
            );
            completion.notify();
        }
    }

    fn send_ack(&self, req: AckRequest) {
        if !address::is_unicast(req.recv_dst) {
            debug!("Not sending ack for non-unicast address 0x{:04x}", req.recv_dst);
            return;
        }

        let src = if req.ack.obo {
            self.net.primary_addr()
        } else {
            req.recv_dst
        };
        debug!(
            "SeqZero 0x{:04x} Block 0x{:08x} OBO {}",
            req.ack.seq_zero, req.ack.block, req.ack.obo
        );

        let mut tx = NetTx {
            net_idx: req.net_idx,
            src,
            dst: req.dst,
            ttl: req.ttl,
            ctl: true,
            credential: Credential::Flooding,
            tag: SendTag::empty(),
        };
        let mut pdu = BytesMut::with_capacity(1 + SegmentAck::LEN);
        pdu.put_u8(lower::ctl_hdr(CtlOp::Ack as u8, false));
        pdu.extend_from_slice(&req.ack.to_bytes());

        let token = req.slot.map(|slot| self.token(TokenUse::Ack { slot }));
        match self.net_send(&mut tx, &pdu, token) {
            Ok((_, SendStatus::Queued)) => {}
            Ok((_, SendStatus::Delivered)) => {
                if let Some(TokenUse::Ack { slot }) = self.forget(token) {
                    self.rx.lock().ack_sent(slot, self.net.scheduler().as_ref());
                }
            }
            Err(e) => {
                self.forget(token);
                warn!("Sending segment ack failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process a network PDU from a bearer
    pub fn net_recv(&self, raw: &[u8], net_if: NetIf) -> Result<(), TransportError> {
        let result = self.recv_one(raw, net_if);
        self.drain_local();
        result
    }

    fn recv_one(&self, raw: &[u8], net_if: NetIf) -> Result<(), TransportError> {
        let (mut rx, pdu) = self.net.decode(raw, net_if)?;

        if net_if == NetIf::ProxyCfg {
            debug!("Proxy configuration PDU from 0x{:04x} ignored", rx.src);
            return Ok(());
        }

        rx.friend_match = self.friend.match_lpn(rx.net_idx, rx.dst);

        let mut result = Ok(());
        if rx.local_match || rx.friend_match {
            result = self.trans_recv(&rx, pdu.slice(NET_HDR_LEN..));
            if result == Err(TransportError::Again) {
                self.net.msg_cache_rollback(&rx);
            }
        }

        if rx.wants_relay() {
            self.net.relay(&rx, &pdu);
        }

        result
    }

    /// Feed PDUs looped back to local elements through the receive path
    fn drain_local(&self) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        while let Some(pdu) = self.net.pop_local() {
            if let Err(e) = self.recv_one(&pdu, NetIf::Local) {
                debug!("Local PDU not accepted: {}", e);
            }
        }
        self.draining.store(false, Ordering::Release);
    }

    fn trans_recv(&self, rx: &NetRx, lower: Bytes) -> Result<(), TransportError> {
        if self.friend.lpn_reject(rx) {
            return Err(TransportError::Again);
        }
        let Some(&hdr) = lower.first() else {
            return Err(TransportError::InvalidPdu("empty transport PDU"));
        };

        let (result, seq_auth, kind, count) = if lower::is_seg(hdr) {
            let (result, seq_auth, kind, count) = self.trans_seg(rx, &lower);
            (result, Some(seq_auth), kind, count)
        } else {
            let (result, seq_auth) = self.trans_unseg(rx, &lower);
            (result, seq_auth, FriendPduKind::Single, 1)
        };

        if rx.friend_match && result.is_ok() {
            self.friend.enqueue_rx(rx, kind, seq_auth, count, &lower);
        }

        result
    }

    fn trans_unseg(&self, rx: &NetRx, lower: &Bytes) -> (Result<(), TransportError>, Option<u64>) {
        debug!("src 0x{:04x} dst 0x{:04x} seq 0x{:06x}", rx.src, rx.dst, rx.seq);

        if rx.local_match && self.net.rpl().check(&rx.rpl_query(), false).is_rejected() {
            warn!(
                "Replay: src 0x{:04x} dst 0x{:04x} seq 0x{:06x}",
                rx.src, rx.dst, rx.seq
            );
            return (Err(TransportError::ReplayRejected), None);
        }

        let hdr = lower[0];
        let payload = lower.slice(1..);
        if rx.ctl {
            let seq_auth = self.friend_ack_seq_auth(rx, hdr, &payload);
            (self.ctl_recv(rx, lower::ctl_op(hdr), payload), seq_auth)
        } else {
            (self.sdu_recv(rx, hdr, false, payload, rx.seq, rx.iv_index), None)
        }
    }

    /// SeqAuth of an ack relayed to a Low Power node; SeqZero is all we have
    fn friend_ack_seq_auth(&self, rx: &NetRx, hdr: u8, payload: &Bytes) -> Option<u64> {
        if !rx.friend_match || lower::ctl_op(hdr) != CtlOp::Ack as u8 {
            return None;
        }
        let mut buf = payload.clone();
        SegmentAck::decode(&mut buf)
            .ok()
            .map(|ack| lower::seq_auth(rx.iv_index, ack.seq_zero as u32))
    }

    fn trans_seg(
        &self,
        rx: &NetRx,
        lower: &Bytes,
    ) -> (Result<(), TransportError>, u64, FriendPduKind, usize) {
        let (header, payload) = match SegmentHeader::split(lower) {
            Ok(split) => split,
            Err(e) => {
                warn!("Invalid segment: {}", e);
                return (
                    Err(TransportError::InvalidPdu("malformed segment")),
                    0,
                    FriendPduKind::Partial,
                    0,
                );
            }
        };
        let seq_auth = lower::seq_auth(rx.iv_index, lower::base_seq(rx.seq, header.seq_zero));
        let count = header.seg_n as usize + 1;
        debug!(
            "ASZMIC {} SeqZero 0x{:04x} SegO {} SegN {}",
            header.szmic, header.seq_zero, header.seg_o, header.seg_n
        );

        let query = rx.rpl_query();
        let rpl = if rx.local_match {
            match self.net.rpl().check(&query, true) {
                RplCheck::Rejected => {
                    warn!(
                        "Replay: src 0x{:04x} dst 0x{:04x} seq 0x{:06x}",
                        rx.src, rx.dst, rx.seq
                    );
                    return (
                        Err(TransportError::ReplayRejected),
                        seq_auth,
                        FriendPduKind::Partial,
                        count,
                    );
                }
                RplCheck::Reserved(slot) => Some(RplReservation {
                    list: self.net.rpl(),
                    slot,
                    query,
                }),
                RplCheck::Accepted => None,
            }
        } else {
            None
        };

        let friend_space = if rx.friend_match && !rx.local_match {
            self.friend
                .has_space(rx.net_idx, rx.src, rx.dst, Some(seq_auth), count)
        } else {
            true
        };

        let segment = SegmentIn {
            rx,
            header,
            payload,
            seq_auth,
            friend_space,
        };
        let out = self
            .rx
            .lock()
            .receive(segment, rpl, self.net.scheduler().as_ref());

        for abandoned in out.abandoned {
            self.abandon(abandoned);
        }
        if let Some(ack) = out.ack {
            self.send_ack(ack);
        }

        match out.result {
            Ok(SegStatus::Stored) => (Ok(()), seq_auth, FriendPduKind::Partial, count),
            Ok(SegStatus::Complete { sdu, hdr, szmic }) => {
                let result = if rx.ctl {
                    self.ctl_recv(rx, lower::ctl_op(hdr), sdu)
                } else {
                    let seq = (seq_auth & mesh_wire::SEQ_MAX as u64) as u32;
                    self.sdu_recv(rx, hdr, szmic, sdu, seq, (seq_auth >> 24) as u32)
                };
                (result, seq_auth, FriendPduKind::Complete, count)
            }
            Err(e) => (Err(e), seq_auth, FriendPduKind::Partial, count),
        }
    }

    fn ctl_recv(&self, rx: &NetRx, opcode: u8, payload: Bytes) -> Result<(), TransportError> {
        debug!("OpCode 0x{:02x} len {}", opcode, payload.len());

        match control::route(opcode, self.net.features().friend) {
            CtlRoute::Ack => self.trans_ack(rx, &payload),
            CtlRoute::Heartbeat => {
                let sub_dst = self.hb_sub_dst.load(Ordering::Relaxed);
                if let Some(hb) = control::heartbeat_recv(rx, &payload, sub_dst)? {
                    self.upper
                        .heartbeat_received(hb.src, hb.dst, hb.hops, hb.features);
                }
                Ok(())
            }
            // Only acks and heartbeats matter for PDUs held for an LPN
            _ if !rx.local_match => Ok(()),
            CtlRoute::Friend(op) => self.friend.ctl_recv(rx, op as u8, &payload),
            CtlRoute::Upper(op) => {
                if self.upper.deliver_control(rx, op, payload) {
                    Ok(())
                } else {
                    warn!("Unhandled TransOpCode 0x{:02x}", op);
                    Err(TransportError::NotFound)
                }
            }
            CtlRoute::Unhandled(op) => {
                warn!("Unhandled TransOpCode 0x{:02x}", op);
                Err(TransportError::NotFound)
            }
        }
    }

    fn trans_ack(&self, rx: &NetRx, payload: &Bytes) -> Result<(), TransportError> {
        let mut buf = payload.clone();
        let ack = SegmentAck::decode(&mut buf).map_err(|e| {
            warn!("Malformed segment ack: {}", e);
            TransportError::InvalidPdu("malformed segment ack")
        })?;

        if rx.friend_match {
            debug!("Ack for LPN 0x{:04x} of this Friend", rx.dst);
            return Ok(());
        }

        let actions = self
            .tx
            .lock()
            .ack(rx.net_idx, rx.src, &ack, self.net.scheduler().as_ref())?;
        self.run_tx(actions);
        Ok(())
    }

    /// Decrypt an access payload and hand it to the upper layer
    fn sdu_recv(
        &self,
        rx: &NetRx,
        hdr: u8,
        aszmic: bool,
        payload: Bytes,
        seq: u32,
        iv_index: u32,
    ) -> Result<(), TransportError> {
        let mic = if aszmic { APP_MIC_LONG } else { APP_MIC_SHORT };
        if payload.len() < 1 + mic {
            warn!("Too short SDU + MIC ({} bytes)", payload.len());
            return Err(TransportError::InvalidPdu("too short access payload"));
        }
        if !rx.local_match {
            // Friend-only traffic is stored for the LPN, not decrypted
            return Ok(());
        }

        let mut nonce = AppNonce {
            dev_key: !lower::akf(hdr),
            aszmic,
            seq,
            src: rx.src,
            dst: rx.dst,
            iv_index,
        };

        if nonce.dev_key {
            let mut buf = BytesMut::from(&payload[..]);
            if let Err(e) = self.net.crypto().app_decrypt(&self.dev_key, &nonce, &mut buf) {
                warn!("Unable to decrypt with DevKey: {}", e);
                return Err(TransportError::NoCredentialMatch);
            }
            self.upper.deliver_access(rx, KEY_DEV, buf.freeze());
            return Ok(());
        }

        let aid = lower::aid(hdr);
        let candidates: Vec<(u16, Key)> = {
            let subnets = self.net.subnets();
            subnets
                .app_keys(rx.net_idx)
                .filter_map(|app| {
                    let generation = if rx.new_key && app.updated {
                        &app.keys[1]
                    } else {
                        &app.keys[0]
                    };
                    (generation.aid == aid).then_some((app.app_idx, generation.key))
                })
                .collect()
        };

        nonce.dev_key = false;
        for (app_idx, key) in candidates {
            let mut buf = BytesMut::from(&payload[..]);
            if self.net.crypto().app_decrypt(&key, &nonce, &mut buf).is_ok() {
                debug!("Decrypted with AppKey 0x{:03x}", app_idx);
                self.upper.deliver_access(rx, app_idx, buf.freeze());
                return Ok(());
            }
        }

        warn!("No matching AppKey");
        Ok(())
    }

    fn abandon(&self, abandoned: Abandoned) {
        self.friend.clear_incomplete(
            abandoned.net_idx,
            abandoned.src,
            abandoned.dst,
            abandoned.seq_auth,
        );
    }

    // ------------------------------------------------------------------
    // Timers and bearer completions
    // ------------------------------------------------------------------

    /// Handle a timer event delivered by the scheduler
    pub fn on_timer(&self, event: TimerEvent) {
        let sched = self.net.scheduler().clone();
        match event {
            TimerEvent::IvuRefresh => {
                if self.net.ivu_refresh(self.tx_in_progress()) == IvTick::Expired {
                    debug!("IV update minimum duration reached");
                }
            }
            TimerEvent::SegTxInterval(id) => {
                let actions = self.tx.lock().send_next(id);
                self.run_tx(actions);
            }
            TimerEvent::SegTxRetransmit(id) => {
                let actions = self.tx.lock().retransmit(id, sched.as_ref());
                self.run_tx(actions);
            }
            TimerEvent::SegRxAck(id) => {
                let ack = self.rx.lock().ack_timer_fired(id);
                if let Some(ack) = ack {
                    self.send_ack(ack);
                }
            }
            TimerEvent::SegRxDiscard(id) => {
                let abandoned = self.rx.lock().discard_fired(id, sched.as_ref());
                if let Some(abandoned) = abandoned {
                    self.abandon(abandoned);
                }
            }
        }
        self.drain_local();
    }

    /// The bearer finished with a PDU sent with `token`
    pub fn on_sent(&self, token: SendToken, result: Result<(), NetError>) {
        let Some(use_) = self.forget(Some(token)) else {
            debug!("Completion for unknown token {:?}", token);
            return;
        };

        match use_ {
            TokenUse::Segment { slot, seg_o } => {
                let actions = self.tx.lock().segment_sent(
                    slot,
                    seg_o,
                    result,
                    self.net.scheduler().as_ref(),
                );
                self.run_tx(actions);
            }
            TokenUse::Ack { slot } => {
                if let Err(e) = result {
                    warn!("Segment ack not sent: {}", e);
                }
                self.rx.lock().ack_sent(slot, self.net.scheduler().as_ref());
            }
            TokenUse::Message(callback) => {
                if let Some(callback) = callback {
                    callback(result.map_err(|e| TransportError::Io(e.to_string())));
                }
            }
        }
        self.drain_local();
    }

    // ------------------------------------------------------------------
    // IV index, key refresh and beacons
    // ------------------------------------------------------------------

    /// Apply an IV index observed or requested locally
    pub fn iv_update(&self, iv_index: u32, iv_update: bool) -> IvTransition {
        self.net.iv_update(iv_index, iv_update, self.tx_in_progress())
    }

    /// Handle an authenticated Secure Network beacon
    pub fn process_beacon(
        &self,
        net_id: &[u8; 8],
        flags: u8,
        iv_index: u32,
        auth: &[u8; 8],
    ) -> Result<BeaconOutcome, TransportError> {
        Ok(self
            .net
            .process_beacon(net_id, flags, iv_index, auth, self.tx_in_progress())?)
    }

    /// Apply the key refresh flag of a subnet
    pub fn kr_update(&self, net_idx: u16, new_kr: bool, new_key: bool) -> Result<bool, TransportError> {
        Ok(self.net.kr_update(net_idx, new_kr, new_key)?)
    }

    /// Enable or disable IV update test mode
    pub fn iv_update_test(&self, enable: bool) {
        self.net.iv_update_test(enable);
    }

    /// Start or finish an IV update by hand (test mode only)
    pub fn iv_update_toggle(&self) -> Result<bool, TransportError> {
        Ok(self.net.iv_update_toggle(self.tx_in_progress())?)
    }

    // ------------------------------------------------------------------
    // Resets
    // ------------------------------------------------------------------

    /// Abort every outgoing segmented message; callbacks are dropped
    pub fn tx_reset(&self) {
        let count = self.tx.lock().reset(self.net.scheduler().as_ref());
        if count > 0 {
            debug!("Dropped {} outgoing segmented messages", count);
        }
        self.net.retry_pending_iv_update(self.tx_in_progress());
    }

    /// Abort outgoing segmented messages to `dst`; callbacks are dropped
    pub fn tx_reset_single(&self, dst: u16) {
        let count = self.tx.lock().reset_dst(dst, self.net.scheduler().as_ref());
        if count > 0 {
            debug!("Dropped {} segmented messages to 0x{:04x}", count, dst);
            self.net.retry_pending_iv_update(self.tx_in_progress());
        }
    }

    /// Abort every reassembly and clear the replay list
    pub fn rx_reset(&self) {
        let abandoned = self.rx.lock().reset(self.net.scheduler().as_ref());
        for a in abandoned {
            self.abandon(a);
        }
        self.net.rpl().clear();
    }

    /// Abort reassemblies from `src`
    pub fn rx_reset_single(&self, src: u16) {
        let abandoned = self.rx.lock().reset_src(src, self.net.scheduler().as_ref());
        for a in abandoned {
            self.abandon(a);
        }
    }

    /// Forget all runtime state: segmentation, replay list, caches, friend
    /// credentials, IV index and sequence number
    pub fn reset(&self) {
        self.tx_reset();
        self.rx_reset();
        self.net.reset();
        self.tokens.lock().clear();
        info!("Transport stack reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upper::NoFriend;
    use mesh_net::{ManualScheduler, NetConfig, NoEvents, RecordingBearer};
    use mesh_storage::MemorySettings;
    use mesh_subnet::SimCrypto;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Sink {
        access: Mutex<Vec<(u16, u16, Bytes)>>,
        heartbeats: Mutex<Vec<(u16, u8)>>,
    }

    impl UpperTransport for Sink {
        fn deliver_access(&self, rx: &NetRx, app_idx: u16, payload: Bytes) {
            self.access.lock().push((rx.src, app_idx, payload));
        }

        fn heartbeat_received(&self, src: u16, _dst: u16, hops: u8, _features: Features) {
            self.heartbeats.lock().push((src, hops));
        }
    }

    struct Node {
        stack: MeshStack,
        bearer: Arc<RecordingBearer>,
        sched: Arc<ManualScheduler>,
        sink: Arc<Sink>,
    }

    fn node(addr: u16, element_count: u16) -> Node {
        let bearer = Arc::new(RecordingBearer::new());
        let sched = Arc::new(ManualScheduler::new());
        let sink = Arc::new(Sink::default());
        let config = NetConfig {
            primary_addr: addr,
            element_count,
            ..Default::default()
        };
        let net = Network::new(
            config,
            Arc::new(SimCrypto),
            bearer.clone(),
            sched.clone(),
            Arc::new(MemorySettings::new()),
            Arc::new(NoEvents),
        );
        let stack_config = StackConfig {
            dev_key: [0x33; 16],
            ..Default::default()
        };
        let stack = MeshStack::new(stack_config, net, sink.clone(), Arc::new(NoFriend));
        stack.net().create(0, 0, &[0x11; 16], 0).unwrap();
        stack
            .net()
            .subnets_mut()
            .app_key_add(0, 0, &[0x22; 16])
            .unwrap();
        Node {
            stack,
            bearer,
            sched,
            sink,
        }
    }

    fn callback() -> (SendCallback, mpsc::Receiver<Result<(), TransportError>>) {
        let (tx, rx) = mpsc::channel();
        let cb: SendCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (cb, rx)
    }

    #[test]
    fn test_send_rejects_empty_payload() {
        let n = node(0x0001, 1);
        let ctx = MsgCtx::new(0, 0, 0x0001, 0x0002);
        assert_eq!(
            n.stack.send(&ctx, &[], None),
            Err(TransportError::InvalidPdu("empty payload"))
        );
    }

    #[test]
    fn test_send_unknown_app_key() {
        let n = node(0x0001, 1);
        let ctx = MsgCtx::new(0, 5, 0x0001, 0x0002);
        assert_eq!(n.stack.send(&ctx, b"hi", None), Err(TransportError::NotFound));
    }

    #[test]
    fn test_unsegmented_send_completes_on_sent() {
        let n = node(0x0001, 1);
        let (cb, done) = callback();
        let ctx = MsgCtx::new(0, 0, 0x0001, 0x0002);
        n.stack.send(&ctx, b"hello", Some(cb)).unwrap();

        let sent = n.bearer.take();
        assert_eq!(sent.len(), 1);
        assert!(done.try_recv().is_err());

        n.stack.on_sent(sent[0].token.unwrap(), Ok(()));
        assert_eq!(done.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_local_delivery_to_own_element() {
        let n = node(0x0001, 2);
        let (cb, done) = callback();
        let ctx = MsgCtx::new(0, 0, 0x0001, 0x0002);
        n.stack.send(&ctx, b"loop", Some(cb)).unwrap();

        // Unicast to a local element never reaches the bearer
        assert!(n.bearer.is_empty());
        assert_eq!(done.try_recv().unwrap(), Ok(()));
        let access = n.sink.access.lock();
        assert_eq!(access.len(), 1);
        assert_eq!(access[0], (0x0001, 0, Bytes::from_static(b"loop")));
    }

    #[test]
    fn test_device_key_delivery() {
        let a = node(0x0001, 1);
        let b = node(0x0002, 1);
        let ctx = MsgCtx::new(0, KEY_DEV, 0x0001, 0x0002);
        a.stack.send(&ctx, b"devkey", None).unwrap();

        for pdu in a.bearer.take() {
            b.stack.net_recv(&pdu.pdu, NetIf::Adv).unwrap();
        }
        let access = b.sink.access.lock();
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].1, KEY_DEV);
        assert_eq!(&access[0].2[..], b"devkey");
    }

    #[test]
    fn test_heartbeat_subscription() {
        let a = node(0x0001, 1);
        let b = node(0x0002, 1);
        b.stack.set_heartbeat_sub(0xc000);
        b.stack.net().subscribe(0xc000);

        a.stack
            .send_heartbeat(0, 0xc000, 5, Features::RELAY)
            .unwrap();
        for pdu in a.bearer.take() {
            b.stack.net_recv(&pdu.pdu, NetIf::Adv).unwrap();
        }
        assert_eq!(*b.sink.heartbeats.lock(), vec![(0x0001, 1)]);
    }

    #[test]
    fn test_unknown_control_opcode() {
        let a = node(0x0001, 1);
        let b = node(0x0002, 1);
        let tx = NetTx {
            net_idx: 0,
            src: 0x0001,
            dst: 0x0002,
            ttl: TTL_DEFAULT,
            ctl: true,
            credential: Credential::Flooding,
            tag: SendTag::empty(),
        };
        a.stack.send_ctl(tx, 0x30, &[1, 2], None).unwrap();
        let sent = a.bearer.take();
        assert_eq!(
            b.stack.net_recv(&sent[0].pdu, NetIf::Adv),
            Err(TransportError::NotFound)
        );
    }

    #[test]
    fn test_reset_drops_outgoing_and_rpl() {
        let n = node(0x0001, 1);
        let ctx = MsgCtx::new(0, 0, 0x0001, 0x0002);
        n.stack.send(&ctx, &[0xab; 20], None).unwrap();
        assert!(n.stack.tx_in_progress());

        n.stack.reset();
        assert!(!n.stack.tx_in_progress());
        assert_eq!(n.stack.net().seq(), 0);
        assert!(n.sched.pending().is_empty());
    }
}
