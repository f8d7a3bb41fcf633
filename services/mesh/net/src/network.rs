//! Network layer context.
//!
//! Encoding assigns sequence numbers, resolves credentials and protects the
//! PDU; decoding filters duplicates, trial-decrypts against every candidate
//! credential and validates addresses. The IV index procedure and key
//! refresh transitions live here because both directions of traffic depend
//! on them.

use crate::bearer::{BearerSink, Bearers, NetIf, SendToken, Transmit};
use crate::relay::{self, DropReason, RelayContext, RelayDecision, RelayFeatures, RelayStats};
use crate::timer::{Scheduler, SlotTimer, TimerEvent};
use crate::{NetError, TTL_DEFAULT};
use bytes::{Bytes, BytesMut};
use mesh_storage::{DupCache, IvRecord, MsgCache, ReplayList, RplQuery, Settings};
use mesh_subnet::iv::{IvState, IvTick, IvTransition, IVU_TIMEOUT};
use mesh_subnet::{
    Credential, IvConfig, Key, KeyRefreshPhase, MeshCrypto, SendTag, SubnetConfig, SubnetTable,
    NET_FLAG_IVU, NET_FLAG_KR,
};
use mesh_wire::address::{self, ALL_FRIENDS, ALL_NODES, ALL_PROXIES, ALL_RELAYS, UNASSIGNED};
use mesh_wire::network::{self as netpdu, mic_len, NetHeader, MAX_PDU_LEN};
use mesh_wire::{MIN_PDU_LEN, NET_HDR_LEN};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Network layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Address of the primary element
    pub primary_addr: u16,
    /// Number of elements
    pub element_count: u16,
    /// TTL used when a sender asks for the default
    pub default_ttl: u8,
    /// Network transmit state
    pub net_transmit: Transmit,
    /// Relay retransmit state
    pub relay_retransmit: Transmit,
    /// Feature states gating retransmission
    pub features: RelayFeatures,
    /// IV update behavior
    pub iv: IvConfig,
    /// Network message cache size
    pub msg_cache_size: usize,
    /// Replay protection list size
    pub rpl_size: usize,
    /// Subnet table capacities
    pub subnets: SubnetConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            primary_addr: UNASSIGNED,
            element_count: 1,
            default_ttl: 7,
            net_transmit: Transmit::new(2, 20),
            relay_retransmit: Transmit::new(2, 20),
            features: RelayFeatures::default(),
            iv: IvConfig::default(),
            msg_cache_size: mesh_storage::cache::DEFAULT_MSG_CACHE_SIZE,
            rpl_size: 10,
            subnets: SubnetConfig::default(),
        }
    }
}

/// Notifications from the network layer.
///
/// Every method has an empty default.
pub trait NetEvents: Send + Sync {
    /// IV index or IV update state changed
    fn iv_update_changed(&self, _iv_index: u32, _in_progress: bool) {}

    /// A subnet changed key refresh phase
    fn key_refresh_changed(&self, _net_idx: u16, _phase: KeyRefreshPhase) {}

    /// Security state changed; beacons for the subnet (all when `None`)
    /// should go out to friends and proxy clients
    fn secure_beacon_update(&self, _net_idx: Option<u16>) {}
}

/// Events sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl NetEvents for NoEvents {}

/// Transmit descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetTx {
    /// NetKey index
    pub net_idx: u16,
    /// Source element address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// TTL, or [`TTL_DEFAULT`]
    pub ttl: u8,
    /// Control PDU
    pub ctl: bool,
    /// Requested credential; updated with the one actually used
    pub credential: Credential,
    /// Send tags
    pub tag: SendTag,
}

/// Receive descriptor of a decoded PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetRx {
    /// Subnet the PDU belongs to
    pub net_idx: u16,
    /// Inbound interface
    pub net_if: NetIf,
    /// Credential that decrypted the PDU
    pub credential: Credential,
    /// Decrypted with the new key generation
    pub new_key: bool,
    /// Protected with the previous IV index
    pub old_iv: bool,
    /// IV index the PDU was protected with
    pub iv_index: u32,
    /// Control PDU
    pub ctl: bool,
    /// Received TTL
    pub ttl: u8,
    /// TTL to use for replies
    pub send_ttl: u8,
    /// Sequence number
    pub seq: u32,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Destination is one of our elements or a fixed group we serve
    pub local_match: bool,
    /// Destination is a Low Power node we are Friend for
    pub friend_match: bool,
    /// Network message cache entry of this PDU
    pub msg_cache_idx: Option<usize>,
}

impl NetRx {
    /// Replay protection fields
    pub fn rpl_query(&self) -> RplQuery {
        RplQuery {
            src: self.src,
            seq: self.seq,
            old_iv: self.old_iv,
        }
    }

    /// Whether the PDU should be offered to the relay engine
    pub fn wants_relay(&self) -> bool {
        !address::is_unicast(self.dst) || (!self.local_match && !self.friend_match)
    }
}

/// An encoded network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Obfuscated, encrypted PDU
    pub pdu: Bytes,
    /// Sequence number assigned
    pub seq: u32,
    /// Credential actually used
    pub credential: Credential,
}

/// Outcome of [`Network::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed to the bearer; its completion will be reported with the token
    Queued,
    /// Delivered only through the local interface; complete already
    Delivered,
}

/// Outcome of a Secure Network beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconOutcome {
    /// Subnet the beacon belongs to
    pub net_idx: u16,
    /// Key refresh phase changed
    pub kr_changed: bool,
    /// Result of the IV update request
    pub iv: IvTransition,
}

/// Per-node network layer context
pub struct Network {
    config: NetConfig,
    crypto: Arc<dyn MeshCrypto>,
    bearer: Arc<dyn BearerSink>,
    scheduler: Arc<dyn Scheduler>,
    settings: Arc<dyn Settings>,
    events: Arc<dyn NetEvents>,
    features: RwLock<RelayFeatures>,
    subnets: RwLock<SubnetTable>,
    iv: Mutex<IvState>,
    ivu_timer: Mutex<SlotTimer>,
    rpl: ReplayList,
    msg_cache: Mutex<MsgCache>,
    dup_cache: Mutex<DupCache>,
    local_queue: Mutex<VecDeque<Bytes>>,
    groups: RwLock<HashSet<u16>>,
    stats: Mutex<RelayStats>,
}

impl Network {
    /// Create the context, restoring the sequence number, IV state and
    /// replay list from `settings`
    pub fn new(
        config: NetConfig,
        crypto: Arc<dyn MeshCrypto>,
        bearer: Arc<dyn BearerSink>,
        scheduler: Arc<dyn Scheduler>,
        settings: Arc<dyn Settings>,
        events: Arc<dyn NetEvents>,
    ) -> Self {
        let mut iv = IvState::default();
        match settings.load_iv() {
            Ok(Some(record)) => {
                iv = IvState::provisioned(record.iv_index, record.in_progress);
                iv.ivu_duration = record.duration_hours;
                debug!(
                    "Restored IV index 0x{:08x} in_progress {} duration {}",
                    record.iv_index, record.in_progress, record.duration_hours
                );
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load IV index: {}", e),
        }
        match settings.load_seq() {
            Ok(Some(seq)) => iv.seq = seq,
            Ok(None) => {}
            Err(e) => warn!("Failed to load sequence number: {}", e),
        }

        Self {
            features: RwLock::new(config.features),
            subnets: RwLock::new(SubnetTable::new(crypto.clone(), config.subnets)),
            iv: Mutex::new(iv),
            ivu_timer: Mutex::new(SlotTimer::default()),
            rpl: ReplayList::with_store(config.rpl_size, settings.clone()),
            msg_cache: Mutex::new(MsgCache::new(config.msg_cache_size)),
            dup_cache: Mutex::new(DupCache::new()),
            local_queue: Mutex::new(VecDeque::new()),
            groups: RwLock::new(HashSet::new()),
            stats: Mutex::new(RelayStats::default()),
            config,
            crypto,
            bearer,
            scheduler,
            settings,
            events,
        }
    }

    /// Configuration
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Crypto provider
    pub fn crypto(&self) -> &Arc<dyn MeshCrypto> {
        &self.crypto
    }

    /// Scheduler
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Bearer sink
    pub fn bearer(&self) -> &Arc<dyn BearerSink> {
        &self.bearer
    }

    /// Current feature states
    pub fn features(&self) -> RelayFeatures {
        *self.features.read()
    }

    /// Change feature states
    pub fn set_features(&self, features: RelayFeatures) {
        *self.features.write() = features;
    }

    /// Subnet table, shared
    pub fn subnets(&self) -> RwLockReadGuard<'_, SubnetTable> {
        self.subnets.read()
    }

    /// Subnet table, exclusive
    pub fn subnets_mut(&self) -> RwLockWriteGuard<'_, SubnetTable> {
        self.subnets.write()
    }

    /// Replay protection list
    pub fn rpl(&self) -> &ReplayList {
        &self.rpl
    }

    /// Relay counters
    pub fn relay_stats(&self) -> RelayStats {
        self.stats.lock().clone()
    }

    /// Snapshot of the IV index state
    pub fn iv_state(&self) -> IvState {
        self.iv.lock().clone()
    }

    /// Current IV index
    pub fn iv_index(&self) -> u32 {
        self.iv.lock().iv_index
    }

    /// Next sequence number without consuming it
    pub fn seq(&self) -> u32 {
        self.iv.lock().seq
    }

    /// IV index used for transmission
    pub fn ivi_tx(&self) -> u32 {
        self.iv.lock().ivi_tx()
    }

    /// Address of the primary element
    pub fn primary_addr(&self) -> u16 {
        self.config.primary_addr
    }

    /// Whether the node has an address and at least one subnet
    pub fn is_provisioned(&self) -> bool {
        address::is_unicast(self.config.primary_addr) && self.subnets.read().iter().next().is_some()
    }

    /// Whether `addr` belongs to one of our elements
    pub fn is_local(&self, addr: u16) -> bool {
        address::in_element_range(addr, self.config.primary_addr, self.config.element_count)
    }

    /// Whether `addr` is a fixed group address this node listens to
    pub fn fixed_group_match(&self, addr: u16) -> bool {
        let features = self.features();
        match addr {
            ALL_NODES => true,
            ALL_RELAYS => features.relay,
            ALL_FRIENDS => features.friend,
            ALL_PROXIES => features.proxy,
            _ => false,
        }
    }

    /// Subscribe the node to a group address; returns whether it was added
    pub fn subscribe(&self, group: u16) -> bool {
        if !address::is_group(group) {
            warn!("Not a group address: 0x{:04x}", group);
            return false;
        }
        self.groups.write().insert(group)
    }

    /// Drop a group subscription; returns whether it existed
    pub fn unsubscribe(&self, group: u16) -> bool {
        self.groups.write().remove(&group)
    }

    /// Whether a PDU to `dst` is for this node
    pub fn local_match(&self, dst: u16) -> bool {
        self.fixed_group_match(dst) || self.is_local(dst) || self.groups.read().contains(&dst)
    }

    /// Install the provisioned subnet and IV state
    pub fn create(&self, net_idx: u16, flags: u8, key: &Key, iv_index: u32) -> Result<(), NetError> {
        self.subnets.write().create(net_idx, flags, key)?;
        self.msg_cache.lock().clear();

        let ivu = flags & NET_FLAG_IVU != 0;
        let state = {
            let mut iv = self.iv.lock();
            let seq = iv.seq;
            *iv = IvState::provisioned(iv_index, ivu);
            iv.seq = seq;
            iv.clone()
        };

        self.subnets.write().beacon_update(state.iv_index, state.in_progress());
        self.store_iv(&state);
        self.restart_ivu_timer();

        info!(
            "Network created: net_idx 0x{:03x} flags 0x{:02x} iv_index 0x{:08x}",
            net_idx, flags, iv_index
        );
        Ok(())
    }

    /// Take the next sequence number.
    ///
    /// Crossing the sequence limit outside IV update starts an IV update
    /// with this node as initiator.
    pub fn next_seq(&self) -> u32 {
        let (seq, stored, exhausted, next_iv) = {
            let mut iv = self.iv.lock();
            let seq = iv.next_seq();
            (seq, iv.seq, iv.seq_exhausted(&self.config.iv), iv.iv_index.wrapping_add(1))
        };

        if let Err(e) = self.settings.store_seq(stored) {
            warn!("Failed to store sequence number: {}", e);
        }

        if exhausted && self.subnets.read().has_primary() {
            info!("Sequence number 0x{:06x} exhausting, starting IV update", seq);
            self.iv.lock().set_initiator(true);
            self.iv_update(next_iv, true, false);
            self.events.secure_beacon_update(None);
        }

        seq
    }

    /// Encode a lower transport PDU into a protected network PDU
    pub fn encode(&self, tx: &mut NetTx, lower: &[u8], proxy: bool) -> Result<Encoded, NetError> {
        if lower.is_empty() {
            return Err(NetError::InvalidPdu("empty transport PDU"));
        }
        let total = NET_HDR_LEN + lower.len() + mic_len(tx.ctl);
        if total > MAX_PDU_LEN {
            return Err(NetError::Oversized(total));
        }
        if tx.ttl == TTL_DEFAULT {
            tx.ttl = self.config.default_ttl;
        }

        let security = {
            let subnets = self.subnets.read();
            let kr_flag = subnets
                .get(tx.net_idx)
                .map(|s| s.kr_flag)
                .ok_or(mesh_subnet::SubnetError::NotFound(tx.net_idx))?;
            subnets.resolve_tx(tx.net_idx, tx.credential, tx.dst, tx.tag, kr_flag)?
        };
        if security.credential != tx.credential {
            warn!("Falling back to {} credentials", security.credential);
        }
        tx.credential = security.credential;

        let seq = self.next_seq();
        let iv_index = self.ivi_tx();

        debug!(
            "src 0x{:04x} dst 0x{:04x} ctl {} seq 0x{:06x} cred {}",
            tx.src, tx.dst, tx.ctl, seq, tx.credential
        );

        let mut buf = BytesMut::with_capacity(total);
        NetHeader {
            ivi: iv_index & 1 != 0,
            nid: security.security.nid,
            ctl: tx.ctl,
            ttl: tx.ttl,
            seq,
            src: tx.src,
            dst: tx.dst,
        }
        .encode(&mut buf)?;
        buf.extend_from_slice(lower);

        self.crypto
            .net_encrypt(&security.security.enc, &mut buf, iv_index, proxy)?;
        self.crypto
            .net_obfuscate(&mut buf, iv_index, &security.security.privacy)?;

        Ok(Encoded {
            pdu: buf.freeze(),
            seq,
            credential: tx.credential,
        })
    }

    /// Bearers a locally originated PDU may leave on
    fn output_bearers(&self, ttl: u8, tag: SendTag, credential: Credential) -> Bearers {
        let mut bearers = Bearers::empty();
        // TTL 1 only leaves the node when tagged as relay
        if ttl == 1 && !tag.contains(SendTag::RELAY) {
            return bearers;
        }
        bearers |= Bearers::ADV;
        if self.features().proxy && credential != Credential::Friendship {
            bearers |= Bearers::GATT;
        }
        bearers
    }

    /// Encode and send a lower transport PDU.
    ///
    /// PDUs for local elements or subscribed groups are also queued on
    /// the local interface; see [`Network::pop_local`].
    pub fn send(
        &self,
        tx: &mut NetTx,
        lower: &[u8],
        token: Option<SendToken>,
    ) -> Result<(Encoded, SendStatus), NetError> {
        let encoded = self.encode(tx, lower, false)?;

        let mut local = false;
        if self.is_provisioned() && self.local_match(tx.dst) {
            self.local_queue.lock().push_back(encoded.pdu.clone());
            if address::is_unicast(tx.dst) {
                return Ok((encoded, SendStatus::Delivered));
            }
            local = true;
        }

        let bearers = self.output_bearers(tx.ttl, tx.tag, encoded.credential);
        if bearers.contains(Bearers::ADV) {
            let xmit = if tx.tag.contains(SendTag::FRIENDSHIP) {
                // Friendship PDUs go out once
                Transmit::new(0, self.config.net_transmit.interval_ms())
            } else {
                self.config.net_transmit
            };
            debug!("Network PDU, {}", xmit);
            self.bearer.send(encoded.pdu.clone(), bearers, xmit, token)?;
            return Ok((encoded, SendStatus::Queued));
        }

        if local {
            return Ok((encoded, SendStatus::Delivered));
        }

        warn!(
            "Not sent, src 0x{:04x}, dst 0x{:04x}, ttl {}, cred {}, tag 0x{:02x}",
            tx.src,
            tx.dst,
            tx.ttl,
            tx.credential,
            tx.tag.bits()
        );
        Err(NetError::NotSent {
            src: tx.src,
            dst: tx.dst,
            ttl: tx.ttl,
        })
    }

    /// Re-send a previously encoded PDU to `dst` with a fresh sequence
    /// number.
    ///
    /// `credential` is updated when friendship material is gone and the
    /// tag allows falling back to managed flooding.
    #[allow(clippy::too_many_arguments)]
    pub fn resend(
        &self,
        net_idx: u16,
        dst: u16,
        pdu: &Bytes,
        new_key: bool,
        credential: &mut Credential,
        tag: SendTag,
        token: Option<SendToken>,
    ) -> Result<Bytes, NetError> {
        let security = self
            .subnets
            .read()
            .resolve_tx(net_idx, *credential, dst, tag, new_key)
            .map_err(|e| {
                error!("Resend, no credentials found: {}", e);
                e
            })?;
        *credential = security.credential;

        let iv_index = self.ivi_tx();
        let mut buf = BytesMut::from(&pdu[..]);

        self.crypto
            .net_obfuscate(&mut buf, iv_index, &security.security.privacy)?;
        self.crypto
            .net_decrypt(&security.security.enc, &mut buf, iv_index, false)?;

        let seq = self.next_seq();
        netpdu::set_seq(&mut buf, seq);

        self.crypto
            .net_encrypt(&security.security.enc, &mut buf, iv_index, false)?;
        self.crypto
            .net_obfuscate(&mut buf, iv_index, &security.security.privacy)?;

        let pdu = buf.freeze();
        let bearers = Bearers::ADV
            | if self.features().proxy && *credential != Credential::Friendship {
                Bearers::GATT
            } else {
                Bearers::empty()
            };
        self.bearer
            .send(pdu.clone(), bearers, self.config.net_transmit, token)?;
        debug!("Resent net_idx 0x{:03x} seq 0x{:06x}", net_idx, seq);
        Ok(pdu)
    }

    /// Next PDU queued on the local interface
    pub fn pop_local(&self) -> Option<Bytes> {
        self.local_queue.lock().pop_front()
    }

    /// Decode a raw network PDU.
    ///
    /// Returns the receive descriptor and the cleartext PDU (header and
    /// lower transport PDU, MIC stripped).
    pub fn decode(&self, raw: &[u8], net_if: NetIf) -> Result<(NetRx, Bytes), NetError> {
        if !self.is_provisioned() {
            return Err(NetError::NotProvisioned);
        }
        if raw.len() < MIN_PDU_LEN {
            warn!("Dropping too short mesh packet (len {})", raw.len());
            return Err(NetError::InvalidPdu("too short"));
        }
        if raw.len() > MAX_PDU_LEN {
            warn!("Dropping too long mesh packet (len {})", raw.len());
            return Err(NetError::InvalidPdu("too long"));
        }
        if net_if == NetIf::Adv && self.dup_cache.lock().check(raw) {
            return Err(NetError::Duplicate);
        }

        let Some((ivi, nid)) = netpdu::ivi_nid(raw) else {
            return Err(NetError::InvalidPdu("empty"));
        };
        let (iv_index, old_iv) = self.iv.lock().iv_rx(ivi);
        let candidates = self.subnets.read().rx_candidates(nid);

        let mut cached = false;
        let mut found = None;
        for cand in candidates.iter() {
            let mut buf = BytesMut::from(raw);
            if self
                .crypto
                .net_obfuscate(&mut buf, iv_index, &cand.security.privacy)
                .is_err()
            {
                continue;
            }

            let src = u16::from_be_bytes([buf[5], buf[6]]);
            if !address::is_unicast(src) {
                debug!("Ignoring non-unicast src addr 0x{:04x}", src);
                continue;
            }

            let seq = u32::from_be_bytes([0, buf[2], buf[3], buf[4]]);
            if net_if == NetIf::Adv && self.msg_cache.lock().contains(src, seq) {
                debug!("Duplicate found in Network Message Cache");
                cached = true;
                continue;
            }

            if self
                .crypto
                .net_decrypt(&cand.security.enc, &mut buf, iv_index, net_if == NetIf::ProxyCfg)
                .is_ok()
            {
                found = Some((*cand, buf));
                break;
            }
        }

        let Some((cand, buf)) = found else {
            if cached {
                return Err(NetError::Already);
            }
            debug!("Unable to find matching net for packet");
            return Err(NetError::NoCredentialMatch);
        };

        if net_if == NetIf::Proxy && cand.credential == Credential::Friendship {
            warn!("Dropping packet from GATT bearer using friendship creds");
            return Err(NetError::InvalidPdu("friendship credentials over proxy"));
        }

        let hdr = NetHeader::parse(&buf)?;

        if net_if != NetIf::ProxyCfg && hdr.dst == UNASSIGNED {
            error!("Destination address is unassigned; dropping packet");
            return Err(NetError::DestinationUnassigned);
        }
        if address::is_rfu(hdr.dst) {
            error!("Destination address is RFU; dropping packet 0x{:04x}", hdr.dst);
            return Err(NetError::DestinationRfu(hdr.dst));
        }
        if net_if != NetIf::Local && self.is_local(hdr.src) {
            debug!("Dropping locally originated packet");
            return Err(NetError::LocalSource(hdr.src));
        }

        let msg_cache_idx = Some(self.msg_cache.lock().add(hdr.src, hdr.seq));

        debug!(
            "src 0x{:04x} dst 0x{:04x} ttl {} seq 0x{:06x} net_idx 0x{:03x} cred {}",
            hdr.src, hdr.dst, hdr.ttl, hdr.seq, cand.net_idx, cand.credential
        );

        let rx = NetRx {
            net_idx: cand.net_idx,
            net_if,
            credential: cand.credential,
            new_key: cand.new_key,
            old_iv,
            iv_index,
            ctl: hdr.ctl,
            ttl: hdr.ttl,
            send_ttl: if hdr.ttl == 0 { 0 } else { TTL_DEFAULT },
            seq: hdr.seq,
            src: hdr.src,
            dst: hdr.dst,
            local_match: self.local_match(hdr.dst),
            friend_match: false,
            msg_cache_idx,
        };

        Ok((rx, buf.freeze()))
    }

    /// Forget a message the transport rejected but wants to see again
    pub fn msg_cache_rollback(&self, rx: &NetRx) {
        if let Some(idx) = rx.msg_cache_idx {
            warn!("Removing rejected message from Network Message Cache");
            self.msg_cache.lock().rollback(idx);
        }
    }

    /// Forget cached messages from a range of element addresses
    pub fn msg_cache_clear(&self, addr: u16, count: u16) {
        self.msg_cache.lock().clear_range(addr, count);
    }

    /// Relay a decoded PDU if the retransmission rules allow it
    pub fn relay(&self, rx: &NetRx, pdu: &Bytes) -> RelayDecision {
        let features = self.features();
        let decision = relay::decide(
            &RelayContext {
                net_if: rx.net_if,
                credential: rx.credential,
                ttl: rx.ttl,
            },
            &features,
            self.config.net_transmit,
            self.config.relay_retransmit,
            self.bearer.relay_queue(),
        );

        let plan = match decision {
            RelayDecision::Forward(plan) => plan,
            RelayDecision::Drop(reason) => {
                debug!("Not relaying src 0x{:04x} dst 0x{:04x}: {}", rx.src, rx.dst, reason);
                self.stats.lock().record_drop(reason);
                return decision;
            }
        };

        match self.relay_send(rx, pdu, &plan, &features) {
            Ok(()) => {
                let throttled = plan.xmit == crate::RELAY_THROTTLED;
                self.stats.lock().record_forward(throttled);
                decision
            }
            Err(reason) => {
                self.stats.lock().record_drop(reason);
                RelayDecision::Drop(reason)
            }
        }
    }

    fn relay_send(
        &self,
        rx: &NetRx,
        pdu: &Bytes,
        plan: &crate::RelayPlan,
        features: &RelayFeatures,
    ) -> Result<(), DropReason> {
        let mut buf = BytesMut::from(&pdu[..]);

        // Only decrement TTL for non-locally originated packets
        if rx.net_if != NetIf::Local {
            netpdu::set_ttl(&mut buf, rx.ttl - 1);
        }

        let security = {
            let subnets = self.subnets.read();
            let sub = subnets.get(rx.net_idx).ok_or(DropReason::NoCredential)?;
            let keys = sub.tx_keys();
            match plan.credential {
                Credential::Directed => keys.directed,
                _ => keys.flooding,
            }
        };

        // The outbound key generation may differ from the inbound one
        netpdu::set_nid(&mut buf, security.nid);

        debug!("Relaying packet. TTL is now {}", buf[1] & 0x7f);

        // Re-encrypt with the received IV index, the transport nonce uses it
        if let Err(e) = self
            .crypto
            .net_encrypt(&security.enc, &mut buf, rx.iv_index, false)
        {
            error!("Re-encrypting failed: {}", e);
            return Err(DropReason::Crypto);
        }
        if let Err(e) = self
            .crypto
            .net_obfuscate(&mut buf, rx.iv_index, &security.privacy)
        {
            error!("Re-obfuscating failed: {}", e);
            return Err(DropReason::Crypto);
        }

        let mut bearers = plan.bearers;
        let gatt_allowed = (features.proxy && plan.credential != Credential::Friendship)
            || rx.net_if == NetIf::Local
            || rx.credential == Credential::Friendship;
        if !gatt_allowed {
            bearers.remove(Bearers::GATT);
        }

        let relay_to_adv = match rx.net_if {
            NetIf::Local => true,
            NetIf::Adv => features.relay,
            NetIf::Proxy => features.proxy,
            NetIf::ProxyCfg => false,
        };
        if !relay_to_adv && rx.credential != Credential::Friendship {
            bearers.remove(Bearers::ADV);
        }

        if bearers.is_empty() {
            return Err(DropReason::NoBearer);
        }

        self.bearer
            .send(buf.freeze(), bearers, plan.xmit, None)
            .map_err(|e| {
                warn!("Relay send failed: {}", e);
                DropReason::Bearer
            })
    }

    fn store_iv(&self, state: &IvState) {
        let record = IvRecord {
            iv_index: state.iv_index,
            in_progress: state.in_progress(),
            duration_hours: state.ivu_duration,
        };
        if let Err(e) = self.settings.store_iv(record) {
            warn!("Failed to store IV index: {}", e);
        }
    }

    fn restart_ivu_timer(&self) {
        self.ivu_timer
            .lock()
            .start(self.scheduler.as_ref(), IVU_TIMEOUT, TimerEvent::IvuRefresh);
    }

    /// Process an IV index from a beacon or a local trigger.
    ///
    /// `tx_in_progress` reports outstanding segmented sends, which defer a
    /// return to normal operation.
    pub fn iv_update(&self, iv_index: u32, iv_update: bool, tx_in_progress: bool) -> IvTransition {
        let transition = self
            .iv
            .lock()
            .update(iv_index, iv_update, tx_in_progress, &self.config.iv);

        let IvTransition::Changed {
            in_progress,
            recovery,
        } = transition
        else {
            return transition;
        };

        if recovery {
            self.rpl.clear();
        }
        if in_progress {
            self.rpl.update_on_iv_update();
        }

        self.restart_ivu_timer();

        let state = self.iv_state();
        self.subnets
            .write()
            .beacon_update(state.iv_index, state.in_progress());
        self.store_iv(&state);
        if let Err(e) = self.settings.store_seq(state.seq) {
            warn!("Failed to store sequence number: {}", e);
        }

        self.events.iv_update_changed(state.iv_index, state.in_progress());
        transition
    }

    /// Retry a return to normal operation deferred by outstanding sends
    pub fn retry_pending_iv_update(&self, tx_in_progress: bool) -> IvTransition {
        let pending = self.iv.lock().take_pending();
        if !pending {
            return IvTransition::Unchanged;
        }

        debug!("Proceeding with pending IV Update");
        let iv_index = self.iv_index();
        let transition = self.iv_update(iv_index, false, tx_in_progress);
        if matches!(transition, IvTransition::Changed { .. }) {
            self.events.secure_beacon_update(None);
        }
        transition
    }

    /// Handle the IV update hour timer
    pub fn ivu_refresh(&self, tx_in_progress: bool) -> IvTick {
        self.ivu_timer.lock().fired();
        let (tick, state) = {
            let mut iv = self.iv.lock();
            let tick = iv.tick();
            (tick, iv.clone())
        };

        info!(
            "{} for {} hours",
            if state.in_progress() {
                "IVU in Progress"
            } else {
                "IVU Normal mode"
            },
            state.ivu_duration
        );

        match tick {
            IvTick::Rearm => {
                self.store_iv(&state);
                self.restart_ivu_timer();
            }
            IvTick::Expired => {
                self.iv.lock().set_initiator(true);
                self.iv_update(state.iv_index, false, tx_in_progress);
            }
            IvTick::Idle => self.store_iv(&state),
        }
        tick
    }

    /// Enable or disable IV update test mode
    pub fn iv_update_test(&self, enable: bool) {
        self.iv.lock().set_test_mode(enable);
    }

    /// Manually start or finish an IV update (test mode only).
    ///
    /// Returns whether an IV update is in progress afterwards.
    pub fn iv_update_toggle(&self, tx_in_progress: bool) -> Result<bool, NetError> {
        if !self.is_provisioned() {
            error!("Not yet provisioned");
            return Err(NetError::NotProvisioned);
        }

        let state = self.iv_state();
        if !state.flags.contains(mesh_subnet::IvFlags::TEST) {
            return Err(NetError::NotPermitted);
        }

        if state.in_progress() {
            self.iv_update(state.iv_index, false, tx_in_progress);
        } else {
            self.iv_update(state.iv_index.wrapping_add(1), true, tx_in_progress);
        }
        self.events.secure_beacon_update(None);

        Ok(self.iv.lock().in_progress())
    }

    /// Apply a key refresh flag observed in a beacon
    pub fn kr_update(&self, net_idx: u16, new_kr: bool, new_key: bool) -> Result<bool, NetError> {
        let (changed, phase) = {
            let mut subnets = self.subnets.write();
            let changed = subnets.kr_update(net_idx, new_kr, new_key)?;
            let phase = subnets.get(net_idx).map(|s| s.kr_phase).unwrap_or_default();
            (changed, phase)
        };

        if changed {
            let state = self.iv_state();
            self.subnets
                .write()
                .beacon_update(state.iv_index, state.in_progress());
            self.events.key_refresh_changed(net_idx, phase);
        }
        Ok(changed)
    }

    /// Handle an authenticated Secure Network beacon
    pub fn process_beacon(
        &self,
        net_id: &[u8; 8],
        flags: u8,
        iv_index: u32,
        auth: &[u8; 8],
        tx_in_progress: bool,
    ) -> Result<BeaconOutcome, NetError> {
        let (net_idx, new_key) = self
            .subnets
            .read()
            .find_with_beacon(net_id, flags, iv_index, auth)
            .ok_or(NetError::NoCredentialMatch)?;

        let kr_changed = self.kr_update(net_idx, flags & NET_FLAG_KR != 0, new_key)?;
        if kr_changed {
            self.events.secure_beacon_update(Some(net_idx));
        }

        let primary = self.subnets.read().has_primary();
        let iv = if primary && net_idx != mesh_subnet::KEY_PRIMARY {
            warn!("Ignoring secure beacon on non-primary subnet");
            IvTransition::Unchanged
        } else {
            let iv = self.iv_update(iv_index, flags & NET_FLAG_IVU != 0, tx_in_progress);
            if matches!(iv, IvTransition::Changed { .. }) {
                self.events.secure_beacon_update(None);
            }
            iv
        };

        Ok(BeaconOutcome {
            net_idx,
            kr_changed,
            iv,
        })
    }

    /// Forget runtime network state: friend credentials, caches, IV index
    /// and sequence number
    pub fn reset(&self) {
        self.ivu_timer.lock().cancel(self.scheduler.as_ref());
        self.subnets.write().friend_cred_clear();
        self.msg_cache.lock().clear();
        self.dup_cache.lock().clear();
        self.local_queue.lock().clear();

        let mut iv = self.iv.lock();
        *iv = IvState::default();
        info!("Network state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::RecordingBearer;
    use crate::timer::ManualScheduler;
    use crate::RELAY_THROTTLED;
    use mesh_storage::MemorySettings;
    use mesh_subnet::{NetKeys, SimCrypto};

    const NET_KEY: Key = [0x7d; 16];

    struct Node {
        net: Network,
        bearer: Arc<RecordingBearer>,
        sched: Arc<ManualScheduler>,
        settings: Arc<MemorySettings>,
    }

    fn node(addr: u16) -> Node {
        let bearer = Arc::new(RecordingBearer::new());
        let sched = Arc::new(ManualScheduler::new());
        let settings = Arc::new(MemorySettings::new());
        let config = NetConfig {
            primary_addr: addr,
            ..NetConfig::default()
        };
        let net = Network::new(
            config,
            Arc::new(SimCrypto::new()),
            bearer.clone(),
            sched.clone(),
            settings.clone(),
            Arc::new(NoEvents),
        );
        net.create(0, 0, &NET_KEY, 5).unwrap();
        Node {
            net,
            bearer,
            sched,
            settings,
        }
    }

    fn tx(src: u16, dst: u16, ttl: u8) -> NetTx {
        NetTx {
            net_idx: 0,
            src,
            dst,
            ttl,
            ctl: false,
            credential: Credential::Flooding,
            tag: SendTag::empty(),
        }
    }

    const LOWER: &[u8] = &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

    #[test]
    fn test_encode_decode_between_nodes() {
        let a = node(0x0001);
        let b = node(0x0002);

        let encoded = a.net.encode(&mut tx(0x0001, 0x0002, 5), LOWER, false).unwrap();
        assert_eq!(encoded.seq, 0);
        assert_eq!(encoded.pdu.len(), NET_HDR_LEN + LOWER.len() + 4);

        let (rx, pdu) = b.net.decode(&encoded.pdu, NetIf::Adv).unwrap();
        assert_eq!(rx.src, 0x0001);
        assert_eq!(rx.dst, 0x0002);
        assert_eq!(rx.ttl, 5);
        assert_eq!(rx.iv_index, 5);
        assert!(!rx.old_iv);
        assert!(rx.local_match);
        assert!(!rx.wants_relay());
        assert_eq!(&pdu[NET_HDR_LEN..], LOWER);

        // Heard again: duplicate cache
        assert_eq!(
            b.net.decode(&encoded.pdu, NetIf::Adv),
            Err(NetError::Duplicate)
        );
        // Same message again over GATT is fine
        assert!(b.net.decode(&encoded.pdu, NetIf::Proxy).is_ok());
    }

    #[test]
    fn test_sequence_numbers_increase_and_persist() {
        let a = node(0x0001);
        for expected in 0..3 {
            let encoded = a.net.encode(&mut tx(0x0001, 0x0002, 5), LOWER, false).unwrap();
            assert_eq!(encoded.seq, expected);
        }
        assert_eq!(a.settings.load_seq().unwrap(), Some(3));
    }

    #[test]
    fn test_decode_rejects() {
        let a = node(0x0001);
        let b = node(0x0002);

        assert_eq!(
            b.net.decode(&[0u8; 10], NetIf::Adv),
            Err(NetError::InvalidPdu("too short"))
        );

        let foreign = node(0x0003);
        foreign.net.create(0, 0, &[0x01; 16], 5).unwrap();
        let encoded = foreign
            .net
            .encode(&mut tx(0x0003, 0x0002, 5), LOWER, false)
            .unwrap();
        assert_eq!(
            b.net.decode(&encoded.pdu, NetIf::Adv),
            Err(NetError::NoCredentialMatch)
        );

        let encoded = a.net.encode(&mut tx(0x0001, UNASSIGNED, 5), LOWER, false).unwrap();
        assert_eq!(
            b.net.decode(&encoded.pdu, NetIf::Adv),
            Err(NetError::DestinationUnassigned)
        );

        // Our own PDU coming back over the air
        let encoded = b.net.encode(&mut tx(0x0002, 0xc000, 5), LOWER, false).unwrap();
        assert_eq!(
            b.net.decode(&encoded.pdu, NetIf::Adv),
            Err(NetError::LocalSource(0x0002))
        );
    }

    #[test]
    fn test_msg_cache_rollback() {
        let a = node(0x0001);
        let b = node(0x0002);

        let first = a.net.encode(&mut tx(0x0001, 0x0002, 5), LOWER, false).unwrap();
        let (rx, _) = b.net.decode(&first.pdu, NetIf::Proxy).unwrap();
        b.net.msg_cache_rollback(&rx);
        assert!(b.net.decode(&first.pdu, NetIf::Adv).is_ok());

        let second = a.net.encode(&mut tx(0x0001, 0x0002, 5), LOWER, false).unwrap();
        b.net.decode(&second.pdu, NetIf::Proxy).unwrap();
        assert_eq!(b.net.decode(&second.pdu, NetIf::Adv), Err(NetError::Already));
    }

    #[test]
    fn test_send_local_and_output_filter() {
        let a = node(0x0001);

        let (_, status) = a.net.send(&mut tx(0x0001, 0x0001, 5), LOWER, None).unwrap();
        assert_eq!(status, SendStatus::Delivered);
        assert!(a.bearer.is_empty());
        let local = a.net.pop_local().unwrap();
        let (rx, _) = a.net.decode(&local, NetIf::Local).unwrap();
        assert_eq!(rx.src, 0x0001);

        // TTL 1 stays on the node unless tagged as relay
        assert!(matches!(
            a.net.send(&mut tx(0x0001, 0x0002, 1), LOWER, None),
            Err(NetError::NotSent { .. })
        ));

        let mut relay = tx(0x0001, 0x0002, 1);
        relay.tag = SendTag::RELAY;
        let (_, status) = a.net.send(&mut relay, LOWER, Some(SendToken(1))).unwrap();
        assert_eq!(status, SendStatus::Queued);
        let sent = a.bearer.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bearers, Bearers::ADV);
        assert_eq!(sent[0].token, Some(SendToken(1)));

        // All-nodes: looped back and sent
        let (_, status) = a.net.send(&mut tx(0x0001, ALL_NODES, TTL_DEFAULT), LOWER, None).unwrap();
        assert_eq!(status, SendStatus::Queued);
        assert!(a.net.pop_local().is_some());
    }

    #[test]
    fn test_group_subscription() {
        let a = node(0x0001);
        assert!(!a.net.local_match(0xc001));
        assert!(!a.net.subscribe(0x0002));
        assert!(a.net.subscribe(0xc001));
        assert!(a.net.local_match(0xc001));

        let (_, status) = a.net.send(&mut tx(0x0001, 0xc001, 5), LOWER, None).unwrap();
        assert_eq!(status, SendStatus::Queued);
        assert!(a.net.pop_local().is_some());

        assert!(a.net.unsubscribe(0xc001));
        assert!(!a.net.local_match(0xc001));
    }

    #[test]
    fn test_resend_assigns_new_seq() {
        let a = node(0x0001);
        let b = node(0x0002);

        let (encoded, _) = a.net.send(&mut tx(0x0001, 0x0002, 5), LOWER, None).unwrap();
        a.bearer.take();

        let mut cred = Credential::Flooding;
        let pdu = a
            .net
            .resend(0, 0x0002, &encoded.pdu, false, &mut cred, SendTag::empty(), None)
            .unwrap();
        assert_eq!(a.bearer.len(), 1);

        let (rx, clear) = b.net.decode(&pdu, NetIf::Adv).unwrap();
        assert_eq!(rx.seq, encoded.seq + 1);
        assert_eq!(&clear[NET_HDR_LEN..], LOWER);
    }

    #[test]
    fn test_relay_decrements_ttl() {
        let a = node(0x0001);
        let b = node(0x0002);
        let c = node(0x0003);

        let encoded = a.net.encode(&mut tx(0x0001, 0x0003, 5), LOWER, false).unwrap();
        let (rx, pdu) = b.net.decode(&encoded.pdu, NetIf::Adv).unwrap();
        assert!(rx.wants_relay());
        assert!(matches!(b.net.relay(&rx, &pdu), RelayDecision::Forward(_)));

        let sent = b.bearer.take();
        assert_eq!(sent.len(), 1);
        let (rx, clear) = c.net.decode(&sent[0].pdu, NetIf::Adv).unwrap();
        assert_eq!(rx.ttl, 4);
        assert_eq!(rx.seq, encoded.seq);
        assert_eq!(&clear[NET_HDR_LEN..], LOWER);
        assert_eq!(b.net.relay_stats().forwarded, 1);
    }

    #[test]
    fn test_relay_ttl_one_dropped() {
        let a = node(0x0001);
        let b = node(0x0002);

        let encoded = a.net.encode(&mut tx(0x0001, 0x0003, 1), LOWER, false).unwrap();
        let (rx, pdu) = b.net.decode(&encoded.pdu, NetIf::Adv).unwrap();
        assert_eq!(
            b.net.relay(&rx, &pdu),
            RelayDecision::Drop(DropReason::TtlExpired)
        );
        assert!(b.bearer.is_empty());
    }

    #[test]
    fn test_relay_throttled_when_queue_busy() {
        let a = node(0x0001);
        let b = node(0x0002);
        b.bearer.set_relay_queue(6, 10);

        let encoded = a.net.encode(&mut tx(0x0001, 0x0003, 5), LOWER, false).unwrap();
        let (rx, pdu) = b.net.decode(&encoded.pdu, NetIf::Adv).unwrap();
        b.net.relay(&rx, &pdu);
        assert_eq!(b.bearer.take()[0].xmit, RELAY_THROTTLED);
        assert_eq!(b.net.relay_stats().throttled, 1);
    }

    #[test]
    fn test_iv_update_cycle() {
        let a = node(0x0001);

        let t = a.net.iv_update(6, true, false);
        assert_eq!(
            t,
            IvTransition::Changed {
                in_progress: true,
                recovery: false
            }
        );
        assert_eq!(a.net.iv_index(), 6);
        assert_eq!(a.net.ivi_tx(), 5);
        assert!(a.settings.load_iv().unwrap().unwrap().in_progress);

        // Minimum duration not reached
        assert_eq!(a.net.iv_update(6, false, false), IvTransition::Unchanged);

        // Four 24 hour ticks complete the procedure
        for expected in [IvTick::Rearm, IvTick::Rearm, IvTick::Rearm, IvTick::Expired] {
            assert_eq!(a.sched.fire_next(), Some(TimerEvent::IvuRefresh));
            assert_eq!(a.net.ivu_refresh(false), expected);
        }
        assert!(!a.net.iv_state().in_progress());
        assert_eq!(a.net.seq(), 0);
        assert_eq!(a.sched.pending(), vec![TimerEvent::IvuRefresh]);
    }

    #[test]
    fn test_iv_update_deferred_then_retried() {
        let a = node(0x0001);
        a.net.iv_update_test(true);
        a.net.iv_update(6, true, false);

        assert_eq!(a.net.iv_update(6, false, true), IvTransition::Deferred);
        assert!(a.net.iv_state().in_progress());

        assert!(matches!(
            a.net.retry_pending_iv_update(false),
            IvTransition::Changed {
                in_progress: false,
                ..
            }
        ));
        assert_eq!(a.net.retry_pending_iv_update(false), IvTransition::Unchanged);
    }

    #[test]
    fn test_iv_update_toggle_requires_test_mode() {
        let a = node(0x0001);
        assert_eq!(a.net.iv_update_toggle(false), Err(NetError::NotPermitted));
        a.net.iv_update_test(true);
        assert_eq!(a.net.iv_update_toggle(false), Ok(true));
        assert_eq!(a.net.iv_index(), 6);
        assert_eq!(a.net.iv_update_toggle(false), Ok(false));
    }

    #[test]
    fn test_iv_recovery_clears_rpl() {
        let a = node(0x0001);
        let query = RplQuery {
            src: 0x0009,
            seq: 3,
            old_iv: false,
        };
        assert_eq!(a.net.rpl().check(&query, false), mesh_storage::RplCheck::Accepted);
        assert_eq!(a.net.rpl().len(), 1);

        let t = a.net.iv_update(9, false, false);
        assert_eq!(
            t,
            IvTransition::Changed {
                in_progress: false,
                recovery: true
            }
        );
        assert_eq!(a.net.iv_index(), 9);
        assert!(a.net.rpl().is_empty());
    }

    #[test]
    fn test_process_beacon() {
        let a = node(0x0001);
        let crypto = SimCrypto::new();
        let keys = NetKeys::derive(&crypto, &NET_KEY).unwrap();

        let auth = crypto
            .beacon_auth(&keys.beacon, NET_FLAG_IVU, &keys.net_id, 6)
            .unwrap();
        let outcome = a
            .net
            .process_beacon(&keys.net_id, NET_FLAG_IVU, 6, &auth, false)
            .unwrap();
        assert_eq!(outcome.net_idx, 0);
        assert!(!outcome.kr_changed);
        assert!(matches!(outcome.iv, IvTransition::Changed { in_progress: true, .. }));

        assert_eq!(
            a.net.process_beacon(&keys.net_id, 0, 6, &[0; 8], false),
            Err(NetError::NoCredentialMatch)
        );
    }

    #[test]
    fn test_reset() {
        let a = node(0x0001);
        a.net.next_seq();
        a.net.reset();
        assert_eq!(a.net.seq(), 0);
        assert_eq!(a.net.iv_index(), 0);
        assert!(a.sched.pending().is_empty());
    }
}
