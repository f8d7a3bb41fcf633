//! Subnet and AppKey tables with the key refresh procedure.

use crate::credential::{self, Candidates, Credential, SendTag, TxSecurity};
use crate::crypto::{Key, MeshCrypto};
use crate::friend::{FriendCredTable, FriendRole, DEFAULT_FRIEND_CRED_COUNT};
use crate::keys::{AppKey, AppKeyGen, KeyRefreshPhase, NetKeys, Subnet};
use crate::{SubnetError, NET_FLAG_KR};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Table capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Maximum number of subnets
    pub subnet_count: usize,
    /// Maximum number of AppKeys
    pub app_key_count: usize,
    /// Maximum number of friendship credentials
    pub friend_cred_count: usize,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            subnet_count: 3,
            app_key_count: 3,
            friend_cred_count: DEFAULT_FRIEND_CRED_COUNT,
        }
    }
}

/// All subnets, AppKeys and friendship credentials of a node
pub struct SubnetTable {
    crypto: Arc<dyn MeshCrypto>,
    config: SubnetConfig,
    subnets: Vec<Subnet>,
    app_keys: Vec<AppKey>,
    friends: FriendCredTable,
}

impl SubnetTable {
    /// Create an empty table
    pub fn new(crypto: Arc<dyn MeshCrypto>, config: SubnetConfig) -> Self {
        Self {
            crypto,
            config,
            subnets: Vec::with_capacity(config.subnet_count),
            app_keys: Vec::with_capacity(config.app_key_count),
            friends: FriendCredTable::new(config.friend_cred_count),
        }
    }

    /// Crypto provider used for derivations
    pub fn crypto(&self) -> &Arc<dyn MeshCrypto> {
        &self.crypto
    }

    /// Install the provisioned subnet, replacing any existing state.
    ///
    /// With the key refresh flag set the key is installed as the new
    /// generation and the subnet starts in phase 2.
    pub fn create(&mut self, net_idx: u16, flags: u8, key: &Key) -> Result<(), SubnetError> {
        let keys = NetKeys::derive(self.crypto.as_ref(), key)?;
        let mut sub = Subnet::new(net_idx, keys);

        if flags & NET_FLAG_KR != 0 {
            sub.kr_flag = true;
            sub.kr_phase = KeyRefreshPhase::Phase2;
        }

        self.subnets.clear();
        self.app_keys.clear();
        self.friends.clear();
        self.subnets.push(sub);
        info!("Subnet 0x{:03x} created flags 0x{:02x}", net_idx, flags);
        Ok(())
    }

    /// Add another subnet
    pub fn add(&mut self, net_idx: u16, key: &Key) -> Result<(), SubnetError> {
        if self.get(net_idx).is_some() {
            return Err(SubnetError::Exists(net_idx));
        }
        if self.subnets.len() >= self.config.subnet_count {
            return Err(SubnetError::NoFreeSlot);
        }

        let keys = NetKeys::derive(self.crypto.as_ref(), key)?;
        self.subnets.push(Subnet::new(net_idx, keys));
        debug!("Subnet 0x{:03x} added", net_idx);
        Ok(())
    }

    /// Remove a subnet with its AppKeys and friendship credentials
    pub fn delete(&mut self, net_idx: u16) -> Result<(), SubnetError> {
        let pos = self
            .subnets
            .iter()
            .position(|s| s.net_idx == net_idx)
            .ok_or(SubnetError::NotFound(net_idx))?;
        self.subnets.remove(pos);
        self.app_keys.retain(|k| k.net_idx != net_idx);
        self.friends.delete_subnet(net_idx);
        debug!("Subnet 0x{:03x} deleted", net_idx);
        Ok(())
    }

    /// Distribute a new NetKey, entering key refresh phase 1
    pub fn update_key(&mut self, net_idx: u16, key: &Key, own_addr: u16) -> Result<(), SubnetError> {
        let keys = NetKeys::derive(self.crypto.as_ref(), key)?;
        let sub = self
            .subnets
            .iter_mut()
            .find(|s| s.net_idx == net_idx)
            .ok_or(SubnetError::NotFound(net_idx))?;

        match sub.kr_phase {
            KeyRefreshPhase::Normal => {}
            KeyRefreshPhase::Phase1 if sub.keys[1].net == *key => return Ok(()),
            phase => {
                return Err(SubnetError::InvalidPhase { net_idx, phase });
            }
        }

        sub.keys[1] = keys;
        sub.kr_phase = KeyRefreshPhase::Phase1;
        info!("Subnet 0x{:03x} Normal -> Phase 1", net_idx);

        let sub = sub.clone();
        self.friends.update(self.crypto.as_ref(), &sub, own_addr)
    }

    /// Subnet by index
    pub fn get(&self, net_idx: u16) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.net_idx == net_idx)
    }

    /// Mutable subnet by index
    pub fn get_mut(&mut self, net_idx: u16) -> Option<&mut Subnet> {
        self.subnets.iter_mut().find(|s| s.net_idx == net_idx)
    }

    /// All subnets
    pub fn iter(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter()
    }

    /// Whether the primary subnet exists
    pub fn has_primary(&self) -> bool {
        self.get(crate::KEY_PRIMARY).is_some()
    }

    /// Enable or disable directed forwarding on a subnet
    pub fn set_directed_forwarding(&mut self, net_idx: u16, enabled: bool) -> Result<(), SubnetError> {
        let sub = self.get_mut(net_idx).ok_or(SubnetError::NotFound(net_idx))?;
        sub.directed_forwarding = enabled;
        Ok(())
    }

    /// Apply the key refresh flag seen in a secure network beacon.
    ///
    /// Returns `true` when the subnet changed phase.
    pub fn kr_update(&mut self, net_idx: u16, new_kr: bool, new_key: bool) -> Result<bool, SubnetError> {
        let sub = self.get_mut(net_idx).ok_or(SubnetError::NotFound(net_idx))?;

        if new_kr != sub.kr_flag && sub.kr_phase == KeyRefreshPhase::Normal {
            warn!("KR change in normal operation. Are we blacklisted?");
            return Ok(false);
        }

        sub.kr_flag = new_kr;

        if sub.kr_flag {
            if sub.kr_phase == KeyRefreshPhase::Phase1 {
                info!("Subnet 0x{:03x} Phase 1 -> Phase 2", net_idx);
                sub.kr_phase = KeyRefreshPhase::Phase2;
                return Ok(true);
            }
            return Ok(false);
        }

        let phase = sub.kr_phase;
        match phase {
            // Phase 1 ends early only on a beacon protected with the new key
            KeyRefreshPhase::Phase1 if !new_key => Ok(false),
            KeyRefreshPhase::Phase1 | KeyRefreshPhase::Phase2 => {
                info!("Subnet 0x{:03x} KR phase {:?} -> Normal", net_idx, phase);
                sub.kr_phase = KeyRefreshPhase::Normal;
                self.revoke_keys(net_idx);
                self.friends.refresh(net_idx);
                Ok(true)
            }
            KeyRefreshPhase::Normal => Ok(false),
        }
    }

    /// Drop the old key generation of a subnet and its updated AppKeys
    fn revoke_keys(&mut self, net_idx: u16) {
        if let Some(sub) = self.get_mut(net_idx) {
            sub.keys[0] = sub.keys[1].clone();
        }

        for key in self.app_keys.iter_mut().filter(|k| k.net_idx == net_idx) {
            if key.updated {
                key.keys[0] = key.keys[1];
                key.updated = false;
                debug!("AppKey 0x{:03x} revoked old key", key.app_idx);
            }
        }
    }

    /// Recompute secure network beacon authentication for every subnet
    pub fn beacon_update(&mut self, iv_index: u32, ivu_in_progress: bool) {
        let crypto = self.crypto.clone();
        for sub in self.subnets.iter_mut() {
            if let Err(e) = sub.update_beacon_auth(crypto.as_ref(), iv_index, ivu_in_progress) {
                warn!("Beacon update failed for subnet 0x{:03x}: {}", sub.net_idx, e);
            }
        }
    }

    /// Find the subnet a secure network beacon belongs to.
    ///
    /// Returns the NetKey index and whether the new key generation matched.
    pub fn find_with_beacon(
        &self,
        net_id: &[u8; 8],
        flags: u8,
        iv_index: u32,
        auth: &[u8; 8],
    ) -> Option<(u16, bool)> {
        for sub in self.subnets.iter() {
            for (new_key, keys) in sub.rx_generations() {
                if keys.net_id != *net_id {
                    continue;
                }
                match self.crypto.beacon_auth(&keys.beacon, flags, &keys.net_id, iv_index) {
                    Ok(expected) if expected == *auth => return Some((sub.net_idx, new_key)),
                    Ok(_) => warn!("Authentication Value mismatch for subnet 0x{:03x}", sub.net_idx),
                    Err(e) => warn!("Beacon authentication failed: {}", e),
                }
            }
        }
        None
    }

    /// Add an AppKey bound to a subnet
    pub fn app_key_add(&mut self, app_idx: u16, net_idx: u16, key: &Key) -> Result<(), SubnetError> {
        if self.get(net_idx).is_none() {
            return Err(SubnetError::NotFound(net_idx));
        }
        if self.app_key(app_idx).is_some() {
            return Err(SubnetError::Exists(app_idx));
        }
        if self.app_keys.len() >= self.config.app_key_count {
            return Err(SubnetError::NoFreeSlot);
        }

        let gen = AppKeyGen::derive(self.crypto.as_ref(), key)?;
        self.app_keys.push(AppKey {
            app_idx,
            net_idx,
            keys: [gen, gen],
            updated: false,
        });
        Ok(())
    }

    /// Distribute a new AppKey generation; the bound subnet must be in phase 1
    pub fn app_key_update(&mut self, app_idx: u16, key: &Key) -> Result<(), SubnetError> {
        let gen = AppKeyGen::derive(self.crypto.as_ref(), key)?;
        let net_idx = self
            .app_key(app_idx)
            .map(|k| k.net_idx)
            .ok_or(SubnetError::AppKeyNotFound(app_idx))?;
        let phase = self
            .get(net_idx)
            .map(|s| s.kr_phase)
            .ok_or(SubnetError::NotFound(net_idx))?;
        if phase != KeyRefreshPhase::Phase1 {
            return Err(SubnetError::InvalidPhase { net_idx, phase });
        }

        if let Some(app) = self.app_keys.iter_mut().find(|k| k.app_idx == app_idx) {
            app.keys[1] = gen;
            app.updated = true;
        }
        Ok(())
    }

    /// AppKey by index
    pub fn app_key(&self, app_idx: u16) -> Option<&AppKey> {
        self.app_keys.iter().find(|k| k.app_idx == app_idx)
    }

    /// AppKeys bound to a subnet
    pub fn app_keys(&self, net_idx: u16) -> impl Iterator<Item = &AppKey> {
        self.app_keys.iter().filter(move |k| k.net_idx == net_idx)
    }

    /// Friendship credentials
    pub fn friends(&self) -> &FriendCredTable {
        &self.friends
    }

    /// Create the credential for a new friendship on a subnet
    pub fn friend_cred_create(
        &mut self,
        net_idx: u16,
        own_addr: u16,
        addr: u16,
        role: FriendRole,
        lpn_counter: u16,
        frnd_counter: u16,
    ) -> Result<(), SubnetError> {
        let sub = self
            .get(net_idx)
            .cloned()
            .ok_or(SubnetError::NotFound(net_idx))?;
        self.friends
            .create(
                self.crypto.as_ref(),
                &sub,
                own_addr,
                addr,
                role,
                lpn_counter,
                frnd_counter,
            )
            .map(|_| ())
    }

    /// Remove the credential of a friendship
    pub fn friend_cred_delete(&mut self, net_idx: u16, addr: u16) -> Result<(), SubnetError> {
        self.friends.delete(net_idx, addr)
    }

    /// Drop every friendship credential
    pub fn friend_cred_clear(&mut self) {
        self.friends.clear();
    }

    /// Resolve transmit material for a PDU to `dst` on a subnet
    pub fn resolve_tx(
        &self,
        net_idx: u16,
        requested: Credential,
        dst: u16,
        tag: SendTag,
        new_key: bool,
    ) -> Result<TxSecurity, SubnetError> {
        let sub = self.get(net_idx).ok_or(SubnetError::NotFound(net_idx))?;
        credential::resolve_tx(sub, &self.friends, requested, dst, tag, new_key)
    }

    /// Trial-decryption candidates of every subnet for a NID
    pub fn rx_candidates(&self, nid: u8) -> Candidates {
        let mut out = Candidates::new();
        for sub in self.subnets.iter() {
            credential::rx_candidates(sub, &self.friends, nid, &mut out);
        }
        out
    }
}
