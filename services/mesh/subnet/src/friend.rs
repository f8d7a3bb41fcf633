//! Friendship credentials.
//!
//! A friendship between a Low Power node and its Friend gets its own
//! network security material, derived from the subnet NetKey, both
//! addresses and both counters. Each credential mirrors the two key
//! generations of its subnet during key refresh.

use crate::crypto::{MeshCrypto, NetSecurity};
use crate::keys::Subnet;
use crate::SubnetError;
use mesh_wire::address::UNASSIGNED;
use tracing::{debug, warn};

/// Default number of friendship credential slots
pub const DEFAULT_FRIEND_CRED_COUNT: usize = 4;

/// Our side of a friendship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendRole {
    /// We are the Low Power node, the peer is our Friend
    LowPower,
    /// We are the Friend, the peer is a Low Power node
    Friend,
}

/// Friendship credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendCred {
    /// NetKey index
    pub net_idx: u16,
    /// Peer address
    pub addr: u16,
    /// Our role in the friendship
    pub role: FriendRole,
    /// LPNCounter from the Friend Request
    pub lpn_counter: u16,
    /// FriendCounter from the Friend Offer
    pub frnd_counter: u16,
    /// Material for both key generations
    pub cred: [NetSecurity; 2],
}

/// Fixed pool of friendship credentials
#[derive(Debug, Clone)]
pub struct FriendCredTable {
    slots: Vec<Option<FriendCred>>,
}

impl FriendCredTable {
    /// Create a table with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    fn derive(
        crypto: &dyn MeshCrypto,
        cred: &FriendCred,
        own_addr: u16,
        net_key: &crate::crypto::Key,
    ) -> Result<NetSecurity, SubnetError> {
        let (lpn_addr, frnd_addr) = match cred.role {
            FriendRole::LowPower => (own_addr, cred.addr),
            FriendRole::Friend => (cred.addr, own_addr),
        };

        let mut p = [0u8; 9];
        p[0] = 0x01;
        p[1..3].copy_from_slice(&lpn_addr.to_be_bytes());
        p[3..5].copy_from_slice(&frnd_addr.to_be_bytes());
        p[5..7].copy_from_slice(&cred.lpn_counter.to_be_bytes());
        p[7..9].copy_from_slice(&cred.frnd_counter.to_be_bytes());

        debug!(
            "LPNAddress 0x{:04x} FriendAddress 0x{:04x} LPNCounter 0x{:04x} FriendCounter 0x{:04x}",
            lpn_addr, frnd_addr, cred.lpn_counter, cred.frnd_counter
        );

        Ok(crypto.k2(net_key, &p)?)
    }

    /// Create (or re-create) the credential for a friendship.
    ///
    /// Reuses the slot already held by (`addr`, subnet) or takes the first
    /// free one. The new generation is derived as well when the subnet is
    /// transmitting with its new key.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        crypto: &dyn MeshCrypto,
        sub: &Subnet,
        own_addr: u16,
        addr: u16,
        role: FriendRole,
        lpn_counter: u16,
        frnd_counter: u16,
    ) -> Result<&FriendCred, SubnetError> {
        let idx = self
            .slots
            .iter()
            .position(|s| match s {
                None => true,
                Some(c) => c.addr == addr && c.net_idx == sub.net_idx,
            })
            .ok_or_else(|| {
                warn!("No free friend credential slots");
                SubnetError::NoFreeSlot
            })?;

        let mut cred = FriendCred {
            net_idx: sub.net_idx,
            addr,
            role,
            lpn_counter,
            frnd_counter,
            cred: [NetSecurity::default(); 2],
        };

        cred.cred[0] = Self::derive(crypto, &cred, own_addr, &sub.keys[0].net).map_err(|e| {
            self.slots[idx] = None;
            e
        })?;

        if sub.kr_flag {
            cred.cred[1] =
                Self::derive(crypto, &cred, own_addr, &sub.keys[1].net).map_err(|e| {
                    self.slots[idx] = None;
                    e
                })?;
        }

        Ok(self.slots[idx].insert(cred))
    }

    /// Derive the new generation for every friendship on a subnet
    pub fn update(
        &mut self,
        crypto: &dyn MeshCrypto,
        sub: &Subnet,
        own_addr: u16,
    ) -> Result<(), SubnetError> {
        for cred in self.slots.iter_mut().flatten() {
            if cred.net_idx != sub.net_idx {
                continue;
            }
            cred.cred[1] = Self::derive(crypto, cred, own_addr, &sub.keys[1].net)?;
        }
        Ok(())
    }

    /// Promote the new generation once key refresh completes
    pub fn refresh(&mut self, net_idx: u16) {
        for cred in self.slots.iter_mut().flatten() {
            if cred.net_idx == net_idx {
                cred.cred[0] = cred.cred[1];
            }
        }
    }

    /// Remove the credential of a friendship
    pub fn delete(&mut self, net_idx: u16, addr: u16) -> Result<(), SubnetError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some(c) if c.addr == addr && c.net_idx == net_idx))
            .ok_or(SubnetError::NoFriendCred { net_idx, addr })?;
        *slot = None;
        Ok(())
    }

    /// Remove every credential bound to a subnet
    pub fn delete_subnet(&mut self, net_idx: u16) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(c) if c.net_idx == net_idx) {
                *slot = None;
            }
        }
    }

    /// Transmit material for a friendship on `sub`.
    ///
    /// With `addr` unassigned the first friendship on the subnet is used.
    pub fn get(&self, sub: &Subnet, addr: u16) -> Option<&NetSecurity> {
        self.iter()
            .find(|c| c.net_idx == sub.net_idx && (addr == UNASSIGNED || c.addr == addr))
            .map(|c| &c.cred[sub.kr_flag as usize])
    }

    /// Transmit material for a friendship PDU to `dst` on `sub`.
    ///
    /// A Friend uses the credential of the Low Power node addressed. A Low
    /// Power node sends everything through its Friend, whatever the
    /// destination.
    pub fn for_dst(&self, sub: &Subnet, dst: u16) -> Option<&NetSecurity> {
        let on_subnet = || self.iter().filter(move |c| c.net_idx == sub.net_idx);
        on_subnet()
            .find(|c| c.addr == dst)
            .or_else(|| on_subnet().find(|c| c.role == FriendRole::LowPower))
            .map(|c| &c.cred[sub.kr_flag as usize])
    }

    /// Active credentials
    pub fn iter(&self) -> impl Iterator<Item = &FriendCred> {
        self.slots.iter().flatten()
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

impl Default for FriendCredTable {
    fn default() -> Self {
        Self::new(DEFAULT_FRIEND_CRED_COUNT)
    }
}
