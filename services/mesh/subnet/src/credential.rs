//! Security credential selection.
//!
//! Transmission resolves the material for a requested credential, falling
//! back to managed flooding unless the caller pinned the credential.
//! Reception walks an ordered list of candidates per subnet (friendship,
//! then directed, then managed flooding; old generation before new) and the
//! first one that authenticates wins.

use crate::crypto::NetSecurity;
use crate::friend::FriendCredTable;
use crate::keys::{KeyRefreshPhase, Subnet};
use crate::SubnetError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Network security credential
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Credential {
    /// Managed flooding
    #[default]
    Flooding = 0,
    /// Friendship
    Friendship = 1,
    /// Directed forwarding
    Directed = 2,
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Flooding => write!(f, "flooding"),
            Credential::Friendship => write!(f, "friendship"),
            Credential::Directed => write!(f, "directed"),
        }
    }
}

bitflags! {
    /// Per-send tags steering credential and bearer selection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SendTag: u8 {
        /// Message is sent segmented
        const SEGMENTED = 1 << 0;
        /// Credential must not fall back to managed flooding
        const IMMUTABLE_CRED = 1 << 1;
        /// Message is relayed (or may be, with TTL 1/2)
        const RELAY = 1 << 3;
        /// Message belongs to a friendship exchange
        const FRIENDSHIP = 1 << 4;
    }
}

/// Material chosen for transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSecurity {
    /// Credential actually used
    pub credential: Credential,
    /// Network material
    pub security: NetSecurity,
}

/// Resolve transmit material for a PDU to `dst` on a subnet.
///
/// `new_key` selects the managed flooding and directed generation;
/// friendship material always follows the subnet key refresh flag.
pub fn resolve_tx(
    sub: &Subnet,
    friends: &FriendCredTable,
    requested: Credential,
    dst: u16,
    tag: SendTag,
    new_key: bool,
) -> Result<TxSecurity, SubnetError> {
    let keys = &sub.keys[new_key as usize];

    let resolved = match requested {
        Credential::Friendship => friends.for_dst(sub, dst).copied(),
        Credential::Directed if sub.directed_forwarding => Some(keys.directed),
        Credential::Directed => None,
        Credential::Flooding => Some(keys.flooding),
    };
    if let Some(security) = resolved {
        return Ok(TxSecurity {
            credential: requested,
            security,
        });
    }

    if tag.contains(SendTag::IMMUTABLE_CRED) {
        return Err(SubnetError::NoCredential {
            net_idx: sub.net_idx,
            credential: requested,
        });
    }
    Ok(TxSecurity {
        credential: Credential::Flooding,
        security: keys.flooding,
    })
}

/// One trial-decryption candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Subnet the material belongs to
    pub net_idx: u16,
    /// Credential kind
    pub credential: Credential,
    /// Material is from the new key generation
    pub new_key: bool,
    /// Network material
    pub security: NetSecurity,
}

/// Ordered candidates
pub type Candidates = SmallVec<[Candidate; 8]>;

/// Candidates of one subnet whose NID equals `nid`, in trial order
pub fn rx_candidates(sub: &Subnet, friends: &FriendCredTable, nid: u8, out: &mut Candidates) {
    let both = sub.kr_phase != KeyRefreshPhase::Normal;
    let generations = if both { 2 } else { 1 };
    let mut push = |credential, new_key, security: &NetSecurity| {
        if security.nid == nid {
            out.push(Candidate {
                net_idx: sub.net_idx,
                credential,
                new_key,
                security: *security,
            });
        }
    };

    for cred in friends.iter().filter(|c| c.net_idx == sub.net_idx) {
        for (gen, security) in cred.cred.iter().enumerate().take(generations) {
            push(Credential::Friendship, gen == 1, security);
        }
    }

    if sub.directed_forwarding {
        for (new_key, keys) in sub.rx_generations() {
            push(Credential::Directed, new_key, &keys.directed);
        }
    }

    for (new_key, keys) in sub.rx_generations() {
        push(Credential::Flooding, new_key, &keys.flooding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MeshCrypto, SimCrypto};
    use crate::friend::FriendRole;
    use crate::keys::NetKeys;

    fn subnet(crypto: &SimCrypto) -> Subnet {
        Subnet::new(0, NetKeys::derive(crypto, &[9; 16]).unwrap())
    }

    #[test]
    fn test_rx_order_normal_phase() {
        let crypto = SimCrypto::new();
        let mut sub = subnet(&crypto);
        sub.directed_forwarding = true;
        let mut friends = FriendCredTable::new(1);
        friends
            .create(&crypto, &sub, 0x0001, 0x0002, FriendRole::Friend, 0, 0)
            .unwrap();

        // Align every NID with the friendship one so only the order differs
        let nid = friends.iter().next().unwrap().cred[0].nid;
        for keys in sub.keys.iter_mut() {
            keys.flooding.nid = nid;
            keys.directed.nid = nid;
        }

        let mut out = Candidates::new();
        rx_candidates(&sub, &friends, nid, &mut out);
        let kinds: Vec<Credential> = out.iter().map(|c| c.credential).collect();
        assert_eq!(
            kinds,
            vec![
                Credential::Friendship,
                Credential::Directed,
                Credential::Flooding
            ]
        );
        assert!(out.iter().all(|c| !c.new_key));

        friends.clear();
        out.clear();
        sub.directed_forwarding = false;
        rx_candidates(&sub, &friends, nid, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].credential, Credential::Flooding);
    }

    #[test]
    fn test_rx_both_generations_during_refresh() {
        let crypto = SimCrypto::new();
        let mut sub = subnet(&crypto);
        sub.keys[1] = NetKeys::derive(&crypto, &[10; 16]).unwrap();
        sub.keys[1].flooding.nid = sub.keys[0].flooding.nid;
        sub.kr_phase = KeyRefreshPhase::Phase2;

        let mut out = Candidates::new();
        rx_candidates(&sub, &FriendCredTable::new(0), sub.keys[0].flooding.nid, &mut out);
        let gens: Vec<bool> = out.iter().map(|c| c.new_key).collect();
        assert_eq!(gens, vec![false, true]);
    }

    #[test]
    fn test_rx_filters_nid() {
        let crypto = SimCrypto::new();
        let sub = subnet(&crypto);
        let other = (sub.keys[0].flooding.nid + 1) & 0x7f;
        let mut out = Candidates::new();
        rx_candidates(&sub, &FriendCredTable::new(0), other, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_resolve_tx_fallback() {
        let crypto = SimCrypto::new();
        let sub = subnet(&crypto);
        let mut friends = FriendCredTable::new(1);

        let tx = resolve_tx(&sub, &friends, Credential::Friendship, 0x0002, SendTag::empty(), false)
            .unwrap();
        assert_eq!(tx.credential, Credential::Flooding);
        assert_eq!(tx.security, sub.keys[0].flooding);

        assert!(matches!(
            resolve_tx(&sub, &friends, Credential::Friendship, 0x0002, SendTag::IMMUTABLE_CRED, false),
            Err(SubnetError::NoCredential { .. })
        ));

        friends
            .create(&crypto, &sub, 0x0001, 0x0002, FriendRole::LowPower, 3, 4)
            .unwrap();
        let tx = resolve_tx(&sub, &friends, Credential::Friendship, 0x0002, SendTag::IMMUTABLE_CRED, false)
            .unwrap();
        assert_eq!(tx.credential, Credential::Friendship);
    }

    #[test]
    fn test_resolve_tx_friendship_follows_destination() {
        let crypto = SimCrypto::new();
        let sub = subnet(&crypto);
        let mut friends = FriendCredTable::new(2);
        friends
            .create(&crypto, &sub, 0x0001, 0x0100, FriendRole::Friend, 1, 2)
            .unwrap();
        friends
            .create(&crypto, &sub, 0x0001, 0x0200, FriendRole::Friend, 3, 4)
            .unwrap();

        for lpn in [0x0100, 0x0200] {
            let tx = resolve_tx(&sub, &friends, Credential::Friendship, lpn, SendTag::empty(), false)
                .unwrap();
            assert_eq!(tx.credential, Credential::Friendship);
            assert_eq!(tx.security, *friends.for_dst(&sub, lpn).unwrap());
        }
        assert_ne!(friends.for_dst(&sub, 0x0100), friends.for_dst(&sub, 0x0200));

        // Not one of our Low Power nodes
        let tx = resolve_tx(&sub, &friends, Credential::Friendship, 0x0300, SendTag::empty(), false)
            .unwrap();
        assert_eq!(tx.credential, Credential::Flooding);
        assert!(resolve_tx(&sub, &friends, Credential::Friendship, 0x0300, SendTag::IMMUTABLE_CRED, false)
            .is_err());
    }

    #[test]
    fn test_resolve_tx_directed() {
        let crypto = SimCrypto::new();
        let mut sub = subnet(&crypto);
        let friends = FriendCredTable::new(0);

        let tx = resolve_tx(&sub, &friends, Credential::Directed, 0x0002, SendTag::empty(), false)
            .unwrap();
        assert_eq!(tx.credential, Credential::Flooding);
        assert_eq!(tx.security, sub.keys[0].flooding);
        assert!(matches!(
            resolve_tx(&sub, &friends, Credential::Directed, 0x0002, SendTag::IMMUTABLE_CRED, false),
            Err(SubnetError::NoCredential {
                credential: Credential::Directed,
                ..
            })
        ));

        sub.directed_forwarding = true;
        let tx = resolve_tx(&sub, &friends, Credential::Directed, 0x0002, SendTag::IMMUTABLE_CRED, false)
            .unwrap();
        assert_eq!(tx.credential, Credential::Directed);
        assert_eq!(tx.security, crypto.k2(&[9; 16], &[2]).unwrap());
    }
}
