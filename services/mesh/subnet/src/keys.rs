//! Key material derived from NetKeys and AppKeys.

use crate::crypto::{CryptoError, Key, MeshCrypto, NetSecurity};
use serde::{Deserialize, Serialize};

/// k2 parameter for managed flooding material
const P_FLOODING: [u8; 1] = [0x00];

/// k2 parameter for directed forwarding material
const P_DIRECTED: [u8; 1] = [0x02];

/// Everything derived from one NetKey generation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetKeys {
    /// The NetKey itself
    pub net: Key,
    /// Managed flooding credentials
    pub flooding: NetSecurity,
    /// Directed forwarding credentials
    pub directed: NetSecurity,
    /// Network ID
    pub net_id: [u8; 8],
    /// Node identity key
    pub identity: Key,
    /// Secure network beacon key
    pub beacon: Key,
    /// Private beacon key
    pub private_beacon: Key,
}

impl NetKeys {
    /// Derive the full key set for a NetKey
    pub fn derive(crypto: &dyn MeshCrypto, net_key: &Key) -> Result<Self, CryptoError> {
        Ok(Self {
            net: *net_key,
            flooding: crypto.k2(net_key, &P_FLOODING)?,
            directed: crypto.k2(net_key, &P_DIRECTED)?,
            net_id: crypto.k3(net_key)?,
            identity: crypto.identity_key(net_key)?,
            beacon: crypto.beacon_key(net_key)?,
            private_beacon: crypto.private_beacon_key(net_key)?,
        })
    }
}

/// Key refresh phase of a subnet
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// Single key in use
    #[default]
    Normal = 0,
    /// New key distributed, old key used for transmission
    Phase1 = 1,
    /// New key used for transmission, old key still accepted
    Phase2 = 2,
}

/// Node identity advertising state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeIdentity {
    /// Supported but not advertising
    #[default]
    Stopped,
    /// Advertising node identity
    Running,
    /// Not supported by this node
    NotSupported,
}

/// One AppKey generation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppKeyGen {
    /// Application key identifier
    pub aid: u8,
    /// Key value
    pub key: Key,
}

impl AppKeyGen {
    /// Derive the AID for a key
    pub fn derive(crypto: &dyn MeshCrypto, key: &Key) -> Result<Self, CryptoError> {
        Ok(Self {
            aid: crypto.k4(key)?,
            key: *key,
        })
    }
}

/// AppKey bound to a subnet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppKey {
    /// AppKey index
    pub app_idx: u16,
    /// Bound NetKey index
    pub net_idx: u16,
    /// Old and new generations
    pub keys: [AppKeyGen; 2],
    /// A new generation has been distributed
    pub updated: bool,
}

impl AppKey {
    /// Generation to transmit with in the given phase of the bound subnet
    pub fn tx_key(&self, phase: KeyRefreshPhase) -> &AppKeyGen {
        if phase == KeyRefreshPhase::Phase2 && self.updated {
            &self.keys[1]
        } else {
            &self.keys[0]
        }
    }

    /// Generations to try on receive, old first
    pub fn rx_keys(&self) -> impl Iterator<Item = &AppKeyGen> {
        let count = if self.updated { 2 } else { 1 };
        self.keys.iter().take(count)
    }
}

/// Subnet state
#[derive(Clone, Debug)]
pub struct Subnet {
    /// NetKey index
    pub net_idx: u16,
    /// Old and new key generations
    pub keys: [NetKeys; 2],
    /// Key refresh flag as advertised in beacons
    pub kr_flag: bool,
    /// Key refresh phase
    pub kr_phase: KeyRefreshPhase,
    /// Node identity state
    pub node_id: NodeIdentity,
    /// Directed forwarding enabled on this subnet
    pub directed_forwarding: bool,
    /// Authentication value of the current secure network beacon
    pub beacon_auth: [u8; 8],
}

impl Subnet {
    /// Create a subnet from a freshly derived key set
    pub fn new(net_idx: u16, keys: NetKeys) -> Self {
        Self {
            net_idx,
            keys: [keys.clone(), keys],
            kr_flag: false,
            kr_phase: KeyRefreshPhase::Normal,
            node_id: NodeIdentity::Stopped,
            directed_forwarding: false,
            beacon_auth: [0; 8],
        }
    }

    /// Key generation used for transmission
    pub fn tx_keys(&self) -> &NetKeys {
        &self.keys[self.kr_flag as usize]
    }

    /// Key generations accepted on receive, with the `new_key` marker
    pub fn rx_generations(&self) -> impl Iterator<Item = (bool, &NetKeys)> {
        let count = if self.kr_phase == KeyRefreshPhase::Normal {
            1
        } else {
            2
        };
        self.keys.iter().enumerate().take(count).map(|(i, k)| (i == 1, k))
    }

    /// Beacon flags for this subnet
    pub fn net_flags(&self, ivu_in_progress: bool) -> u8 {
        let mut flags = 0;
        if self.kr_flag {
            flags |= crate::NET_FLAG_KR;
        }
        if ivu_in_progress {
            flags |= crate::NET_FLAG_IVU;
        }
        flags
    }

    /// Recompute the secure network beacon authentication value
    pub fn update_beacon_auth(
        &mut self,
        crypto: &dyn MeshCrypto,
        iv_index: u32,
        ivu_in_progress: bool,
    ) -> Result<(), CryptoError> {
        let flags = self.net_flags(ivu_in_progress);
        let keys = self.tx_keys();
        self.beacon_auth = crypto.beacon_auth(&keys.beacon, flags, &keys.net_id, iv_index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SimCrypto;

    #[test]
    fn test_net_keys_derive() {
        let crypto = SimCrypto::new();
        let keys = NetKeys::derive(&crypto, &[1; 16]).unwrap();
        assert_eq!(keys.net, [1; 16]);
        assert_eq!(keys.flooding, crypto.k2(&[1; 16], &[0]).unwrap());
        assert_eq!(keys.directed, crypto.k2(&[1; 16], &[2]).unwrap());
        assert_ne!(keys.beacon, keys.identity);
    }

    #[test]
    fn test_app_key_generation_selection() {
        let mut key = AppKey {
            app_idx: 0,
            net_idx: 0,
            keys: [
                AppKeyGen { aid: 1, key: [1; 16] },
                AppKeyGen { aid: 2, key: [2; 16] },
            ],
            updated: false,
        };
        assert_eq!(key.tx_key(KeyRefreshPhase::Phase2).aid, 1);
        assert_eq!(key.rx_keys().count(), 1);

        key.updated = true;
        assert_eq!(key.tx_key(KeyRefreshPhase::Phase1).aid, 1);
        assert_eq!(key.tx_key(KeyRefreshPhase::Phase2).aid, 2);
        assert_eq!(key.rx_keys().count(), 2);
    }

    #[test]
    fn test_subnet_generations() {
        let crypto = SimCrypto::new();
        let mut sub = Subnet::new(0, NetKeys::derive(&crypto, &[1; 16]).unwrap());
        assert_eq!(sub.rx_generations().count(), 1);
        assert_eq!(sub.net_flags(false), 0);

        sub.keys[1] = NetKeys::derive(&crypto, &[2; 16]).unwrap();
        sub.kr_phase = KeyRefreshPhase::Phase2;
        sub.kr_flag = true;
        let gens: Vec<bool> = sub.rx_generations().map(|(new_key, _)| new_key).collect();
        assert_eq!(gens, vec![false, true]);
        assert_eq!(sub.tx_keys().net, [2; 16]);
        assert_eq!(sub.net_flags(true), 0x03);
    }
}
