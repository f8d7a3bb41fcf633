//! Subnets, key refresh, IV index and network credentials for the mesh.
//!
//! This crate owns everything a node knows about its subnets: the key
//! material derived from each NetKey generation, friendship credentials,
//! the key refresh phase machine, and the IV index state machine. It also
//! resolves which credential protects an outgoing PDU and which candidates
//! to try when decrypting an incoming one.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credential;
pub mod crypto;
pub mod friend;
pub mod iv;
pub mod keys;
pub mod table;

use thiserror::Error;

pub use credential::{Candidate, Candidates, Credential, SendTag, TxSecurity};
pub use crypto::{AppNonce, CryptoError, Key, MeshCrypto, NetSecurity, SimCrypto};
pub use friend::{FriendCred, FriendCredTable, FriendRole};
pub use iv::{IvConfig, IvFlags, IvState, IvTick, IvTransition};
pub use keys::{AppKey, AppKeyGen, KeyRefreshPhase, NetKeys, NodeIdentity, Subnet};
pub use table::{SubnetConfig, SubnetTable};

/// Key refresh flag in secure network beacons
pub const NET_FLAG_KR: u8 = 0x01;

/// IV update flag in secure network beacons
pub const NET_FLAG_IVU: u8 = 0x02;

/// Primary NetKey index
pub const KEY_PRIMARY: u16 = 0x0000;

/// AppKey index selecting the device key
pub const KEY_DEV: u16 = 0xfffe;

/// Unused key index
pub const KEY_UNUSED: u16 = 0xffff;

/// Subnet layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubnetError {
    /// No subnet with this NetKey index
    #[error("subnet 0x{0:03x} not found")]
    NotFound(u16),

    /// Key index already in use
    #[error("key index 0x{0:03x} already exists")]
    Exists(u16),

    /// Table is full
    #[error("no free slot")]
    NoFreeSlot,

    /// No friendship credential for the peer
    #[error("no friend credential for 0x{addr:04x} on subnet 0x{net_idx:03x}")]
    NoFriendCred {
        /// NetKey index
        net_idx: u16,
        /// Peer address
        addr: u16,
    },

    /// Requested credential is not available and may not be substituted
    #[error("{credential} credential unavailable on subnet 0x{net_idx:03x}")]
    NoCredential {
        /// NetKey index
        net_idx: u16,
        /// Requested credential
        credential: Credential,
    },

    /// No AppKey with this index
    #[error("app key 0x{0:03x} not found")]
    AppKeyNotFound(u16),

    /// Operation not allowed in the current key refresh phase
    #[error("invalid key refresh phase {phase:?} on subnet 0x{net_idx:03x}")]
    InvalidPhase {
        /// NetKey index
        net_idx: u16,
        /// Current phase
        phase: KeyRefreshPhase,
    },

    /// Crypto collaborator failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
