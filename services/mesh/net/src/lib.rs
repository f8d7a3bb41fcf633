//! Network layer for the mesh: PDU encode/decode, relaying, bearers and timers.
//!
//! [`Network`] is the per-node context. It owns the subnet table, the IV
//! index state, the replay protection list and the receive caches, and it
//! talks to three collaborators:
//!
//! - a [`MeshCrypto`](mesh_subnet::MeshCrypto) provider for key derivation,
//!   encryption and obfuscation,
//! - a [`BearerSink`] that puts encoded PDUs on the air,
//! - a [`Scheduler`] that delivers [`TimerEvent`]s back to the stack.
//!
//! Nothing in this crate blocks or spawns; the driver decides how events and
//! bearer completions are delivered.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bearer;
pub mod network;
pub mod relay;
pub mod timer;

use mesh_storage::StorageError;
use mesh_subnet::{CryptoError, SubnetError};
use mesh_wire::WireError;
use thiserror::Error;

// Re-export main types
pub use bearer::{
    BearerSink, Bearers, NetIf, RecordingBearer, RelayQueue, SendToken, SentPdu, Transmit,
    RELAY_THROTTLED,
};
pub use network::{
    BeaconOutcome, Encoded, NetConfig, NetEvents, NetRx, NetTx, Network, NoEvents, SendStatus,
};
pub use relay::{DropReason, RelayDecision, RelayFeatures, RelayPlan, RelayStats};
pub use timer::{ManualScheduler, Scheduler, SlotId, SlotTimer, TimerEvent, TimerHandle};

/// TTL value asking for the configured default TTL
pub const TTL_DEFAULT: u8 = 0xff;

/// Network layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Malformed or filtered PDU
    #[error("invalid PDU: {0}")]
    InvalidPdu(&'static str),

    /// Wire format error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// No known credential decrypts the PDU
    #[error("no matching credential")]
    NoCredentialMatch,

    /// Same advertisement heard before
    #[error("duplicate advertisement")]
    Duplicate,

    /// Message already in the network message cache
    #[error("message already seen")]
    Already,

    /// Destination address is unassigned
    #[error("destination address is unassigned")]
    DestinationUnassigned,

    /// Destination address is in the RFU range
    #[error("destination address 0x{0:04x} is RFU")]
    DestinationRfu(u16),

    /// PDU originated by one of our own elements came back
    #[error("locally originated PDU from 0x{0:04x}")]
    LocalSource(u16),

    /// Message rejected by replay protection
    #[error("replay rejected")]
    ReplayRejected,

    /// Network PDU would not fit
    #[error("PDU too large: {0} bytes")]
    Oversized(usize),

    /// No bearer accepted the PDU
    #[error("PDU not sent: src 0x{src:04x} dst 0x{dst:04x} ttl {ttl}")]
    NotSent {
        /// Source address
        src: u16,
        /// Destination address
        dst: u16,
        /// TTL
        ttl: u8,
    },

    /// Node is not provisioned
    #[error("not provisioned")]
    NotProvisioned,

    /// Operation requires IV update test mode
    #[error("IV update test mode not enabled")]
    NotPermitted,

    /// Subnet layer error
    #[error("subnet error: {0}")]
    Subnet(#[from] SubnetError),

    /// Crypto collaborator error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Bearer failure
    #[error("bearer error: {0}")]
    Io(String),

    /// Settings store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for NetError {
    fn from(e: StorageError) -> Self {
        NetError::Storage(e.to_string())
    }
}
