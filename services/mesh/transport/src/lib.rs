//! Lower transport for the mesh: segmentation, reassembly, acknowledgments
//! and control message dispatch, on top of the network layer.
//!
//! The pools in [`seg_tx`] and [`seg_rx`] are plain state machines. They
//! never call the network layer or run user callbacks themselves; they hand
//! back the work to do and [`MeshStack`] performs it outside their locks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_net::{ManualScheduler, NetConfig, NoEvents, Network, RecordingBearer};
//! use mesh_storage::MemorySettings;
//! use mesh_subnet::SimCrypto;
//! use mesh_transport::{MeshStack, MsgCtx, NoFriend, StackConfig, UpperTransport};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl UpperTransport for Printer {
//!     fn deliver_access(&self, rx: &mesh_net::NetRx, app_idx: u16, payload: bytes::Bytes) {
//!         println!("0x{:04x} -> 0x{:04x} app 0x{:03x}: {:?}", rx.src, rx.dst, app_idx, payload);
//!     }
//! }
//!
//! # fn example() -> Result<(), mesh_transport::TransportError> {
//! let config = NetConfig { primary_addr: 0x0001, ..Default::default() };
//! let net = Network::new(
//!     config,
//!     Arc::new(SimCrypto),
//!     Arc::new(RecordingBearer::new()),
//!     Arc::new(ManualScheduler::new()),
//!     Arc::new(MemorySettings::new()),
//!     Arc::new(NoEvents),
//! );
//! let stack = MeshStack::new(StackConfig::default(), net, Arc::new(Printer), Arc::new(NoFriend));
//! stack.net().create(0, 0, &[0x11; 16], 0)?;
//! stack.net().subnets_mut().app_key_add(0, 0, &[0x22; 16])?;
//!
//! let ctx = MsgCtx::new(0, 0, 0x0001, 0x0002);
//! stack.send(&ctx, b"hello", None)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod sar;
pub mod seg_rx;
pub mod seg_tx;
pub mod stack;
pub mod upper;

use mesh_net::NetError;
use mesh_subnet::{CryptoError, SubnetError};
use mesh_wire::WireError;
use thiserror::Error;

// Re-export main types
pub use control::{CtlRoute, HeartbeatRx};
pub use sar::SarConfig;
pub use seg_rx::{AckRequest, RxPool, SegRecv, SegStatus, DEFAULT_RX_SLOTS, RX_SDU_MAX};
pub use seg_tx::{SegmentedTx, TxAction, TxCompletion, TxPool, DEFAULT_TX_SLOTS};
pub use stack::{MeshStack, MsgCtx, StackConfig};
pub use upper::{FriendPduKind, FriendQueue, NoFriend, SendCallback, UpperTransport};

/// Lower transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Malformed transport PDU
    #[error("invalid transport PDU: {0}")]
    InvalidPdu(&'static str),

    /// No key decrypts the payload
    #[error("no matching key")]
    NoCredentialMatch,

    /// Message rejected by replay protection
    #[error("replay rejected")]
    ReplayRejected,

    /// Reassembled message would exceed the receive buffer
    #[error("message too large: {0} bytes")]
    Oversized(usize),

    /// Friend queue cannot take the message
    #[error("no space in friend queue")]
    NoFriendQueueSpace,

    /// A segmented transfer between the same endpoints is in progress
    #[error("segmented transfer to the destination already in progress")]
    Busy,

    /// Retransmissions exhausted without a complete acknowledgment
    #[error("transfer timed out")]
    Timeout,

    /// The peer cancelled the transfer or the transfer was reset
    #[error("transfer cancelled")]
    Cancelled,

    /// No free slot
    #[error("out of segmentation slots")]
    NoMemory,

    /// Message already received completely
    #[error("message already received")]
    Already,

    /// Nothing handles the request
    #[error("not found")]
    NotFound,

    /// Message discarded; the network message cache entry is rolled back
    #[error("try again later")]
    Again,

    /// Send failure reported by the bearer
    #[error("I/O error: {0}")]
    Io(String),

    /// Network layer error
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Wire format error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Subnet layer error
    #[error("subnet error: {0}")]
    Subnet(#[from] SubnetError),

    /// Crypto collaborator error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
