//! Interfaces between the lower transport and its neighbours: the upper
//! layers that consume delivered messages and the Friend queue.

use crate::TransportError;
use bytes::Bytes;
use mesh_net::{NetRx, NetTx};
use mesh_wire::Features;

/// Completion of a send request
pub type SendCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Consumer of messages delivered by the lower transport
pub trait UpperTransport: Send + Sync {
    /// A decrypted access payload.
    ///
    /// `app_idx` is [`mesh_subnet::KEY_DEV`] for device-key messages.
    fn deliver_access(&self, rx: &NetRx, app_idx: u16, payload: Bytes);

    /// A control message the transport does not handle itself.
    ///
    /// Returns whether the opcode was recognised.
    fn deliver_control(&self, _rx: &NetRx, _opcode: u8, _payload: Bytes) -> bool {
        false
    }

    /// A Heartbeat from a subscribed source
    fn heartbeat_received(&self, _src: u16, _dst: u16, _hops: u8, _features: Features) {}
}

/// How much of a message a Friend queue entry covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendPduKind {
    /// Unsegmented message
    Single,
    /// Segment of a message still being reassembled
    Partial,
    /// Segment of a message that is now complete
    Complete,
}

/// Friend queue collaborator.
///
/// A Friend node stores messages for its Low Power nodes; a node without the
/// Friend feature uses [`NoFriend`].
pub trait FriendQueue: Send + Sync {
    /// Whether the queues of the LPNs matching `dst` can take `count` more PDUs
    fn has_space(&self, net_idx: u16, src: u16, dst: u16, seq_auth: Option<u64>, count: usize)
        -> bool;

    /// Offer a locally originated PDU; returns whether a queue took it
    fn enqueue_tx(&self, tx: &NetTx, seq_auth: Option<u64>, count: usize, lower: &Bytes) -> bool;

    /// Store a received PDU for the LPNs it is addressed to
    fn enqueue_rx(&self, rx: &NetRx, kind: FriendPduKind, seq_auth: Option<u64>, count: usize, lower: &Bytes);

    /// Whether `dst` belongs to a Low Power node we are Friend for
    fn match_lpn(&self, net_idx: u16, dst: u16) -> bool;

    /// Handle a friendship control message
    fn ctl_recv(&self, rx: &NetRx, opcode: u8, payload: &Bytes) -> Result<(), TransportError>;

    /// Drop stored segments of a message whose reassembly was abandoned
    fn clear_incomplete(&self, net_idx: u16, src: u16, dst: u16, seq_auth: u64);

    /// Whether a Low Power node should discard this message and let a later
    /// poll fetch it again
    fn lpn_reject(&self, _rx: &NetRx) -> bool {
        false
    }
}

/// Friend queue of a node without the Friend feature
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFriend;

impl FriendQueue for NoFriend {
    fn has_space(&self, _: u16, _: u16, _: u16, _: Option<u64>, _: usize) -> bool {
        true
    }

    fn enqueue_tx(&self, _: &NetTx, _: Option<u64>, _: usize, _: &Bytes) -> bool {
        false
    }

    fn enqueue_rx(&self, _: &NetRx, _: FriendPduKind, _: Option<u64>, _: usize, _: &Bytes) {}

    fn match_lpn(&self, _: u16, _: u16) -> bool {
        false
    }

    fn ctl_recv(&self, _: &NetRx, _: u8, _: &Bytes) -> Result<(), TransportError> {
        Err(TransportError::NotFound)
    }

    fn clear_incomplete(&self, _: u16, _: u16, _: u16, _: u64) {}
}
