//! Transport control message routing and Heartbeat handling.

use crate::TransportError;
use bytes::{Bytes, BytesMut};
use mesh_net::NetRx;
use mesh_wire::{CtlOp, Features, Heartbeat};
use tracing::{debug, warn};

/// Where a control message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlRoute {
    /// Segment Acknowledgment for the TX pool
    Ack,
    /// Heartbeat for the subscription filter
    Heartbeat,
    /// Friendship message for the Friend queue
    Friend(CtlOp),
    /// Anything else is offered to the upper layers
    Upper(u8),
    /// Friend Server opcode on a node without the Friend feature
    Unhandled(u8),
}

/// Classify a control opcode
pub fn route(opcode: u8, friend_enabled: bool) -> CtlRoute {
    match CtlOp::try_from(opcode) {
        Ok(CtlOp::Ack) => CtlRoute::Ack,
        Ok(CtlOp::Heartbeat) => CtlRoute::Heartbeat,
        Ok(op) if op.is_friend_server_op() && !friend_enabled => CtlRoute::Unhandled(opcode),
        Ok(op) => CtlRoute::Friend(op),
        Err(_) => CtlRoute::Upper(opcode),
    }
}

/// Heartbeat received from a subscribed source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRx {
    /// Source of the heartbeat
    pub src: u16,
    /// Destination it was sent to
    pub dst: u16,
    /// Hops travelled
    pub hops: u8,
    /// Sender features
    pub features: Features,
}

/// Parse a Heartbeat.
///
/// Returns `Ok(None)` when `rx.dst` is not the subscribed destination.
pub fn heartbeat_recv(
    rx: &NetRx,
    payload: &Bytes,
    sub_dst: u16,
) -> Result<Option<HeartbeatRx>, TransportError> {
    let mut buf = payload.clone();
    let hb = Heartbeat::decode(&mut buf).map_err(|e| {
        warn!("Too short heartbeat message");
        TransportError::Wire(e)
    })?;

    if rx.dst != sub_dst {
        debug!("Ignoring heartbeat to non-subscribed destination 0x{:04x}", rx.dst);
        return Ok(None);
    }

    let hops = hb.hops(rx.ttl);
    debug!(
        "src 0x{:04x} TTL {} InitTTL {} ({} hop{}) feat 0x{:04x}",
        rx.src,
        rx.ttl,
        hb.init_ttl,
        hops,
        if hops == 1 { "" } else { "s" },
        hb.features.bits()
    );

    Ok(Some(HeartbeatRx {
        src: rx.src,
        dst: rx.dst,
        hops,
        features: hb.features,
    }))
}

/// Heartbeat parameters for publication
pub fn heartbeat_pdu(init_ttl: u8, features: Features) -> Bytes {
    let mut buf = BytesMut::with_capacity(Heartbeat::LEN);
    Heartbeat { init_ttl, features }.encode(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_net::{NetIf, TTL_DEFAULT};
    use mesh_subnet::Credential;

    fn rx(dst: u16, ttl: u8) -> NetRx {
        NetRx {
            net_idx: 0,
            net_if: NetIf::Adv,
            credential: Credential::Flooding,
            new_key: false,
            old_iv: false,
            iv_index: 0,
            ctl: true,
            ttl,
            send_ttl: TTL_DEFAULT,
            seq: 1,
            src: 0x0005,
            dst,
            local_match: true,
            friend_match: false,
            msg_cache_idx: None,
        }
    }

    #[test]
    fn test_route() {
        assert_eq!(route(0x00, false), CtlRoute::Ack);
        assert_eq!(route(0x0a, false), CtlRoute::Heartbeat);
        assert_eq!(route(0x03, true), CtlRoute::Friend(CtlOp::FriendReq));
        assert_eq!(route(0x03, false), CtlRoute::Unhandled(0x03));
        // LPN side messages always reach the friendship collaborator
        assert_eq!(route(0x04, false), CtlRoute::Friend(CtlOp::FriendOffer));
        assert_eq!(route(0x0b, false), CtlRoute::Upper(0x0b));
    }

    #[test]
    fn test_heartbeat_hops() {
        let pdu = heartbeat_pdu(7, Features::RELAY | Features::FRIEND);
        let hb = heartbeat_recv(&rx(0xc000, 5), &pdu, 0xc000).unwrap().unwrap();
        assert_eq!(hb.hops, 3);
        assert_eq!(hb.src, 0x0005);
        assert_eq!(hb.features, Features::RELAY | Features::FRIEND);
    }

    #[test]
    fn test_heartbeat_filtered_and_malformed() {
        let pdu = heartbeat_pdu(7, Features::empty());
        assert_eq!(heartbeat_recv(&rx(0xc001, 5), &pdu, 0xc000).unwrap(), None);
        assert!(heartbeat_recv(&rx(0xc000, 5), &pdu.slice(..2), 0xc000).is_err());
    }
}
