//! Relay decision logic

use crate::bearer::{Bearers, NetIf, RelayQueue, Transmit, RELAY_THROTTLED};
use mesh_subnet::{Credential, SendTag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Feature states that gate retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFeatures {
    /// Relay feature enabled
    pub relay: bool,
    /// GATT proxy feature enabled
    pub proxy: bool,
    /// Friend feature enabled
    pub friend: bool,
}

impl Default for RelayFeatures {
    fn default() -> Self {
        Self {
            relay: true,
            proxy: false,
            friend: false,
        }
    }
}

/// Relay decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Retransmit according to the plan
    Forward(RelayPlan),
    /// Do not retransmit
    Drop(DropReason),
}

/// How to retransmit a PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPlan {
    /// Outbound bearers
    pub bearers: Bearers,
    /// Outbound credential
    pub credential: Credential,
    /// Tags added to the PDU
    pub tag: SendTag,
    /// Transmit parameters
    pub xmit: Transmit,
}

/// Reason for not relaying a PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// TTL too low to be relayed
    TtlExpired,
    /// TTL 2 without the relay tag
    NotTaggedRelay,
    /// No row of the retransmission table matched
    NoBearer,
    /// Outbound credential cannot be used for relaying
    NoCredential,
    /// Re-encryption failed
    Crypto,
    /// Bearer refused the PDU
    Bearer,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::TtlExpired => write!(f, "TTL expired"),
            DropReason::NotTaggedRelay => write!(f, "TTL 2 not tagged as relay"),
            DropReason::NoBearer => write!(f, "no outbound bearer"),
            DropReason::NoCredential => write!(f, "no outbound credential"),
            DropReason::Crypto => write!(f, "re-encryption failed"),
            DropReason::Bearer => write!(f, "bearer rejected"),
        }
    }
}

/// Inputs of a relay decision
#[derive(Debug, Clone, Copy)]
pub struct RelayContext {
    /// Inbound interface
    pub net_if: NetIf,
    /// Inbound credential
    pub credential: Credential,
    /// Received TTL
    pub ttl: u8,
}

/// Look up the retransmission table.
///
/// Returns the outbound bearers and credential plus any tag to add, or
/// `None` when no row matches.
fn retransmission(ctx: &RelayContext, features: &RelayFeatures) -> Option<(Bearers, Credential, SendTag)> {
    match (ctx.net_if, ctx.credential) {
        (NetIf::Adv, Credential::Flooding) => {
            let mut bearers = Bearers::empty();
            let mut tag = SendTag::empty();
            if features.relay {
                bearers |= Bearers::ADV;
                tag |= SendTag::RELAY;
            }
            if features.proxy {
                bearers |= Bearers::GATT;
            }
            (!bearers.is_empty()).then_some((bearers, Credential::Flooding, tag))
        }
        (NetIf::Adv, Credential::Friendship) if features.friend => {
            Some((Bearers::ALL, Credential::Flooding, SendTag::empty()))
        }
        (NetIf::Proxy, Credential::Flooding) if features.proxy => {
            Some((Bearers::ALL, Credential::Flooding, SendTag::empty()))
        }
        _ => None,
    }
}

/// Decide whether and how to relay a received PDU
pub fn decide(
    ctx: &RelayContext,
    features: &RelayFeatures,
    net_transmit: Transmit,
    relay_retransmit: Transmit,
    queue: RelayQueue,
) -> RelayDecision {
    // Local PDUs with TTL 1 only reach local elements
    if ctx.net_if == NetIf::Local {
        if ctx.ttl == 1 {
            return RelayDecision::Drop(DropReason::TtlExpired);
        }
    } else if ctx.ttl < 1 {
        return RelayDecision::Drop(DropReason::TtlExpired);
    }

    let Some((bearers, credential, tag)) = retransmission(ctx, features) else {
        return RelayDecision::Drop(DropReason::NoBearer);
    };

    if !matches!(credential, Credential::Flooding | Credential::Directed) {
        return RelayDecision::Drop(DropReason::NoCredential);
    }

    if ctx.ttl == 1 {
        return RelayDecision::Drop(DropReason::TtlExpired);
    }

    if ctx.ttl == 2 && !tag.contains(SendTag::RELAY) {
        return RelayDecision::Drop(DropReason::NotTaggedRelay);
    }

    // Relay retransmit only applies to adv to adv relaying
    let mut xmit = if ctx.net_if == NetIf::Adv && ctx.credential != Credential::Friendship {
        relay_retransmit
    } else {
        net_transmit
    };

    if queue.congested() {
        xmit = RELAY_THROTTLED;
    }

    RelayDecision::Forward(RelayPlan {
        bearers,
        credential,
        tag,
        xmit,
    })
}

/// Relay counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayStats {
    /// Number of relay decisions made
    pub decisions_made: u64,
    /// Number of PDUs relayed
    pub forwarded: u64,
    /// Number of PDUs not relayed
    pub dropped: u64,
    /// Relays sent with the throttled transmit
    pub throttled: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

impl RelayStats {
    /// Account a relayed PDU
    pub fn record_forward(&mut self, throttled: bool) {
        self.decisions_made += 1;
        self.forwarded += 1;
        if throttled {
            self.throttled += 1;
        }
    }

    /// Account a PDU that was not relayed
    pub fn record_drop(&mut self, reason: DropReason) {
        self.decisions_made += 1;
        self.dropped += 1;
        *self.drop_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(net_if: NetIf, credential: Credential, ttl: u8) -> RelayContext {
        RelayContext {
            net_if,
            credential,
            ttl,
        }
    }

    fn run(ctx: &RelayContext, features: &RelayFeatures) -> RelayDecision {
        decide(
            ctx,
            features,
            Transmit::new(2, 20),
            Transmit::new(3, 50),
            RelayQueue::default(),
        )
    }

    #[test]
    fn test_adv_ttl_one_never_relayed() {
        let all = RelayFeatures {
            relay: true,
            proxy: true,
            friend: true,
        };
        for features in [all, RelayFeatures::default()] {
            assert_eq!(
                run(&ctx(NetIf::Adv, Credential::Flooding, 1), &features),
                RelayDecision::Drop(DropReason::TtlExpired)
            );
        }
    }

    #[test]
    fn test_adv_flooding_relay() {
        let decision = run(&ctx(NetIf::Adv, Credential::Flooding, 5), &RelayFeatures::default());
        let RelayDecision::Forward(plan) = decision else {
            panic!("expected forward, got {:?}", decision);
        };
        assert_eq!(plan.bearers, Bearers::ADV);
        assert_eq!(plan.credential, Credential::Flooding);
        assert!(plan.tag.contains(SendTag::RELAY));
        assert_eq!(plan.xmit, Transmit::new(3, 50));
    }

    #[test]
    fn test_ttl_two_needs_relay_tag() {
        let proxy_only = RelayFeatures {
            relay: false,
            proxy: true,
            friend: false,
        };
        assert_eq!(
            run(&ctx(NetIf::Adv, Credential::Flooding, 2), &proxy_only),
            RelayDecision::Drop(DropReason::NotTaggedRelay)
        );
        assert!(matches!(
            run(&ctx(NetIf::Adv, Credential::Flooding, 2), &RelayFeatures::default()),
            RelayDecision::Forward(_)
        ));
    }

    #[test]
    fn test_friendship_inbound() {
        let friend = RelayFeatures {
            relay: false,
            proxy: false,
            friend: true,
        };
        let decision = run(&ctx(NetIf::Adv, Credential::Friendship, 4), &friend);
        let RelayDecision::Forward(plan) = decision else {
            panic!("expected forward, got {:?}", decision);
        };
        assert_eq!(plan.bearers, Bearers::ALL);
        assert_eq!(plan.credential, Credential::Flooding);
        // Friendship inbound uses network transmit
        assert_eq!(plan.xmit, Transmit::new(2, 20));

        assert_eq!(
            run(&ctx(NetIf::Adv, Credential::Friendship, 4), &RelayFeatures::default()),
            RelayDecision::Drop(DropReason::NoBearer)
        );
    }

    #[test]
    fn test_local_and_proxy_rows() {
        assert_eq!(
            run(&ctx(NetIf::Local, Credential::Flooding, 1), &RelayFeatures::default()),
            RelayDecision::Drop(DropReason::TtlExpired)
        );
        assert_eq!(
            run(&ctx(NetIf::Local, Credential::Flooding, 5), &RelayFeatures::default()),
            RelayDecision::Drop(DropReason::NoBearer)
        );
        assert_eq!(
            run(&ctx(NetIf::Proxy, Credential::Flooding, 5), &RelayFeatures::default()),
            RelayDecision::Drop(DropReason::NoBearer)
        );
        let proxy = RelayFeatures {
            relay: false,
            proxy: true,
            friend: false,
        };
        let decision = run(&ctx(NetIf::Proxy, Credential::Flooding, 5), &proxy);
        let RelayDecision::Forward(plan) = decision else {
            panic!("expected forward, got {:?}", decision);
        };
        assert_eq!(plan.bearers, Bearers::ALL);
        assert!(plan.tag.is_empty());
    }

    #[test]
    fn test_throttle_when_queue_half_full() {
        let decision = decide(
            &ctx(NetIf::Adv, Credential::Flooding, 5),
            &RelayFeatures::default(),
            Transmit::new(2, 20),
            Transmit::new(3, 50),
            RelayQueue {
                stored: 8,
                capacity: 16,
            },
        );
        let RelayDecision::Forward(plan) = decision else {
            panic!("expected forward, got {:?}", decision);
        };
        assert_eq!(plan.xmit, RELAY_THROTTLED);
    }

    #[test]
    fn test_stats() {
        let mut stats = RelayStats::default();
        stats.record_forward(true);
        stats.record_drop(DropReason::TtlExpired);
        stats.record_drop(DropReason::TtlExpired);
        assert_eq!(stats.decisions_made, 3);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.drop_reasons.get("TTL expired"), Some(&2));
    }
}
