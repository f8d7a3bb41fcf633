//! Network interfaces, bearer selection and the bearer sink.

use crate::NetError;
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interface a network PDU arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetIf {
    /// Advertising bearer
    Adv,
    /// GATT proxy bearer
    Proxy,
    /// Locally originated, looped back
    Local,
    /// Proxy configuration messages
    ProxyCfg,
}

impl fmt::Display for NetIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetIf::Adv => write!(f, "adv"),
            NetIf::Proxy => write!(f, "proxy"),
            NetIf::Local => write!(f, "local"),
            NetIf::ProxyCfg => write!(f, "proxy-cfg"),
        }
    }
}

bitflags! {
    /// Outbound bearer set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Bearers: u8 {
        /// Advertising bearer
        const ADV = 0x01;
        /// GATT bearer
        const GATT = 0x02;
        /// Every bearer
        const ALL = Self::ADV.bits() | Self::GATT.bits();
    }
}

/// Packed transmit state: 3-bit count of extra transmissions and a 5-bit
/// interval step of 10 ms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transmit(u8);

impl Transmit {
    /// Pack a retransmit count and interval in milliseconds
    pub const fn new(count: u8, interval_ms: u16) -> Self {
        let step = if interval_ms < 10 { 0 } else { interval_ms / 10 - 1 };
        let step = if step > 0x1f { 0x1f } else { step };
        Self((count & 0x07) | ((step as u8) << 3))
    }

    /// Wrap a raw state value
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw state value
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Number of extra transmissions
    pub const fn count(self) -> u8 {
        self.0 & 0x07
    }

    /// Interval between transmissions in milliseconds
    pub const fn interval_ms(self) -> u16 {
        ((self.0 >> 3) as u16 + 1) * 10
    }
}

impl Default for Transmit {
    fn default() -> Self {
        Transmit::new(2, 20)
    }
}

impl fmt::Display for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count {} interval {}ms", self.count(), self.interval_ms())
    }
}

/// Transmit used for relays once the relay queue is half full
pub const RELAY_THROTTLED: Transmit = Transmit::new(0, 20);

/// Correlates a bearer send with its completion report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SendToken(pub u64);

/// Occupancy of the bearer relay queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayQueue {
    /// Relays currently queued
    pub stored: usize,
    /// Queue capacity; zero when the bearer does not account relays
    pub capacity: usize,
}

impl RelayQueue {
    /// Whether new relays should use the minimal transmit
    pub fn congested(&self) -> bool {
        self.capacity > 0 && self.stored >= self.capacity / 2
    }
}

/// Sink for outbound network PDUs.
///
/// Sends carrying a token must be reported back to the stack once the
/// bearer is done with them.
pub trait BearerSink: Send + Sync {
    /// Queue an encoded network PDU
    fn send(
        &self,
        pdu: Bytes,
        bearers: Bearers,
        xmit: Transmit,
        token: Option<SendToken>,
    ) -> Result<(), NetError>;

    /// Relay queue occupancy
    fn relay_queue(&self) -> RelayQueue {
        RelayQueue::default()
    }
}

/// One PDU handed to a [`RecordingBearer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPdu {
    /// Encoded PDU
    pub pdu: Bytes,
    /// Selected bearers
    pub bearers: Bearers,
    /// Transmit parameters
    pub xmit: Transmit,
    /// Completion token
    pub token: Option<SendToken>,
}

/// Bearer that records every send, for simulations and tests
#[derive(Debug, Default)]
pub struct RecordingBearer {
    sent: Mutex<Vec<SentPdu>>,
    queue: Mutex<RelayQueue>,
}

impl RecordingBearer {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the relay queue holds `stored` of `capacity` entries
    pub fn set_relay_queue(&self, stored: usize, capacity: usize) {
        *self.queue.lock() = RelayQueue { stored, capacity };
    }

    /// Take every recorded send
    pub fn take(&self) -> Vec<SentPdu> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Number of recorded sends
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl BearerSink for RecordingBearer {
    fn send(
        &self,
        pdu: Bytes,
        bearers: Bearers,
        xmit: Transmit,
        token: Option<SendToken>,
    ) -> Result<(), NetError> {
        self.sent.lock().push(SentPdu {
            pdu,
            bearers,
            xmit,
            token,
        });
        Ok(())
    }

    fn relay_queue(&self) -> RelayQueue {
        *self.queue.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_packing() {
        let xmit = Transmit::new(2, 20);
        assert_eq!(xmit.raw(), 0x0a);
        assert_eq!(xmit.count(), 2);
        assert_eq!(xmit.interval_ms(), 20);

        assert_eq!(RELAY_THROTTLED.count(), 0);
        assert_eq!(RELAY_THROTTLED.interval_ms(), 20);

        let max = Transmit::new(7, 320);
        assert_eq!(max.raw(), 0xff);
        assert_eq!(Transmit::from_raw(0xff), max);
    }

    #[test]
    fn test_relay_queue_congestion() {
        assert!(!RelayQueue::default().congested());
        assert!(!RelayQueue { stored: 4, capacity: 10 }.congested());
        assert!(RelayQueue { stored: 5, capacity: 10 }.congested());
    }

    #[test]
    fn test_recording_bearer() {
        let bearer = RecordingBearer::new();
        bearer
            .send(Bytes::from_static(b"pdu"), Bearers::ADV, Transmit::default(), Some(SendToken(7)))
            .unwrap();
        assert_eq!(bearer.len(), 1);
        let sent = bearer.take();
        assert_eq!(sent[0].token, Some(SendToken(7)));
        assert!(bearer.is_empty());
    }
}
