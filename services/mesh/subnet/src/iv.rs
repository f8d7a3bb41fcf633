//! IV index state machine.
//!
//! ```text
//!            iv+1, flag=1 (or SEQ near exhaustion)
//!   Normal ------------------------------------> IvuInProgress
//!      ^                                             |
//!      |   flag=0, >= 96h, no segmented TX pending   |
//!      +---------------------------------------------+
//! ```
//!
//! The state only records what happened; the network layer applies the
//! side effects a transition asks for (replay list aging or clearing,
//! beacon refresh, persistence, restarting the hour timer).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sequence number past which the node starts an IV update itself
pub const IV_UPDATE_SEQ_LIMIT: u32 = 8_000_000;

/// Minimum hours to stay in either IV update state
pub const IVU_MIN_HOURS: u32 = 96;

/// Hours accounted per timer tick
pub const IVU_HOURS: u32 = IVU_MIN_HOURS / 4;

/// Timer period for one tick
pub const IVU_TIMEOUT: Duration = Duration::from_secs(IVU_HOURS as u64 * 60 * 60);

/// Largest accepted jump ahead of the current IV index
pub const IV_INDEX_MAX_AHEAD: u32 = 42;

bitflags! {
    /// IV update state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct IvFlags: u8 {
        /// IV update procedure in progress
        const IN_PROGRESS = 1 << 0;
        /// Return to normal operation deferred by a segmented send
        const PENDING = 1 << 1;
        /// Test mode: minimum duration not enforced
        const TEST = 1 << 2;
        /// This node initiated the current procedure
        const INITIATOR = 1 << 3;
    }
}

/// IV update policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvConfig {
    /// Perform IV index recovery when a beacon announces iv+1 without the
    /// update flag, instead of ignoring it
    pub recovery_on_next_index: bool,
    /// Sequence number that triggers a self-initiated IV update
    pub seq_limit: u32,
}

impl Default for IvConfig {
    fn default() -> Self {
        Self {
            recovery_on_next_index: false,
            seq_limit: IV_UPDATE_SEQ_LIMIT,
        }
    }
}

/// Result of an IV update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvTransition {
    /// Request ignored, nothing changed
    Unchanged,
    /// Return to normal operation postponed until segmented sends finish
    Deferred,
    /// State changed
    Changed {
        /// IV update in progress after the change
        in_progress: bool,
        /// The change was an IV index recovery
        recovery: bool,
    },
}

/// Result of an hour-timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvTick {
    /// Below the minimum duration; re-arm the timer
    Rearm,
    /// Minimum duration reached while in progress; leave IV update
    Expired,
    /// Minimum duration reached in normal operation
    Idle,
}

/// IV index and sequence number state
#[derive(Debug, Clone, Default)]
pub struct IvState {
    /// Current IV index
    pub iv_index: u32,
    /// Next sequence number to use
    pub seq: u32,
    /// State flags
    pub flags: IvFlags,
    /// Hours spent in the current state
    pub ivu_duration: u32,
}

impl IvState {
    /// State right after provisioning
    pub fn provisioned(iv_index: u32, in_progress: bool) -> Self {
        let mut flags = IvFlags::empty();
        flags.set(IvFlags::IN_PROGRESS, in_progress);
        Self {
            iv_index,
            seq: 0,
            flags,
            // The 96 hour minimum does not apply straight after provisioning
            ivu_duration: IVU_MIN_HOURS,
        }
    }

    /// IV update in progress
    pub fn in_progress(&self) -> bool {
        self.flags.contains(IvFlags::IN_PROGRESS)
    }

    /// IV index used for transmission
    pub fn ivi_tx(&self) -> u32 {
        self.iv_index.wrapping_sub(self.in_progress() as u32)
    }

    /// IV index a received PDU was protected with, given its IVI bit
    pub fn iv_rx(&self, ivi: bool) -> (u32, bool) {
        let old_iv = ivi != (self.iv_index & 1 != 0);
        (self.iv_index.wrapping_sub(old_iv as u32), old_iv)
    }

    /// Take the next sequence number
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1) & mesh_wire::SEQ_MAX;
        seq
    }

    /// Whether the sequence number calls for a self-initiated IV update
    pub fn seq_exhausted(&self, config: &IvConfig) -> bool {
        !self.in_progress() && self.seq > config.seq_limit
    }

    /// Process an IV index observed in a beacon (or requested locally).
    ///
    /// `tx_in_progress` reports whether any segmented send is outstanding.
    pub fn update(
        &mut self,
        iv_index: u32,
        iv_update: bool,
        tx_in_progress: bool,
        config: &IvConfig,
    ) -> IvTransition {
        if iv_index < self.iv_index || iv_index > self.iv_index.saturating_add(IV_INDEX_MAX_AHEAD)
        {
            warn!(
                "IV Index out of sync: 0x{:08x} != 0x{:08x}",
                iv_index, self.iv_index
            );
            return IvTransition::Unchanged;
        }

        let recovery = if self.in_progress() {
            if iv_index > self.iv_index {
                true
            } else if iv_update {
                debug!("Already in IV Update in Progress state");
                return IvTransition::Unchanged;
            } else {
                false
            }
        } else {
            if iv_index == self.iv_index {
                debug!("Same IV Index in normal mode");
                return IvTransition::Unchanged;
            }

            let next = iv_index == self.iv_index + 1;
            if !next || (!iv_update && config.recovery_on_next_index) {
                true
            } else if !iv_update {
                warn!("Ignoring new index in normal mode");
                return IvTransition::Unchanged;
            } else {
                false
            }
        };

        if recovery {
            warn!("Performing IV Index Recovery");
            self.iv_index = iv_index;
            self.seq = 0;
        } else {
            if !self.flags.contains(IvFlags::TEST) && self.ivu_duration < IVU_MIN_HOURS {
                warn!("IV Update before minimum duration");
                return IvTransition::Unchanged;
            }

            if !iv_update && tx_in_progress {
                warn!("IV Update deferred because of pending transfer");
                self.flags.insert(IvFlags::PENDING);
                return IvTransition::Deferred;
            }
        }

        self.flags.set(IvFlags::IN_PROGRESS, iv_update);
        self.ivu_duration = 0;

        if iv_update {
            self.iv_index = iv_index;
            info!("IV Update state entered. New index 0x{:08x}", self.iv_index);
        } else {
            info!("Normal mode entered");
            self.seq = 0;
        }

        IvTransition::Changed {
            in_progress: iv_update,
            recovery,
        }
    }

    /// Account one hour-timer tick
    pub fn tick(&mut self) -> IvTick {
        self.ivu_duration = self.ivu_duration.saturating_add(IVU_HOURS);
        if self.ivu_duration < IVU_MIN_HOURS {
            return IvTick::Rearm;
        }
        if self.in_progress() {
            IvTick::Expired
        } else {
            IvTick::Idle
        }
    }

    /// Consume a deferred return to normal operation
    pub fn take_pending(&mut self) -> bool {
        let pending = self.flags.contains(IvFlags::PENDING);
        self.flags.remove(IvFlags::PENDING);
        pending
    }

    /// Enable or disable test mode; resets the duration counter
    pub fn set_test_mode(&mut self, enable: bool) {
        self.flags.set(IvFlags::TEST, enable);
        self.ivu_duration = 0;
    }

    /// Mark whether this node initiated the procedure
    pub fn set_initiator(&mut self, initiator: bool) {
        self.flags.set(IvFlags::INITIATOR, initiator);
    }
}
