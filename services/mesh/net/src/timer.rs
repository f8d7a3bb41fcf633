//! Deferred work: timer events, the scheduler collaborator and a virtual
//! clock implementation.
//!
//! The protocol state machines never block. Anything that has to happen
//! later is expressed as a [`TimerEvent`] handed to a [`Scheduler`]; when the
//! deadline passes the driver feeds the event back into the stack. Events
//! that name a slot carry its generation so a late event for a slot that
//! has since been reused is recognised and ignored.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Stable handle of a TX or RX slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    /// Index in the slot pool
    pub index: usize,
    /// Incremented every time the slot is reset
    pub generation: u64,
}

/// Work scheduled for later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// IV update hour-counter tick
    IvuRefresh,
    /// Send the next segment of the first round
    SegTxInterval(SlotId),
    /// Segment retransmission
    SegTxRetransmit(SlotId),
    /// Send a Segment Acknowledgment
    SegRxAck(SlotId),
    /// Give up on an incomplete reassembly
    SegRxDiscard(SlotId),
}

/// Handle to cancel a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Clock and deferred-callback collaborator
pub trait Scheduler: Send + Sync {
    /// Monotonic time since the scheduler started
    fn now(&self) -> Duration;

    /// Deliver `event` after `delay`
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerHandle;

    /// Cancel a scheduled event; unknown or fired handles are ignored
    fn cancel(&self, handle: TimerHandle);
}

/// A one-shot timer owned by a protocol slot.
///
/// Re-arming cancels the previous deadline.
#[derive(Debug, Default)]
pub struct SlotTimer {
    handle: Option<TimerHandle>,
}

impl SlotTimer {
    /// Arm (or re-arm) the timer
    pub fn start(&mut self, sched: &dyn Scheduler, delay: Duration, event: TimerEvent) {
        self.cancel(sched);
        self.handle = Some(sched.schedule(delay, event));
    }

    /// Cancel the timer if armed
    pub fn cancel(&mut self, sched: &dyn Scheduler) {
        if let Some(handle) = self.handle.take() {
            sched.cancel(handle);
        }
    }

    /// Forget the handle after the event fired
    pub fn fired(&mut self) {
        self.handle = None;
    }

    /// Whether a deadline is pending
    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Debug, Default)]
struct ManualInner {
    now: Duration,
    next_id: u64,
    pending: BTreeMap<(Duration, u64), TimerEvent>,
    history: Vec<TimerEvent>,
}

/// Deterministic scheduler driven by a virtual clock
#[derive(Debug, Default)]
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl ManualScheduler {
    /// Create a scheduler at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline of the next pending event
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.lock().pending.keys().next().map(|(at, _)| *at)
    }

    /// Advance the clock to the next pending event and return it
    pub fn fire_next(&self) -> Option<TimerEvent> {
        let mut inner = self.inner.lock();
        let key = *inner.pending.keys().next()?;
        let event = inner.pending.remove(&key)?;
        if key.0 > inner.now {
            inner.now = key.0;
        }
        Some(event)
    }

    /// Advance the clock to the next pending event if it is due within `limit`
    pub fn fire_next_within(&self, limit: Duration) -> Option<TimerEvent> {
        let due = {
            let inner = self.inner.lock();
            let deadline = inner.pending.keys().next().map(|(at, _)| *at)?;
            deadline <= inner.now + limit
        };
        if due {
            self.fire_next()
        } else {
            None
        }
    }

    /// Move the clock forward without firing anything
    pub fn advance(&self, by: Duration) {
        self.inner.lock().now += by;
    }

    /// Events currently pending, in deadline order
    pub fn pending(&self) -> Vec<TimerEvent> {
        self.inner.lock().pending.values().copied().collect()
    }

    /// Every event ever scheduled, in scheduling order
    pub fn history(&self) -> Vec<TimerEvent> {
        self.inner.lock().history.clone()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Duration {
        self.inner.lock().now
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let at = inner.now + delay;
        inner.pending.insert((at, id), event);
        inner.history.push(event);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.inner.lock().pending.retain(|(_, id), _| *id != handle.0);
    }
}
