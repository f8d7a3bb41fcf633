//! Tokio implementation of the stack scheduler.

use dashmap::DashMap;
use mesh_net::{Scheduler, TimerEvent, TimerHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Scheduler backed by spawned sleeps.
///
/// Each deadline is a task that sleeps and then posts its event to the
/// driver's channel. Cancelling aborts the task.
pub struct TokioScheduler {
    runtime: Handle,
    start: Instant,
    next_id: AtomicU64,
    tasks: Arc<DashMap<u64, JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TimerEvent>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            runtime,
            start: Instant::now(),
            next_id: AtomicU64::new(1),
            tasks: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Deadlines not yet fired or cancelled
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let events = self.events.clone();

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.remove(&id);
            if events.send(event).is_err() {
                debug!("Timer event {:?} dropped, driver stopped", event);
            }
        });

        self.tasks.insert(id, task);
        // The task may have run to completion before it was registered
        self.tasks.remove_if(&id, |_, task| task.is_finished());

        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some((_, task)) = self.tasks.remove(&handle.0) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_net::SlotId;

    #[tokio::test(start_paused = true)]
    async fn test_events_delivered_in_deadline_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sched = TokioScheduler::new(Handle::current(), tx);
        let slot = SlotId { index: 0, generation: 1 };

        sched.schedule(Duration::from_millis(200), TimerEvent::IvuRefresh);
        sched.schedule(Duration::from_millis(50), TimerEvent::SegRxAck(slot));
        assert_eq!(sched.pending(), 2);

        assert_eq!(rx.recv().await, Some(TimerEvent::SegRxAck(slot)));
        assert_eq!(rx.recv().await, Some(TimerEvent::IvuRefresh));
        assert!(sched.now() >= Duration::from_millis(200));
        assert_eq!(sched.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_event_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sched = TokioScheduler::new(Handle::current(), tx);
        let slot = SlotId { index: 1, generation: 3 };

        let handle = sched.schedule(Duration::from_millis(50), TimerEvent::SegTxRetransmit(slot));
        sched.cancel(handle);
        // Unknown handles are ignored
        sched.cancel(handle);
        sched.schedule(Duration::from_millis(100), TimerEvent::SegRxDiscard(slot));

        assert_eq!(rx.recv().await, Some(TimerEvent::SegRxDiscard(slot)));
        assert!(rx.try_recv().is_err());
    }
}
