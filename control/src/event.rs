//! Bounded event history with fan-out to subscriber channels, and the
//! one-shot done latch every sandbox/execution carries.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;
use tokio::sync::mpsc;

/// Append-only, capped event log with non-blocking fan-out. A subscriber
/// that cannot accept a new event immediately (its channel is full or
/// already closed) is evicted rather than allowed to stall the recorder.
pub struct EventHub<T: Clone> {
    history: VecDeque<T>,
    history_cap: usize,
    channel_capacity: usize,
    subscribers: HashMap<u64, mpsc::Sender<T>>,
    next_subscriber_id: u64,
}

impl<T: Clone> EventHub<T> {
    pub fn new(history_cap: usize, channel_capacity: usize) -> Self {
        Self {
            history: VecDeque::new(),
            history_cap,
            channel_capacity,
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
        }
    }

    /// Record an event and fan it out to every live subscriber.
    pub fn emit(&mut self, event: T) {
        self.history.push_back(event.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
        self.subscribers
            .retain(|_, tx| tx.try_send(event.clone()).is_ok());
    }

    /// Snapshot the history and register a fresh subscriber, returning its
    /// id (for unsubscribe) alongside the snapshot and receive end.
    pub fn subscribe(&mut self) -> (Vec<T>, mpsc::Receiver<T>, u64) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.insert(id, tx);
        (self.history.iter().cloned().collect(), rx, id)
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Drop every subscriber channel, closing their receivers.
    pub fn close_all(&mut self) {
        self.subscribers.clear();
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// A one-shot, closable signal indicating an entity reached its terminal
/// status. Closing is idempotent; waiters registered before or after the
/// close both observe it.
#[derive(Default)]
pub struct DoneLatch {
    notify: Notify,
    closed: AtomicBool,
}

impl DoneLatch {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the latch. A no-op if already closed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Wait until the latch closes, returning immediately if already
    /// closed. Uses the standard register-then-check pattern so a close
    /// racing with the call to `wait` is never missed.
    pub async fn wait(&self) {
        loop {
            if self.is_done() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn emit_appends_history_and_caps_it() {
        let mut hub: EventHub<i32> = EventHub::new(3, 8);
        for i in 0..5 {
            hub.emit(i);
        }
        assert_eq!(hub.history_len(), 3);
    }

    #[test]
    fn subscriber_receives_snapshot_then_new_events() {
        let mut hub: EventHub<i32> = EventHub::new(8, 8);
        hub.emit(1);
        hub.emit(2);
        let (snapshot, mut rx, _id) = hub.subscribe();
        assert_eq!(snapshot, vec![1, 2]);
        hub.emit(3);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn full_subscriber_is_evicted_not_blocked() {
        let mut hub: EventHub<i32> = EventHub::new(8, 1);
        let (_snapshot, mut rx, _id) = hub.subscribe();
        hub.emit(1); // fills the one-slot channel
        hub.emit(2); // subscriber can't accept, gets evicted
        assert_eq!(rx.try_recv().unwrap(), 1);
        // Channel is now closed because the sender was dropped on eviction.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn done_latch_wakes_existing_waiter() {
        let latch = Arc::new(DoneLatch::new());
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move {
                latch.wait().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn done_latch_wait_after_close_returns_immediately() {
        let latch = DoneLatch::new();
        latch.close();
        tokio::time::timeout(Duration::from_millis(50), latch.wait())
            .await
            .expect("should not block");
    }

    #[test]
    fn close_is_idempotent() {
        let latch = DoneLatch::new();
        latch.close();
        latch.close();
        assert!(latch.is_done());
    }
}
