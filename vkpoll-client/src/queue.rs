//! Ordered buffer between the poll loop and the dispatch workers.
//!
//! One producer ([`crate::PollLoop`]) appends whole batches; any number of
//! workers pull single updates. Items of one [`UpdateQueue::put_all`] call
//! stay contiguous and in order. Nothing is promised about the order in
//! which concurrent workers *finish* them.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use vkpoll_proto::RawUpdate;

#[derive(Default)]
pub struct UpdateQueue {
    items:  Mutex<VecDeque<RawUpdate>>,
    notify: Notify,
    closed: AtomicBool,
}

impl UpdateQueue {
    pub fn new() -> Self { Self::default() }

    /// Append `batch` atomically, preserving its order.
    pub fn put_all(&self, batch: impl IntoIterator<Item = RawUpdate>) {
        let added = {
            let mut items = self.lock();
            let before = items.len();
            items.extend(batch);
            items.len() - before
        };
        if added > 0 {
            self.notify.notify_waiters();
        }
    }

    /// Pop the oldest update without waiting.
    pub fn take_next(&self) -> Option<RawUpdate> {
        self.lock().pop_front()
    }

    /// Wait for the next update.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<RawUpdate> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(u) = self.take_next() {
                return Some(u);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting waits: pending items can still be drained, after which
    /// [`UpdateQueue::next`] returns `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RawUpdate>> {
        // A panic while holding the lock cannot leave the deque half-written.
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}
