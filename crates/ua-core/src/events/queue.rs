use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::trace;

use super::Event;

#[derive(Debug, Default)]
struct Inner {
    fifo: Mutex<VecDeque<Event>>,
    cond: Condvar,
    wake: Notify,
}

/// FIFO of events between the engine and the application.
///
/// Cloning gives another handle to the same queue. Blocking consumers use
/// [`EventQueue::wait`] / [`EventQueue::get`]; async consumers use
/// [`EventQueue::next`].
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and wake every kind of waiter.
    pub fn push(&self, event: Event) {
        trace!("event {} cid={} did={} tid={}", event.kind, event.cid, event.did, event.tid);
        self.inner.fifo.lock().push_back(event);
        self.inner.cond.notify_one();
        self.inner.wake.notify_one();
    }

    pub fn try_get(&self) -> Option<Event> {
        self.inner.fifo.lock().pop_front()
    }

    /// Dequeue, waiting up to `timeout`. A zero timeout never blocks.
    pub fn wait(&self, timeout: Duration) -> Option<Event> {
        let mut fifo = self.inner.fifo.lock();
        if let Some(event) = fifo.pop_front() {
            return Some(event);
        }
        if timeout.is_zero() {
            return None;
        }
        let _ = self.inner.cond.wait_for(&mut fifo, timeout);
        fifo.pop_front()
    }

    /// Dequeue, blocking until an event arrives.
    pub fn get(&self) -> Event {
        let mut fifo = self.inner.fifo.lock();
        loop {
            if let Some(event) = fifo.pop_front() {
                return event;
            }
            self.inner.cond.wait(&mut fifo);
        }
    }

    /// Async dequeue.
    pub async fn next(&self) -> Event {
        loop {
            let notified = self.inner.wake.notified();
            if let Some(event) = self.try_get() {
                return event;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.fifo.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fifo.lock().is_empty()
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<Event> {
        self.inner.fifo.lock().drain(..).collect()
    }
}
