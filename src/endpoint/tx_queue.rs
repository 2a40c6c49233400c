use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use event_listener::Event;
use parking_lot::Mutex;

use crate::{codec::Message, router::RoutingError};

/// Transmit FIFO depth per endpoint.
pub const MAX_TX_QUEUE: usize = 30;

/// Cap on how long a saturated push will wait for space.
const MAX_WAIT: Duration = Duration::from_secs(20);

struct Entry {
    msg: Arc<Message>,
    queued_at: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        match self.msg.ttl_ms {
            Some(ttl) => now.duration_since(self.queued_at) >= Duration::from_millis(ttl.into()),
            None => false,
        }
    }

    /// Time left before this entry expires, if it carries a TTL.
    fn remaining(&self, now: Instant) -> Option<Duration> {
        let ttl = Duration::from_millis(self.msg.ttl_ms?.into());
        Some(ttl.saturating_sub(now.duration_since(self.queued_at)))
    }
}

/// The bounded transmit FIFO owned by every message-carrying endpoint.
///
/// A full queue blocks the pusher for up to the shortest remaining TTL of
/// any queued message (capped at [`MAX_WAIT`]); if the queue is still full
/// after that, the oldest expired entry is discarded to admit the new one.
/// Waiters are woken with `EndpointClosing` when the queue closes.
pub struct TxQueue {
    queue: Mutex<VecDeque<Entry>>,
    /// Notified when an entry leaves the queue (and on close).
    space: Event,
    /// Notified when an entry enters the queue (and on close).
    ready: Event,
    closed: AtomicBool,
}

impl TxQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(MAX_TX_QUEUE)),
            space: Event::new(),
            ready: Event::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue at the tail, applying the backpressure contract.
    pub async fn push(&self, msg: Arc<Message>) -> Result<(), RoutingError> {
        let wait = {
            if self.is_closed() {
                return Err(RoutingError::EndpointClosing);
            }
            let mut queue = self.queue.lock();
            if queue.len() < MAX_TX_QUEUE {
                queue.push_back(Entry {
                    msg,
                    queued_at: Instant::now(),
                });
                drop(queue);
                self.ready.notify(1);
                return Ok(());
            }
            let now = Instant::now();
            queue
                .iter()
                .filter_map(|e| e.remaining(now))
                .min()
                .map_or(MAX_WAIT, |r| r.min(MAX_WAIT))
        };

        let deadline = Instant::now() + wait;
        loop {
            let listener = self.space.listen();
            if self.is_closed() {
                return Err(RoutingError::EndpointClosing);
            }
            {
                let mut queue = self.queue.lock();
                if queue.len() < MAX_TX_QUEUE {
                    queue.push_back(Entry {
                        msg,
                        queued_at: Instant::now(),
                    });
                    drop(queue);
                    self.ready.notify(1);
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, listener).await.is_err()
            {
                break;
            }
        }

        if self.is_closed() {
            return Err(RoutingError::EndpointClosing);
        }
        let mut queue = self.queue.lock();
        if queue.len() < MAX_TX_QUEUE {
            queue.push_back(Entry {
                msg,
                queued_at: Instant::now(),
            });
            drop(queue);
            self.ready.notify(1);
            return Ok(());
        }
        let now = Instant::now();
        match queue.iter().position(|e| e.expired(now)) {
            Some(stale) => {
                queue.remove(stale);
                queue.push_back(Entry {
                    msg,
                    queued_at: now,
                });
                drop(queue);
                self.ready.notify(1);
                Ok(())
            }
            None => Err(RoutingError::Blocked),
        }
    }

    /// Enqueue a link control message (probe traffic) ahead of user data,
    /// ignoring the bound. Control messages are rare and tiny.
    pub fn push_control(&self, msg: Arc<Message>) -> Result<(), RoutingError> {
        if self.is_closed() {
            return Err(RoutingError::EndpointClosing);
        }
        self.queue.lock().push_front(Entry {
            msg,
            queued_at: Instant::now(),
        });
        self.ready.notify(1);
        Ok(())
    }

    /// Dequeue the head entry; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Arc<Message>> {
        loop {
            let listener = self.ready.listen();
            {
                let mut queue = self.queue.lock();
                if let Some(entry) = queue.pop_front() {
                    drop(queue);
                    self.space.notify(usize::MAX);
                    return Some(entry.msg);
                }
            }
            if self.is_closed() {
                return None;
            }
            listener.await;
        }
    }

    /// Wait until the queue drains or `max_wait` elapses. Returns whether it
    /// drained.
    pub async fn wait_empty(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let listener = self.space.listen();
            if self.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, listener).await.is_err()
            {
                return self.is_empty();
            }
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.space.notify(usize::MAX);
        self.ready.notify(usize::MAX);
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    fn msg(ttl_ms: Option<u32>) -> Arc<Message> {
        let mut m = Message::signal("/", "org.test", "Tick", vec![]);
        m.ttl_ms = ttl_ms;
        Arc::new(m)
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = TxQueue::new();
        for i in 0..3u32 {
            let mut m = Message::signal("/", "org.test", "Tick", vec![]);
            m.serial = i;
            q.push(Arc::new(m)).await.unwrap();
        }
        for i in 0..3u32 {
            assert_eq!(q.pop().await.unwrap().serial, i);
        }
    }

    #[tokio::test]
    async fn control_jumps_the_queue() {
        let q = TxQueue::new();
        q.push(msg(None)).await.unwrap();
        let mut probe = Message::signal("/", "org.alljoyn.Daemon", "ProbeReq", vec![]);
        probe.serial = 77;
        q.push_control(Arc::new(probe)).unwrap();
        assert_eq!(q.pop().await.unwrap().serial, 77);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_push_admits_over_expired_entry() {
        let q = TxQueue::new();
        // One short-TTL entry, the rest without.
        q.push(msg(Some(10))).await.unwrap();
        for _ in 1..MAX_TX_QUEUE {
            q.push(msg(None)).await.unwrap();
        }
        assert_eq!(q.len(), MAX_TX_QUEUE);

        // The push waits out the 10ms TTL, then displaces the expired entry.
        q.push(msg(None)).await.unwrap();
        assert_eq!(q.len(), MAX_TX_QUEUE);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_push_without_expiry_reports_blocked() {
        let q = TxQueue::new();
        for _ in 0..MAX_TX_QUEUE {
            q.push(msg(None)).await.unwrap();
        }
        assert_eq!(q.push(msg(None)).await, Err(RoutingError::Blocked));
    }

    #[tokio::test]
    async fn close_wakes_blocked_pusher() {
        let q = Arc::new(TxQueue::new());
        for _ in 0..MAX_TX_QUEUE {
            q.push(msg(None)).await.unwrap();
        }
        let q2 = q.clone();
        let pusher = tokio::spawn(async move { q2.push(msg(None)).await });
        tokio::task::yield_now().await;
        q.close();
        assert_eq!(pusher.await.unwrap(), Err(RoutingError::EndpointClosing));
    }

    #[tokio::test]
    async fn pop_drains_after_close() {
        let q = TxQueue::new();
        q.push(msg(None)).await.unwrap();
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
