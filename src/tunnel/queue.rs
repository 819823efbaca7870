use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// What happens to an entry forced out of a full queue (or pushed after
/// close). The encryption queue's entries release their completion handle
/// here; plain entries just drop.
pub trait Displaced {
    fn displaced(self);
}

/// Fixed-capacity multi-producer/multi-consumer FIFO.
///
/// `push` never blocks: when the queue is full the oldest entry is displaced
/// to make room, so under sustained overload the newest packets win and
/// memory stays bounded.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T: Displaced> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Insert without blocking, displacing the oldest entry if full.
    pub fn push(&self, item: T) {
        let displaced = {
            let mut queue = self.inner.lock();
            if queue.closed {
                drop(queue);
                item.displaced();
                return;
            }
            let old = if queue.items.len() == self.capacity {
                queue.items.pop_front()
            } else {
                None
            };
            queue.items.push_back(item);
            old
        };
        if let Some(old) = displaced {
            old.displaced();
        }
        self.notify.notify_one();
    }

    /// Await the next entry. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut queue = self.inner.lock();
                if let Some(item) = queue.items.pop_front() {
                    let more = !queue.items.is_empty();
                    drop(queue);
                    if more {
                        // a single stored permit can strand a second waiter;
                        // hand the wakeup on
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if queue.closed {
                    drop(queue);
                    self.notify.notify_one();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Remove and displace everything currently queued, returning the count.
    pub fn drain(&self) -> usize {
        let drained: Vec<T> = {
            let mut queue = self.inner.lock();
            queue.items.drain(..).collect()
        };
        let count = drained.len();
        for item in drained {
            item.displaced();
        }
        count
    }

    /// Stop accepting entries and wake every consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
