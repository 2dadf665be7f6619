use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Bounded FIFO that never rejects a push: when full, the oldest entry is
/// discarded to make room. Pops can block (with a deadline) or be awaited.
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Condvar,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Condvar::new(),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes `item`, first discarding from the front until at most
    /// `keep - 1` entries remain (`keep` is clamped to the capacity).
    /// Returns how many entries were discarded.
    pub fn push_keeping(&self, item: T, keep: usize) -> usize {
        let keep = keep.clamp(1, self.capacity);
        let mut evicted = 0;
        {
            let mut items = self.items.lock();
            while items.len() >= keep {
                items.pop_front();
                evicted += 1;
            }
            items.push_back(item);
        }
        if evicted > 0 {
            self.dropped.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        self.ready.notify_one();
        self.notify.notify_one();
        evicted
    }

    pub fn push(&self, item: T) -> usize {
        self.push_keeping(item, self.capacity)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Blocks up to `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.ready.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Waits for the next item.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between try_pop and here is not lost.
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Total entries discarded to make room since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_never_exceeds_capacity() {
        let queue = DropOldestQueue::new(4);
        for i in 0..1000 {
            queue.push(i);
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.dropped(), 996);

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![996, 997, 998, 999]);
    }

    #[test]
    fn test_push_keeping_leaves_headroom() {
        let queue = DropOldestQueue::new(8);
        for i in 0..10 {
            queue.push_keeping(i, 6);
        }
        assert_eq!(queue.len(), 6);
        assert_eq!(queue.try_pop(), Some(4));
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue: DropOldestQueue<u8> = DropOldestQueue::new(2);
        let started = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let queue = Arc::new(DropOldestQueue::new(2));
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(7u8);
        });
        assert_eq!(queue.pop_timeout(Duration::from_secs(2)), Some(7));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_pop() {
        let queue = Arc::new(DropOldestQueue::new(2));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push("chunk");
        });
        let item = tokio::time::timeout(Duration::from_secs(2), queue.pop())
            .await
            .unwrap();
        assert_eq!(item, "chunk");
    }
}
