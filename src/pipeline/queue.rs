//! Bounded hand-off queue with a non-blocking flush.
//!
//! `tokio::sync::mpsc` keeps the receiving half private to the consumer, so
//! a producer cannot discard stale items when a turn is cancelled. This queue
//! is shared by reference: any holder can [`flush`](FlushQueue::flush) it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::error::{AssistantError, Result};

/// Multi-producer, single-consumer bounded queue.
#[derive(Debug)]
pub struct FlushQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
}

impl<T> FlushQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue `item`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Channel`] if the queue is closed.
    pub async fn send(&self, item: T) -> Result<()> {
        let mut item = Some(item);
        loop {
            let writable = self.writable.notified();
            {
                if self.closed.load(Ordering::Acquire) {
                    return Err(AssistantError::Channel("queue closed".into()));
                }
                let mut items = self.lock()?;
                if items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        items.push_back(item);
                    }
                    drop(items);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Channel`] if the queue is full or closed.
    pub fn try_send(&self, item: T) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AssistantError::Channel("queue closed".into()));
        }
        let mut items = self.lock()?;
        if items.len() >= self.capacity {
            return Err(AssistantError::Channel("queue full".into()));
        }
        items.push_back(item);
        drop(items);
        self.readable.notify_one();
        Ok(())
    }

    /// Dequeue the next item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let readable = self.readable.notified();
            {
                let mut items = self.items.lock().ok()?;
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.writable.notify_one();
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Discard every queued item without waiting. Returns how many were
    /// dropped.
    pub fn flush(&self) -> usize {
        let dropped = match self.items.lock() {
            Ok(mut items) => {
                let n = items.len();
                items.clear();
                n
            }
            Err(_) => 0,
        };
        if dropped > 0 {
            self.writable.notify_waiters();
        }
        dropped
    }

    /// Close the queue, waking every waiter. Queued items remain readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<T>>> {
        self.items
            .lock()
            .map_err(|_| AssistantError::Channel("queue lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn items_arrive_in_fifo_order() {
        let queue = FlushQueue::new(4);
        queue.send(1).await.unwrap();
        queue.send(2).await.unwrap();
        queue.send(3).await.unwrap();
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
    }

    #[tokio::test]
    async fn flush_discards_everything_queued() {
        let queue = FlushQueue::new(8);
        for i in 0..5 {
            queue.try_send(i).unwrap();
        }
        assert_eq!(queue.flush(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.flush(), 0);

        queue.try_send(42).unwrap();
        assert_eq!(queue.recv().await, Some(42));
    }

    #[tokio::test]
    async fn try_send_rejects_when_full() {
        let queue = FlushQueue::new(1);
        queue.try_send("a").unwrap();
        assert!(queue.try_send("b").is_err());
    }

    #[tokio::test]
    async fn full_send_resumes_after_flush() {
        let queue = Arc::new(FlushQueue::new(1));
        queue.send(1).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.send(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        queue.flush();
        producer.await.unwrap().unwrap();
        assert_eq!(queue.recv().await, Some(2));
    }

    #[tokio::test]
    async fn recv_wakes_on_send_from_another_task() {
        let queue = Arc::new(FlushQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.send(7).await.unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = Arc::new(FlushQueue::new(2));
        queue.send(1).await.unwrap();
        queue.close();
        assert!(queue.send(2).await.is_err());
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let queue: Arc<FlushQueue<u8>> = Arc::new(FlushQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }
}
