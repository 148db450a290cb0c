//! Per-bucket FIFO shared by a bucket's writers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Unbounded queue of pending items for one bucket.
#[derive(Debug)]
pub struct BucketQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> Default for BucketQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }
}

impl<T> BucketQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.items().push_back(item);
        self.ready.notify_one();
    }

    /// Put back an item a writer could not persist. Goes to the tail, so
    /// ordering within the bucket is not preserved.
    pub fn requeue(&self, item: T) {
        self.push(item);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Pop the next item, waiting up to `timeout` for one to arrive.
    ///
    /// Cancel safe: an item is only removed on the poll that returns it.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_and_requeue_to_tail() {
        let q = BucketQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.try_pop(), Some(1));
        q.requeue(1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(1));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_expires_when_empty() {
        let q: BucketQueue<u32> = BucketQueue::new();
        assert_eq!(q.pop_timeout(Duration::from_secs(1)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_wakes_on_push() {
        let q = Arc::new(BucketQueue::new());
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer.push("late");
        });
        assert_eq!(q.pop_timeout(Duration::from_secs(5)).await, Some("late"));
    }
}
