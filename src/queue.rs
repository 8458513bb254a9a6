// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 有界环形队列 (满时丢弃最旧元素)
//! Bounded FIFO ring buffer with drop-oldest overflow, safe for one producer
//! thread and one consumer thread.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<Ring<T>>,
    capacity: usize,
}

#[derive(Debug)]
struct Ring<T> {
    items: VecDeque<T>,
    /// 累计入队数 (含被挤掉的)
    pushed: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Ring {
                items: VecDeque::with_capacity(capacity),
                pushed: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 入队; 满时返回被挤掉的最旧元素 (不通知生产者)
    pub fn push(&self, item: T) -> Option<T> {
        let mut ring = self.lock();
        let evicted = if ring.items.len() >= self.capacity {
            ring.items.pop_front()
        } else {
            None
        };
        ring.items.push_back(item);
        ring.pushed += 1;
        evicted
    }

    pub fn pop_front(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// 查看队首但不出队
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().items.front().map(f)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// 累计入队数, 单调递增
    pub fn pushed(&self) -> u64 {
        self.lock().pushed
    }

    /// 消费端独占访问: 只允许查看/出队, 生产者在此期间阻塞
    pub fn consumer(&self) -> Consumer<'_, T> {
        Consumer { guard: self.lock() }
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// 从旧到新的拷贝
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.iter().cloned().collect()
    }

    /// 第 `seen` 次入队之后的元素, 与当前累计入队数一起在同一把锁下读取
    ///
    /// Items already evicted are skipped; the caller passes the returned
    /// count back as `seen` next time.
    pub fn snapshot_since(&self, seen: u64) -> (u64, Vec<T>) {
        let ring = self.lock();
        let new = usize::try_from(ring.pushed.saturating_sub(seen)).unwrap_or(usize::MAX);
        let skip = ring.items.len().saturating_sub(new);
        (ring.pushed, ring.items.iter().skip(skip).cloned().collect())
    }
}

pub struct Consumer<'a, T> {
    guard: MutexGuard<'a, Ring<T>>,
}

impl<T> Consumer<'_, T> {
    pub fn front(&self) -> Option<&T> {
        self.guard.items.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.guard.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.guard.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = BoundedQueue::new(1000);
        for i in 0..1000 {
            assert_eq!(queue.push(i), None);
        }
        assert_eq!(queue.push(1000), Some(0));
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.peek_with(|v| *v), Some(1));
        let items = queue.snapshot();
        assert_eq!(items.first(), Some(&1));
        assert_eq!(items.last(), Some(&1000));
    }

    #[test]
    fn test_snapshot_since() {
        let queue = BoundedQueue::new(3);
        assert_eq!(queue.snapshot_since(0), (0, vec![]));
        queue.push(1);
        queue.push(2);
        let (seen, items) = queue.snapshot_since(0);
        assert_eq!((seen, items), (2, vec![1, 2]));

        queue.push(3);
        assert_eq!(queue.snapshot_since(seen), (3, vec![3]));
        assert_eq!(queue.snapshot_since(3), (3, vec![]));

        // 超出容量的部分已被挤掉
        for i in 4..=8 {
            queue.push(i);
        }
        assert_eq!(queue.snapshot_since(3), (8, vec![6, 7, 8]));
        assert_eq!(queue.pushed(), 8);
    }

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(3);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.peek_with(|v| *v), Some("a"));
        assert_eq!(queue.pop_front(), Some("a"));
        assert_eq!(queue.pop_front(), Some("b"));
        assert_eq!(queue.pop_front(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_consumer_guard() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        {
            let mut consumer = queue.consumer();
            assert_eq!(consumer.front(), Some(&1));
            assert_eq!(consumer.pop_front(), Some(1));
            assert_eq!(consumer.len(), 1);
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let queue = BoundedQueue::new(0);
        queue.push(1);
        assert_eq!(queue.push(2), Some(1));
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_single_producer_single_consumer() {
        let queue = Arc::new(BoundedQueue::new(10_000));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..5000u32 {
                    queue.push(i);
                }
            })
        };
        let mut received = Vec::new();
        while received.len() < 5000 {
            if let Some(v) = queue.pop_front() {
                received.push(v);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert!(received.windows(2).all(|w| w[0] < w[1]));
    }
}
