//! A bounded, watermark-signalling queue used to couple the protocol
//! engine to its relay loop with back-pressure.
//!
//! Modeled on the teacher crate's `communication::channel` bounded
//! `mpsc` wrapper, generalized with the high/low watermark edge
//! triggers the STOMP engines use to drive `pause_reading`/
//! `resume_reading` on the transport.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

/// Fired, synchronously with the operation that caused it, whenever
/// queue occupancy crosses a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Crossed upward through `high`: the source should pause.
    High,
    /// Crossed downward through `low`: the source may resume.
    Low,
}

/// A bounded FIFO of capacity `n`, with `high = ceil(3n/4)` and
/// `low = ceil(n/4)` occupancy thresholds. `on_watermark` is called
/// synchronously, from inside `put`/`get`+`task_done`, exactly when
/// occupancy crosses a threshold — never on every operation.
pub struct WatermarkQueue<T> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    capacity: usize,
    high: usize,
    low: usize,
    size: std::sync::atomic::AtomicUsize,
    outstanding: std::sync::atomic::AtomicUsize,
    closed: std::sync::atomic::AtomicBool,
    closed_notify: Notify,
}

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

impl<T: Send + 'static> WatermarkQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(WatermarkQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            capacity,
            high: ceil_div(3 * capacity, 4),
            low: ceil_div(capacity, 4),
            size: std::sync::atomic::AtomicUsize::new(0),
            outstanding: std::sync::atomic::AtomicUsize::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    /// Poison the queue: every blocked and future `get()` returns
    /// `None` immediately. Used to unwind a relay loop once its
    /// connection has ended, the way `spec.md` §4.3 point 4 describes
    /// draining queues with a poisoned sentinel.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an item, suspending the caller while the queue is full.
    /// Returns the watermark event this insertion triggered, if any;
    /// `None` both on a closed queue and on a watermark miss.
    pub async fn put(&self, item: T) -> Option<Watermark> {
        use std::sync::atomic::Ordering;

        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let prev = self.size.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            result = self.tx.send(item) => { let _ = result; }
            _ = self.closed_notify.notified() => {}
        }
        let new = prev + 1;
        if prev < self.high && new >= self.high {
            Some(Watermark::High)
        } else {
            None
        }
    }

    /// Dequeue the next item, suspending while the queue is empty.
    /// Returns `None` once `close` has been called, even if items
    /// remain unconsumed.
    pub async fn get(&self) -> Option<T> {
        use std::sync::atomic::Ordering;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            item = rx.recv() => {
                if item.is_some() {
                    self.size.fetch_sub(1, Ordering::SeqCst);
                }
                item
            }
            _ = self.closed_notify.notified() => None,
        }
    }

    /// Mark one previously-`get`'d item as fully processed. Returns the
    /// watermark event this completion triggered, if any.
    pub fn task_done(&self) -> Option<Watermark> {
        use std::sync::atomic::Ordering;
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let new = prev - 1;
        if prev >= self.low && new < self.low {
            Some(Watermark::Low)
        } else {
            None
        }
    }

    /// Current approximate occupancy (items enqueued, not yet marked
    /// `task_done`).
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_of_two_does_not_cross_high_watermark() {
        let q: Arc<WatermarkQueue<&'static str>> = WatermarkQueue::new(2);
        assert_eq!(q.put("a").await, None);
        assert_eq!(q.put("b").await, Some(Watermark::High));
    }

    #[tokio::test]
    async fn only_the_second_drain_crosses_low_watermark() {
        let q: Arc<WatermarkQueue<&'static str>> = WatermarkQueue::new(2);
        q.put("a").await;
        q.put("b").await;

        q.get().await;
        assert_eq!(q.task_done(), None);
        q.get().await;
        assert_eq!(q.task_done(), Some(Watermark::Low));
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q: Arc<WatermarkQueue<i32>> = WatermarkQueue::new(10);
        for i in 0..5 {
            q.put(i).await;
        }
        let mut out = Vec::new();
        for _ in 0..5 {
            out.push(q.get().await.unwrap());
            q.task_done();
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }
}
