//! Flow-controlled channel between a producer and a consumer
//!
//! A bounded in-memory queue with pause/resume watermarks. When the queue
//! fills to the pause watermark the upstream producer is asked to stop;
//! pushes arriving while paused are refused so the caller can divert them
//! to the retry store. Once the consumer drains the queue below the resume
//! watermark the producer is asked to continue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Notify};
use tracing::debug;

use crate::message::Message;

/// Upstream flow-control signal, broadcast on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Running,
    Paused,
}

/// Backpressure-aware pipe connecting a producer to a consumer
pub struct FlowControlledChannel {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    pause_at: usize,
    resume_at: usize,
    paused: AtomicBool,
    flow_tx: watch::Sender<FlowSignal>,
    notify: Notify,
}

impl FlowControlledChannel {
    /// Create a channel with the given capacity. The pause watermark sits
    /// at 99% of capacity, the resume watermark at 10%.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 16, "channel capacity too small to be useful");
        let pause_at = ((capacity * 99) / 100).max(1);
        let resume_at = capacity / 10;
        let (flow_tx, _) = watch::channel(FlowSignal::Running);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            pause_at,
            resume_at,
            paused: AtomicBool::new(false),
            flow_tx,
            notify: Notify::new(),
        }
    }

    /// Subscribe to pause/resume signals
    pub fn subscribe(&self) -> watch::Receiver<FlowSignal> {
        self.flow_tx.subscribe()
    }

    /// Try to enqueue a message. Refused while paused or full; the caller
    /// is expected to divert refused messages to the retry store.
    pub fn try_push(&self, msg: Message) -> Result<(), Message> {
        if self.paused.load(Ordering::Acquire) {
            return Err(msg);
        }

        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(msg);
            }
            queue.push_back(msg);
            queue.len()
        };

        if len >= self.pause_at && !self.paused.swap(true, Ordering::AcqRel) {
            debug!(depth = len, watermark = self.pause_at, "Live queue full, pausing producer");
            let _ = self.flow_tx.send(FlowSignal::Paused);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the oldest message, resuming the producer once the queue
    /// has drained below the resume watermark.
    pub fn pop(&self) -> Option<Message> {
        let (msg, len) = {
            let mut queue = self.queue.lock();
            let msg = queue.pop_front();
            (msg, queue.len())
        };

        if len <= self.resume_at
            && self.paused.load(Ordering::Acquire)
            && self.paused.swap(false, Ordering::AcqRel)
        {
            debug!(depth = len, watermark = self.resume_at, "Live queue drained, resuming producer");
            let _ = self.flow_tx.send(FlowSignal::Running);
        }
        msg
    }

    /// Remove everything queued, preserving order. Used on connection loss
    /// to persist the live queue into the retry store.
    pub fn drain(&self) -> Vec<Message> {
        let drained: Vec<Message> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if self.paused.swap(false, Ordering::AcqRel) {
            let _ = self.flow_tx.send(FlowSignal::Running);
        }
        drained
    }

    /// Wait until at least one push has happened since the last wait
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> Message {
        Message::new(format!("m{n}"))
    }

    #[test]
    fn test_pause_at_high_watermark() {
        let channel = FlowControlledChannel::new(100);
        let mut flow = channel.subscribe();

        for n in 0..98 {
            channel.try_push(msg(n)).unwrap();
        }
        assert!(!channel.is_paused());

        // 99th message crosses the watermark.
        channel.try_push(msg(98)).unwrap();
        assert!(channel.is_paused());
        assert_eq!(*flow.borrow_and_update(), FlowSignal::Paused);

        // While paused, pushes are refused for diversion to the store.
        assert!(channel.try_push(msg(99)).is_err());
    }

    #[test]
    fn test_resume_at_low_watermark() {
        let channel = FlowControlledChannel::new(100);
        for n in 0..99 {
            channel.try_push(msg(n)).unwrap();
        }
        assert!(channel.is_paused());

        // Drain to just above the resume watermark: still paused.
        while channel.len() > 11 {
            channel.pop().unwrap();
        }
        channel.pop().unwrap();
        assert!(!channel.is_paused());
        assert_eq!(*channel.subscribe().borrow(), FlowSignal::Running);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let channel = FlowControlledChannel::new(16);
        let mut accepted = 0;
        for n in 0..64 {
            if channel.try_push(msg(n)).is_ok() {
                accepted += 1;
            }
        }
        assert!(accepted <= channel.capacity());
        assert!(channel.len() <= channel.capacity());
    }

    #[test]
    fn test_drain_preserves_order_and_resumes() {
        let channel = FlowControlledChannel::new(100);
        for n in 0..99 {
            channel.try_push(msg(n)).unwrap();
        }
        assert!(channel.is_paused());

        let drained = channel.drain();
        assert_eq!(drained.len(), 99);
        assert_eq!(drained[0].payload, "m0");
        assert_eq!(drained[98].payload, "m98");
        assert!(!channel.is_paused());
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_notified_wakes_on_push() {
        let channel = std::sync::Arc::new(FlowControlledChannel::new(16));
        let waiter = channel.clone();
        let task = tokio::spawn(async move {
            waiter.notified().await;
            waiter.pop()
        });

        // Give the waiter a chance to park before pushing.
        tokio::task::yield_now().await;
        channel.try_push(msg(1)).unwrap();

        let popped = task.await.unwrap();
        assert_eq!(popped.map(|m| m.payload), Some("m1".to_string()));
    }
}
