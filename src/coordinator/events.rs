//! Bounded notification queues drained by the host.
//!
//! One queue per event kind so a flood of performance samples never pushes
//! out error reports. When a queue is full the newest event is dropped.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::widget::PerformanceMetrics;

/// A widget finished initializing (or re-initializing after a restart).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEvent {
    pub widget_id: u32,
}

/// Something went wrong; `widget_id` is `None` for worker-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub widget_id: Option<u32>,
    pub message: String,
}

struct Queue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> Queue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn push(&self, event: T) -> bool {
        self.tx.try_send(event).is_ok()
    }

    fn pop(&self) -> Option<T> {
        self.rx.lock().try_recv().ok()
    }
}

pub(crate) struct EventQueues {
    ready: Queue<ReadyEvent>,
    errors: Queue<ErrorEvent>,
    performance: Queue<PerformanceMetrics>,
}

impl EventQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ready: Queue::new(capacity),
            errors: Queue::new(capacity),
            performance: Queue::new(capacity),
        }
    }

    pub(crate) fn ready(&self, widget_id: u32) {
        if !self.ready.push(ReadyEvent { widget_id }) {
            tracing::debug!(widget_id, "ready queue full");
        }
    }

    pub(crate) fn error(&self, widget_id: Option<u32>, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(?widget_id, %message, "render error");
        if !self.errors.push(ErrorEvent { widget_id, message }) {
            tracing::debug!("error queue full");
        }
    }

    pub(crate) fn performance(&self, metrics: PerformanceMetrics) {
        // Samples are periodic; losing one is harmless.
        let _ = self.performance.push(metrics);
    }

    pub(crate) fn next_ready(&self) -> Option<ReadyEvent> {
        self.ready.pop()
    }

    pub(crate) fn next_error(&self) -> Option<ErrorEvent> {
        self.errors.pop()
    }

    pub(crate) fn next_performance(&self) -> Option<PerformanceMetrics> {
        self.performance.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_newest() {
        let queues = EventQueues::new(2);
        queues.ready(1);
        queues.ready(2);
        queues.ready(3);
        assert_eq!(queues.next_ready(), Some(ReadyEvent { widget_id: 1 }));
        assert_eq!(queues.next_ready(), Some(ReadyEvent { widget_id: 2 }));
        assert_eq!(queues.next_ready(), None);
    }

    #[test]
    fn test_kinds_do_not_share_capacity() {
        let queues = EventQueues::new(1);
        queues.performance(PerformanceMetrics::default());
        queues.performance(PerformanceMetrics::default());
        queues.error(Some(4), "boom");

        assert_eq!(queues.next_error().map(|e| e.widget_id), Some(Some(4)));
        assert!(queues.next_error().is_none());
        assert!(queues.next_performance().is_some());
        assert!(queues.next_performance().is_none());
    }
}
