//! In-process queue between interrupt detection and interrupt processing.
//!
//! Detectors push one event per interrupted run; the processor drains the
//! queue on its own schedule. Events are not persisted. A crash between
//! detection and processing loses them, and the next detection pass finds
//! the same runs again.

use chrono::{DateTime, Utc};
use rlc_common::{Pod, RasAction};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Where an interrupt was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOrigin {
    /// Found by scanning the registry; carries the recorded interrupt time.
    Registry { interrupted_at: Option<DateTime<Utc>> },
    /// Found through the run's live pod.
    Pod(Pod),
}

/// A run whose interrupt has been acted on and now needs finalizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptEvent {
    pub run_name: String,
    pub ras_actions: Vec<RasAction>,
    pub interrupt_reason: String,
    pub origin: EventOrigin,
}

/// Mutex-guarded FIFO shared by every reconciler task.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<InterruptEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> std::sync::MutexGuard<'_, VecDeque<InterruptEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, event: InterruptEvent) {
        debug!(run = %event.run_name, reason = %event.interrupt_reason, "Queueing interrupt event");
        self.events().push_back(event);
    }

    /// Push a batch under a single lock so it stays contiguous.
    pub fn extend(&self, events: impl IntoIterator<Item = InterruptEvent>) {
        let mut queue = self.events();
        let before = queue.len();
        queue.extend(events);
        debug!("Queued {} interrupt events", queue.len() - before);
    }

    /// Pop the oldest event without waiting.
    pub fn dequeue(&self) -> Option<InterruptEvent> {
        self.events().pop_front()
    }

    pub fn size(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlc_common::test_guard;
    use std::sync::Arc;

    fn event(name: &str) -> InterruptEvent {
        InterruptEvent {
            run_name: name.to_string(),
            ras_actions: Vec::new(),
            interrupt_reason: "cancelled".to_string(),
            origin: EventOrigin::Registry { interrupted_at: None },
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let _guard = test_guard!();
        let queue = EventQueue::new();
        queue.enqueue(event("A"));
        queue.extend([event("B"), event("C")]);

        assert_eq!(queue.size(), 3);
        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.run_name)
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let _guard = test_guard!();
        let queue = Arc::new(EventQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.enqueue(event(&format!("T{t}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.size(), 1000);
    }
}
