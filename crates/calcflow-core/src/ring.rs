//! Bounded FIFO of recently observed events.
//!
//! Eviction policy: when an event is appended at capacity, the oldest event
//! is dropped. Nothing else ever removes an event.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::event::Event;

/// Default number of events retained.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Fixed-capacity, oldest-evicted ring of [`Event`]s.
///
/// `append` and `snapshot` are serialized by a mutex, so a reader never
/// observes a partially applied append. Snapshots are owned copies.
#[derive(Debug)]
pub struct EventRing {
    capacity: usize,
    inner: Mutex<RingState>,
}

#[derive(Debug, Default)]
struct RingState {
    events: VecDeque<Event>,
    evicted: u64,
}

impl EventRing {
    /// Create a ring holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(RingState {
                events: VecDeque::with_capacity(capacity),
                evicted: 0,
            }),
        }
    }

    /// Append an event, returning the evicted one if the ring was full.
    pub fn append(&self, event: Event) -> Option<Event> {
        let mut state = self.inner.lock();
        let evicted = if state.events.len() == self.capacity {
            state.evicted += 1;
            state.events.pop_front()
        } else {
            None
        };
        state.events.push_back(event);
        evicted
    }

    /// Events in append order (oldest first).
    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Events newest first.
    pub fn snapshot_newest_first(&self) -> Vec<Event> {
        self.inner.lock().events.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of events dropped by capacity-driven eviction.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use crate::result::Origin;
    use std::sync::Arc;
    use time::OffsetDateTime;

    fn event(i: usize) -> Event {
        Event {
            operation: OperationKind::Fibonacci,
            input_repr: i.to_string(),
            result_repr: "0".into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            requester: "tester".into(),
            origin: Some(Origin::Computed),
        }
    }

    fn inputs(events: &[Event]) -> Vec<String> {
        events.iter().map(|e| e.input_repr.clone()).collect()
    }

    #[test]
    fn keeps_everything_below_capacity() {
        let ring = EventRing::new(5);
        for i in 0..3 {
            assert!(ring.append(event(i)).is_none());
        }
        assert_eq!(inputs(&ring.snapshot()), vec!["0", "1", "2"]);
        assert_eq!(ring.evicted(), 0);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let ring = EventRing::new(DEFAULT_EVENT_CAPACITY);
        let k = 250;
        for i in 0..k {
            ring.append(event(i));
        }

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), DEFAULT_EVENT_CAPACITY);
        let expected: Vec<String> = (k - DEFAULT_EVENT_CAPACITY..k).map(|i| i.to_string()).collect();
        assert_eq!(inputs(&snapshot), expected);
        assert_eq!(ring.evicted(), (k - DEFAULT_EVENT_CAPACITY) as u64);
    }

    #[test]
    fn append_returns_evicted_event() {
        let ring = EventRing::new(2);
        ring.append(event(0));
        ring.append(event(1));
        let evicted = ring.append(event(2)).expect("ring was full");
        assert_eq!(evicted.input_repr, "0");
    }

    #[test]
    fn snapshot_does_not_alias_storage() {
        let ring = EventRing::new(3);
        ring.append(event(0));
        let mut snapshot = ring.snapshot();
        snapshot[0].input_repr = "mutated".into();
        snapshot.clear();
        assert_eq!(inputs(&ring.snapshot()), vec!["0"]);
    }

    #[test]
    fn newest_first_reverses_order() {
        let ring = EventRing::new(3);
        for i in 0..4 {
            ring.append(event(i));
        }
        assert_eq!(inputs(&ring.snapshot_newest_first()), vec!["3", "2", "1"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let ring = EventRing::new(0);
        ring.append(event(0));
        ring.append(event(1));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(inputs(&ring.snapshot()), vec!["1"]);
    }

    #[tokio::test]
    async fn concurrent_appends_respect_capacity() {
        let ring = Arc::new(EventRing::new(10));
        let mut tasks = Vec::new();
        for t in 0..8 {
            let ring = Arc::clone(&ring);
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    ring.append(event(t * 1000 + i));
                    assert!(ring.len() <= 10);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(ring.len(), 10);
        assert_eq!(ring.evicted(), 390);
    }
}
