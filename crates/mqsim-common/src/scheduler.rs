//! Virtual-time event queue with cancellable handles.
//!
//! Nothing in a run advances time except [`Scheduler::pop_until`]. Events
//! are ordered by `(time, id)` where `id` comes from a counter that only
//! depends on scheduling order, never on the random seed.

use crate::{EntityId, Event, EventId, EventPayload, SimError, SimTime};
use std::collections::{BinaryHeap, HashSet};

/// Handle returned for every scheduled event.
///
/// Cancelling is idempotent, and a cancelled event is never delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(EventId);

impl TimerHandle {
    /// The event this handle refers to.
    pub fn event_id(&self) -> EventId {
        self.0
    }

    /// True when `event` is the firing of this handle.
    pub fn fired_by(&self, event: &Event) -> bool {
        self.0 == event.id
    }
}

/// Priority queue of future events plus the virtual clock.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: SimTime,
    queue: BinaryHeap<Event>,
    next_id: u64,
    /// Events still in the queue that may be cancelled.
    live: HashSet<EventId>,
    /// Cancelled events still physically in the queue.
    cancelled: HashSet<EventId>,
}

impl Scheduler {
    /// Create an empty scheduler at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of pending (non-cancelled) events.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True when no event is pending.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Schedule `payload` for `targets` after `delay`.
    pub fn schedule(
        &mut self,
        delay: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> TimerHandle {
        let time = self.now.saturating_add(delay);
        self.push(time, source, targets, payload)
    }

    /// Schedule at an absolute time, which must not lie in the past.
    pub fn schedule_at(
        &mut self,
        time: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> Result<TimerHandle, SimError> {
        if time < self.now {
            return Err(SimError::ScheduleInPast {
                requested: time,
                now: self.now,
            });
        }
        Ok(self.push(time, source, targets, payload))
    }

    /// Schedule after a delay in seconds. Negative delays are a programming error.
    pub fn schedule_after_secs(
        &mut self,
        delay_s: f64,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> Result<TimerHandle, SimError> {
        let delay = SimTime::try_from_secs(delay_s)?;
        Ok(self.schedule(delay, source, targets, payload))
    }

    fn push(
        &mut self,
        time: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> TimerHandle {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.queue.push(Event {
            id,
            time,
            source,
            targets,
            payload,
        });
        self.live.insert(id);
        TimerHandle(id)
    }

    /// Cancel a pending event. Returns false when it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.live.remove(&handle.0) {
            self.cancelled.insert(handle.0);
            true
        } else {
            false
        }
    }

    /// True while the event behind `handle` is still waiting to fire.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Time of the next deliverable event.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_cancelled_head();
        self.queue.peek().map(|e| e.time)
    }

    /// Pop the next event whose time is `<= limit`, advancing the clock to it.
    pub fn pop_until(&mut self, limit: SimTime) -> Option<Event> {
        self.discard_cancelled_head();
        if self.queue.peek()?.time > limit {
            return None;
        }
        let event = self.queue.pop()?;
        self.live.remove(&event.id);
        self.now = event.time;
        Some(event)
    }

    /// Pop the next event regardless of its time.
    pub fn pop_next(&mut self) -> Option<Event> {
        self.pop_until(SimTime::MAX)
    }

    /// Move the clock forward to `time` when no event remains before it.
    pub fn advance_to(&mut self, time: SimTime) {
        if time > self.now {
            self.now = time;
        }
    }

    fn discard_cancelled_head(&mut self) {
        while let Some(head) = self.queue.peek() {
            if !self.cancelled.contains(&head.id) {
                break;
            }
            if let Some(event) = self.queue.pop() {
                self.cancelled.remove(&event.id);
            }
        }
    }
}
