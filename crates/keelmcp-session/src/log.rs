//! Per-session append-only event log.
//!
//! The log linearizes appends under one internal lock, assigns dense
//! sequence numbers from 1, and fans events out to live subscribers through
//! bounded per-subscriber queues. A subscriber that falls behind its queue
//! is disconnected rather than allowed to block the appender; consumer-side
//! failures never reach the log or other subscribers.
//!
//! Durable stores need the event on disk before subscribers hear about it,
//! so appending is split into [`EventLog::prepare`] (assign seq, build the
//! record) and [`EventLog::commit`] (publish + fan out). The session store
//! serializes prepare/commit pairs per session; [`EventLog::append`] is the
//! one-step form for volatile paths and tests.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::event::{Direction, Event, EventKind, now_ms};

/// Bounded queue depth per subscriber, on top of any replayed backlog.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// One item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum LogDelivery {
    /// The next event in sequence order
    Event(Event),
    /// Terminal signal: the requested start is older than retention.
    /// The subscriber must treat the session as unresumable.
    Gap {
        /// The sequence number the subscriber asked for
        requested: u64,
        /// The oldest sequence number still retained
        earliest_retained: u64,
    },
}

/// A live subscription to a session's event log.
///
/// Yields stored events from the requested start, then newly appended events
/// as they occur. The stream ends cleanly when the session is evicted or the
/// subscriber is dropped from the log.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LogDelivery>,
}

impl Subscription {
    /// Identifier for explicit unsubscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next delivery; `None` means the subscription ended.
    pub async fn recv(&mut self) -> Option<LogDelivery> {
        self.rx.recv().await
    }

    /// Convert into a `Stream` of deliveries.
    pub fn into_stream(self) -> ReceiverStream<LogDelivery> {
        ReceiverStream::new(self.rx)
    }
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<LogDelivery>,
}

impl std::fmt::Debug for SubscriberSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSlot").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
struct LogState {
    events: VecDeque<Event>,
    next_seq: u64,
    earliest_retained: u64,
    last_occurred_at: u64,
    subscribers: Vec<SubscriberSlot>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Append-only ordered event sequence with live fan-out and replay.
#[derive(Debug)]
pub struct EventLog {
    state: Mutex<LogState>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create an empty log. Sequence numbers start at 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                events: VecDeque::new(),
                next_seq: 1,
                earliest_retained: 1,
                last_occurred_at: 0,
                subscribers: Vec::new(),
                next_subscriber_id: 1,
                closed: false,
            }),
        }
    }

    /// Rebuild a log from persisted events (hydration after restart).
    ///
    /// Events must already be in seq order; the next assigned seq continues
    /// after the last one.
    pub fn from_events(events: Vec<Event>) -> Self {
        let next_seq = events.last().map_or(1, |e| e.seq + 1);
        let earliest_retained = events.first().map_or(next_seq, |e| e.seq);
        let last_occurred_at = events.last().map_or(0, |e| e.occurred_at);
        Self {
            state: Mutex::new(LogState {
                events: events.into(),
                next_seq,
                earliest_retained,
                last_occurred_at,
                subscribers: Vec::new(),
                next_subscriber_id: 1,
                closed: false,
            }),
        }
    }

    /// Build the next event without publishing it.
    ///
    /// The caller must `commit` the returned event before preparing another;
    /// the session store holds a per-session append lock across the pair.
    /// `occurred_at` is clamped so it never runs backwards.
    pub fn prepare(&self, direction: Direction, kind: EventKind, payload: Value) -> Event {
        let state = self.state.lock();
        Event {
            seq: state.next_seq,
            occurred_at: now_ms().max(state.last_occurred_at),
            stored_at: None,
            direction,
            kind,
            payload,
        }
    }

    /// Publish a prepared event and fan it out to subscribers.
    ///
    /// Returns the assigned sequence number.
    ///
    /// # Panics
    ///
    /// Panics if the event's seq does not match the log's next seq, which
    /// indicates a missing append lock in the caller.
    pub fn commit(&self, mut event: Event) -> u64 {
        let mut state = self.state.lock();
        assert_eq!(
            event.seq, state.next_seq,
            "event committed out of order; appends must be serialized"
        );
        event.occurred_at = event.occurred_at.max(state.last_occurred_at);
        let seq = event.seq;
        state.next_seq = seq + 1;
        state.last_occurred_at = event.occurred_at;
        state.events.push_back(event.clone());
        Self::fan_out(&mut state, &event);
        seq
    }

    /// One-step append for volatile paths and tests.
    pub fn append(&self, direction: Direction, kind: EventKind, payload: Value) -> Event {
        let event = self.prepare(direction, kind, payload);
        let mut published = event.clone();
        published.seq = self.commit(event);
        published
    }

    /// Publish an event observed through backend polling.
    ///
    /// Only the event contiguous with the local tail is accepted, so an
    /// event already seen via a local append is never delivered twice.
    /// Returns `false` when the event was a duplicate or out of order.
    pub fn commit_external(&self, event: Event) -> bool {
        {
            let state = self.state.lock();
            if event.seq != state.next_seq {
                return false;
            }
        }
        self.commit(event);
        true
    }

    fn fan_out(state: &mut LogState, event: &Event) {
        state.subscribers.retain(|slot| {
            match slot.tx.try_send(LogDelivery::Event(event.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = slot.id,
                        seq = event.seq,
                        "subscriber queue full, disconnecting slow consumer"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Subscribe from a sequence number.
    ///
    /// Stored events with `seq >= from_seq` are replayed first, then newly
    /// appended events follow. If `from_seq` predates retention the
    /// subscription yields a single [`LogDelivery::Gap`] and ends.
    pub fn subscribe(&self, from_seq: u64) -> Subscription {
        let mut state = self.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        if state.closed {
            let (_tx, rx) = mpsc::channel(1);
            return Subscription { id, rx };
        }

        if from_seq < state.earliest_retained {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(LogDelivery::Gap {
                requested: from_seq,
                earliest_retained: state.earliest_retained,
            });
            return Subscription { id, rx };
        }

        let backlog: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(backlog.len() + SUBSCRIBER_QUEUE_DEPTH);
        for event in backlog {
            // Capacity covers the whole backlog, so this cannot fail.
            let _ = tx.try_send(LogDelivery::Event(event));
        }
        state.subscribers.push(SubscriberSlot { id, tx });
        Subscription { id, rx }
    }

    /// Drop a subscriber. Idempotent; unknown ids are ignored.
    pub fn unsubscribe(&self, subscription_id: u64) {
        let mut state = self.state.lock();
        state.subscribers.retain(|slot| slot.id != subscription_id);
    }

    /// Drop events older than the resume window.
    ///
    /// Events are retained at least `resume_timeout_ms` past their
    /// `occurred_at`. Returns the number of events dropped.
    pub fn prune(&self, now_ms: u64, resume_timeout_ms: u64) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while let Some(front) = state.events.front() {
            if front.occurred_at.saturating_add(resume_timeout_ms) <= now_ms {
                state.events.pop_front();
                dropped += 1;
            } else {
                break;
            }
        }
        state.earliest_retained = state.events.front().map_or(state.next_seq, |e| e.seq);
        dropped
    }

    /// Terminate every subscriber cleanly (stream end, not Gap) and refuse
    /// new subscriptions. Called on session eviction.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Highest assigned sequence number, 0 if nothing was appended.
    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Oldest retained sequence number.
    pub fn earliest_retained(&self) -> u64 {
        self.state.lock().earliest_retained
    }

    /// `occurred_at` of the newest event, 0 for an empty log.
    pub fn last_occurred_at(&self) -> u64 {
        self.state.lock().last_occurred_at
    }

    /// Snapshot of all retained events (for persistence).
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn append_n(log: &EventLog, n: u64) {
        for i in 0..n {
            log.append(
                Direction::Outbound,
                EventKind::Notification,
                json!({"i": i}),
            );
        }
    }

    #[test]
    fn seqs_are_dense_from_one() {
        let log = EventLog::new();
        append_n(&log, 5);
        let seqs: Vec<u64> = log.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.last_seq(), 5);
    }

    #[test]
    fn occurred_at_is_monotone() {
        let log = EventLog::new();
        append_n(&log, 50);
        let events = log.events();
        for pair in events.windows(2) {
            assert!(pair[0].occurred_at <= pair[1].occurred_at);
        }
    }

    #[tokio::test]
    async fn subscribe_replays_then_goes_live() {
        let log = EventLog::new();
        append_n(&log, 3);
        let mut sub = log.subscribe(2);

        // Replay: seq 2 and 3.
        for expected in [2u64, 3] {
            let Some(LogDelivery::Event(e)) = sub.recv().await else {
                panic!("expected replayed event {expected}");
            };
            assert_eq!(e.seq, expected);
        }

        // Live: a new append arrives next.
        log.append(Direction::Inbound, EventKind::Request, json!({}));
        let Some(LogDelivery::Event(e)) = sub.recv().await else {
            panic!("expected live event");
        };
        assert_eq!(e.seq, 4);
    }

    #[tokio::test]
    async fn two_subscribers_observe_the_same_order() {
        let log = EventLog::new();
        append_n(&log, 2);
        let mut a = log.subscribe(1);
        let mut b = log.subscribe(1);
        append_n(&log, 3);

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..5 {
            match (a.recv().await, b.recv().await) {
                (Some(LogDelivery::Event(ea)), Some(LogDelivery::Event(eb))) => {
                    seen_a.push(ea.seq);
                    seen_b.push(eb.seq);
                }
                other => panic!("unexpected delivery: {other:?}"),
            }
        }
        assert_eq!(seen_a, vec![1, 2, 3, 4, 5]);
        assert_eq!(seen_a, seen_b);
    }

    #[tokio::test]
    async fn gap_when_start_predates_retention() {
        let log = EventLog::new();
        append_n(&log, 4);
        // Make everything prunable, then prune.
        let dropped = log.prune(now_ms() + 60_000, 30_000);
        assert_eq!(dropped, 4);
        assert_eq!(log.earliest_retained(), 5);

        let mut sub = log.subscribe(2);
        assert_eq!(
            sub.recv().await,
            Some(LogDelivery::Gap {
                requested: 2,
                earliest_retained: 5
            })
        );
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn prune_respects_the_resume_window() {
        let log = EventLog::new();
        append_n(&log, 3);
        // Within the window nothing may be dropped.
        assert_eq!(log.prune(now_ms(), 30_000), 0);
        assert_eq!(log.earliest_retained(), 1);
    }

    #[tokio::test]
    async fn close_ends_subscribers_cleanly() {
        let log = EventLog::new();
        append_n(&log, 1);
        let mut sub = log.subscribe(1);
        let Some(LogDelivery::Event(_)) = sub.recv().await else {
            panic!("expected replay");
        };
        log.close();
        assert_eq!(sub.recv().await, None);
        // Subscriptions opened after close end immediately.
        let mut late = log.subscribe(1);
        assert_eq!(late.recv().await, None);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let log = EventLog::new();
        let sub = log.subscribe(1);
        assert_eq!(log.subscriber_count(), 1);
        log.unsubscribe(sub.id());
        log.unsubscribe(sub.id());
        assert_eq!(log.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_not_blocking() {
        let log = EventLog::new();
        let mut sub = log.subscribe(1);
        // Overflow the bounded queue without draining.
        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
            log.append(Direction::Outbound, EventKind::Notification, json!({}));
        }
        assert_eq!(log.subscriber_count(), 0);
        // The subscriber drains what was queued, then ends.
        let mut received = 0;
        while let Some(LogDelivery::Event(_)) = sub.recv().await {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_DEPTH);
    }

    #[test]
    fn external_commits_deduplicate_by_seq() {
        let log = EventLog::new();
        append_n(&log, 2);
        let duplicate = Event {
            seq: 2,
            occurred_at: now_ms(),
            stored_at: Some(now_ms()),
            direction: Direction::Outbound,
            kind: EventKind::Notification,
            payload: json!({}),
        };
        assert!(!log.commit_external(duplicate));

        let next = Event {
            seq: 3,
            occurred_at: now_ms(),
            stored_at: Some(now_ms()),
            direction: Direction::Outbound,
            kind: EventKind::Notification,
            payload: json!({}),
        };
        assert!(log.commit_external(next));
        assert_eq!(log.last_seq(), 3);
    }

    #[test]
    fn hydration_continues_the_sequence() {
        let events = vec![
            Event {
                seq: 1,
                occurred_at: 10,
                stored_at: Some(11),
                direction: Direction::Inbound,
                kind: EventKind::Request,
                payload: json!({}),
            },
            Event {
                seq: 2,
                occurred_at: 20,
                stored_at: Some(21),
                direction: Direction::Outbound,
                kind: EventKind::Response,
                payload: json!({}),
            },
        ];
        let log = EventLog::from_events(events);
        assert_eq!(log.last_seq(), 2);
        let event = log.append(Direction::Outbound, EventKind::Notification, json!({}));
        assert_eq!(event.seq, 3);
    }
}
