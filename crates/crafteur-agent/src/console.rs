//! Console history and non-blocking fan-out to live subscribers.

use std::collections::VecDeque;

use crafteur_process::ConsoleEvent;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Lines kept for replay to new subscribers.
pub const LOG_HISTORY_CAPACITY: usize = 100;

pub type SubscriberId = u64;

/// A live console feed. Dropping it is enough to detach; the slot is pruned on the next broadcast.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::Receiver<ConsoleEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ConsoleEvent> {
        self.events.recv().await
    }
}

#[derive(Debug)]
pub(crate) struct LogRing {
    next_seq: u64,
    capacity: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub(crate) fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.lines.iter().map(|(_, l)| l.clone()).collect()
    }

    pub(crate) fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Convenience for UI polling: if cursor is 0, return the most recent lines.
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lines.len()
    }
}

#[derive(Debug)]
pub(crate) struct Console {
    history: LogRing,
    subscribers: Vec<(SubscriberId, mpsc::Sender<ConsoleEvent>)>,
    next_subscriber: SubscriberId,
    subscriber_capacity: usize,
}

impl Console {
    pub(crate) fn new(subscriber_capacity: usize) -> Self {
        Self {
            history: LogRing::new(LOG_HISTORY_CAPACITY),
            subscribers: Vec::new(),
            next_subscriber: 1,
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    pub(crate) fn push_line(&mut self, line: String) {
        self.history.push_line(line.clone());
        self.publish(ConsoleEvent::Log(line));
    }

    /// Never waits: a full subscriber misses this event, a closed one is dropped.
    pub(crate) fn publish(&mut self, event: ConsoleEvent) {
        self.subscribers
            .retain(|(id, tx)| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(subscriber = id, "console subscriber full; event dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    pub(crate) fn subscribe(&mut self) -> Subscription {
        let id = self.next_subscriber;
        self.next_subscriber = self.next_subscriber.saturating_add(1);
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        self.subscribers.push((id, tx));
        Subscription { id, events: rx }
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub(crate) fn history(&self) -> Vec<String> {
        self.history.snapshot()
    }

    pub(crate) fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.history.tail_after(cursor, limit)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent_lines_in_order() {
        let mut ring = LogRing::new(LOG_HISTORY_CAPACITY);
        for i in 0..150 {
            ring.push_line(format!("line {i}"));
            assert!(ring.len() <= LOG_HISTORY_CAPACITY);
        }
        let lines = ring.snapshot();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines.first().map(String::as_str), Some("line 50"));
        assert_eq!(lines.last().map(String::as_str), Some("line 149"));
        assert!(lines.windows(2).all(|w| {
            let a: u32 = w[0].trim_start_matches("line ").parse().unwrap();
            let b: u32 = w[1].trim_start_matches("line ").parse().unwrap();
            b == a + 1
        }));
    }

    #[test]
    fn tail_after_pages_forward() {
        let mut ring = LogRing::new(10);
        for i in 1..=5 {
            ring.push_line(format!("l{i}"));
        }
        let (lines, cursor) = ring.tail_after(0, 2);
        assert_eq!(lines, ["l4", "l5"]);
        assert_eq!(cursor, 5);

        let (lines, cursor) = ring.tail_after(2, 2);
        assert_eq!(lines, ["l3", "l4"]);
        assert_eq!(cursor, 4);

        let (lines, cursor) = ring.tail_after(5, 10);
        assert!(lines.is_empty());
        assert_eq!(cursor, 5);
    }

    #[test]
    fn stalled_subscriber_does_not_block_others() {
        let mut console = Console::new(4);
        let _stalled = console.subscribe();
        let mut active = console.subscribe();

        for i in 0..20 {
            console.push_line(format!("line {i}"));
            match active.events.try_recv() {
                Ok(ConsoleEvent::Log(l)) => assert_eq!(l, format!("line {i}")),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(console.subscriber_count(), 2);
        assert_eq!(console.history().len(), 20);
    }

    #[test]
    fn full_subscriber_keeps_first_events_and_drops_the_rest() {
        let mut console = Console::new(2);
        let mut sub = console.subscribe();
        for i in 0..5 {
            console.push_line(format!("line {i}"));
        }
        assert_eq!(sub.events.try_recv().unwrap(), ConsoleEvent::Log("line 0".into()));
        assert_eq!(sub.events.try_recv().unwrap(), ConsoleEvent::Log("line 1".into()));
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn dropped_and_unsubscribed_receivers_are_removed() {
        let mut console = Console::new(4);
        let dropped = console.subscribe();
        let kept = console.subscribe();
        drop(dropped);

        console.publish(ConsoleEvent::Log("x".into()));
        assert_eq!(console.subscriber_count(), 1);

        assert!(console.unsubscribe(kept.id));
        assert!(!console.unsubscribe(kept.id));
        assert_eq!(console.subscriber_count(), 0);
    }
}
