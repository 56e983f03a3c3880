//! Machine inboxes.
//!
//! An inbox is a FIFO queue of envelopes with a dequeue rule that understands
//! the current state's deferred and ignored sets: deferred events keep their
//! queue position, ignored events in front of the first dequeuable event are
//! dropped. A pending receive overrides the rule entirely and consumes only
//! matching event types.

use std::collections::VecDeque;

use crate::event::EventEnvelope;
use crate::machine::metadata::FlatState;
use crate::types::EventType;

/// Outcome of a dequeue attempt.
pub(crate) enum Dequeued {
    /// A dequeuable envelope, with the number of ignored events dropped while
    /// scanning to it.
    Event(EventEnvelope, u64),
    /// No dequeuable envelope; only deferred or ignored events remain (or the
    /// inbox is empty).
    None,
}

/// FIFO event queue for one machine.
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    queue: VecDeque<EventEnvelope>,
}

impl Inbox {
    pub(crate) fn enqueue(&mut self, envelope: EventEnvelope) {
        self.queue.push_back(envelope);
    }

    /// Takes the first dequeuable envelope under the given state, dropping
    /// ignored events encountered in front of it. Deferred events keep their
    /// position.
    pub(crate) fn dequeue(&mut self, state: &FlatState) -> Dequeued {
        let mut index = 0;
        let mut dropped = 0_u64;
        while index < self.queue.len() {
            let ty = self.queue[index].event_type().clone();
            if state.is_ignored(&ty) {
                let _ = self.queue.remove(index);
                dropped += 1;
            } else if state.is_deferred(&ty) {
                index += 1;
            } else {
                let envelope = self
                    .queue
                    .remove(index)
                    .expect("index bounded by queue length");
                return Dequeued::Event(envelope, dropped);
            }
        }
        Dequeued::None
    }

    /// Takes the first envelope whose type is in `wanted`, leaving everything
    /// else in place. This is the receive rule: non-matching events are
    /// deferred regardless of the current state's sets.
    pub(crate) fn take_matching(&mut self, wanted: &[EventType]) -> Option<EventEnvelope> {
        let index = self
            .queue
            .iter()
            .position(|env| wanted.contains(env.event_type()))?;
        self.queue.remove(index)
    }

    /// Returns true if a dequeue attempt under the given state would yield an
    /// envelope.
    pub(crate) fn has_dequeuable(&self, state: &FlatState) -> bool {
        self.queue
            .iter()
            .any(|env| state.is_dequeuable(env.event_type()))
    }

    /// Returns true if an envelope matching the receive set is queued.
    pub(crate) fn has_matching(&self, wanted: &[EventType]) -> bool {
        self.queue
            .iter()
            .any(|env| wanted.contains(env.event_type()))
    }

    /// Counts queued events of the given type.
    pub(crate) fn count_of_type(&self, ty: &EventType) -> usize {
        self.queue
            .iter()
            .filter(|env| env.event_type() == ty)
            .count()
    }

    /// Returns true if an envelope with the given send sequence is queued.
    pub(crate) fn contains_seq(&self, send_seq: u64) -> bool {
        self.queue.iter().any(|env| env.send_seq == send_seq)
    }

    /// Puts an envelope back at the head of the queue (reliable-overlay
    /// rollback of a dequeue).
    pub(crate) fn push_front(&mut self, envelope: EventEnvelope) {
        self.queue.push_front(envelope);
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discards the queue (machine halted), returning how many events were
    /// dropped.
    pub(crate) fn discard(&mut self) -> u64 {
        let dropped = self.queue.len() as u64;
        self.queue.clear();
        dropped
    }

    /// The most recently enqueued envelope.
    pub(crate) fn last(&self) -> Option<&EventEnvelope> {
        self.queue.back()
    }

    /// Event types currently queued, for deadlock reporting.
    pub(crate) fn queued_types(&self) -> Vec<EventType> {
        self.queue
            .iter()
            .map(|env| env.event_type().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::machine::metadata::MachineTypeBuilder;
    use crate::types::{OperationGroupId, StateName};

    fn envelope(ty: &str, seq: u64) -> EventEnvelope {
        EventEnvelope {
            event: Event::new(ty),
            sender: None,
            operation_group: OperationGroupId::NIL,
            send_seq: seq,
            must_handle: false,
        }
    }

    fn test_state() -> crate::machine::metadata::MachineType {
        #[derive(Default)]
        struct Data;
        MachineTypeBuilder::<Data>::new("M")
            .state("S", |s| s.start().defer("D").ignore("I").on("E", |_, _| Ok(())))
            .build()
            .unwrap()
    }

    #[test]
    fn deferred_events_keep_their_position() {
        let mtype = test_state();
        let state = mtype.state(&StateName::new("S")).unwrap();

        let mut inbox = Inbox::default();
        inbox.enqueue(envelope("D", 1));
        inbox.enqueue(envelope("E", 2));

        match inbox.dequeue(state) {
            Dequeued::Event(env, dropped) => {
                assert_eq!(env.event_type().name(), "E");
                assert_eq!(dropped, 0);
            }
            Dequeued::None => panic!("expected E to be dequeuable"),
        }
        // The deferred event is still at the head.
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.queued_types()[0].name(), "D");
    }

    #[test]
    fn ignored_events_are_dropped_on_dequeue() {
        let mtype = test_state();
        let state = mtype.state(&StateName::new("S")).unwrap();

        let mut inbox = Inbox::default();
        inbox.enqueue(envelope("I", 1));
        inbox.enqueue(envelope("I", 2));
        inbox.enqueue(envelope("E", 3));

        match inbox.dequeue(state) {
            Dequeued::Event(env, dropped) => {
                assert_eq!(env.event_type().name(), "E");
                assert_eq!(dropped, 2);
            }
            Dequeued::None => panic!("expected E to be dequeuable"),
        }
        assert!(inbox.is_empty());
    }

    #[test]
    fn deferred_only_inbox_yields_nothing() {
        let mtype = test_state();
        let state = mtype.state(&StateName::new("S")).unwrap();

        let mut inbox = Inbox::default();
        inbox.enqueue(envelope("D", 1));
        assert!(matches!(inbox.dequeue(state), Dequeued::None));
        assert_eq!(inbox.len(), 1);
        assert!(!inbox.has_dequeuable(state));
    }

    #[test]
    fn receive_rule_skips_non_matching() {
        let mut inbox = Inbox::default();
        inbox.enqueue(envelope("E2", 1));
        inbox.enqueue(envelope("E1", 2));

        let wanted = [EventType::new("E1")];
        assert!(inbox.has_matching(&wanted));
        let env = inbox.take_matching(&wanted).unwrap();
        assert_eq!(env.event_type().name(), "E1");

        // The non-matching event stays queued, at the head.
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.queued_types()[0].name(), "E2");
    }

    #[test]
    fn type_counting_and_sequences() {
        let mut inbox = Inbox::default();
        inbox.enqueue(envelope("E", 7));
        inbox.enqueue(envelope("E", 8));
        inbox.enqueue(envelope("F", 9));
        assert_eq!(inbox.count_of_type(&EventType::new("E")), 2);
        assert!(inbox.contains_seq(8));
        assert!(!inbox.contains_seq(10));
        assert_eq!(inbox.discard(), 3);
        assert!(inbox.is_empty());
    }
}
