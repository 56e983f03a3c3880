//! Events, send options, and inbox envelopes.
//!
//! An [`Event`] is an immutable value: a type identifier plus an optional
//! payload. Payloads are opaque to the runtime; handler resolution looks only
//! at the type. The runtime wraps every sent event in an [`EventEnvelope`]
//! carrying its provenance (sender, operation group, send sequence), which is
//! what inboxes store and traces reference.

use std::any::Any;
use std::rc::Rc;

use crate::types::{EventType, MachineId, OperationGroupId};

/// An immutable, typed event.
#[derive(Clone)]
pub struct Event {
    ty: EventType,
    payload: Option<Rc<dyn Any>>,
}

impl Event {
    /// Creates an event with no payload.
    #[must_use]
    pub fn new(ty: impl Into<EventType>) -> Self {
        Self {
            ty: ty.into(),
            payload: None,
        }
    }

    /// Creates the reserved halt event.
    #[must_use]
    pub fn halt() -> Self {
        Self::new(EventType::halt())
    }

    /// Attaches a payload to the event.
    #[must_use]
    pub fn with_payload<T: Any>(mut self, payload: T) -> Self {
        self.payload = Some(Rc::new(payload));
        self
    }

    /// Returns the event type.
    #[must_use]
    pub const fn event_type(&self) -> &EventType {
        &self.ty
    }

    /// Returns the payload downcast to `T`, if present and of that type.
    #[must_use]
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.ty.name())
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Options attached to a single send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the operation group propagated with the event.
    pub operation_group_id: Option<OperationGroupId>,
    /// Makes dropping the event on a halted target a reported bug instead of
    /// a logged drop.
    pub must_handle: bool,
    /// Requires that the target inbox hold at most this many undequeued
    /// events of the same type, counting this send.
    pub assert_at_most_n: Option<u32>,
}

impl SendOptions {
    /// Creates default send options.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            operation_group_id: None,
            must_handle: false,
            assert_at_most_n: None,
        }
    }

    /// Overrides the operation group for this send.
    #[must_use]
    pub const fn with_operation_group(mut self, group: OperationGroupId) -> Self {
        self.operation_group_id = Some(group);
        self
    }

    /// Marks the event as must-handle.
    #[must_use]
    pub const fn must_handle(mut self) -> Self {
        self.must_handle = true;
        self
    }

    /// Bounds the number of in-flight events of this type at the target.
    #[must_use]
    pub const fn assert_at_most(mut self, n: u32) -> Self {
        self.assert_at_most_n = Some(n);
        self
    }
}

/// An event queued in a machine inbox, together with its provenance.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// The event itself.
    pub event: Event,
    /// The sending machine, or `None` for events injected by the test
    /// harness or delivered at machine creation.
    pub sender: Option<MachineId>,
    /// Correlation tag propagated from the sender.
    pub operation_group: OperationGroupId,
    /// Global send sequence number; establishes per-sender FIFO order.
    pub send_seq: u64,
    /// Whether dropping this event on a halted target is a bug.
    pub must_handle: bool,
}

impl EventEnvelope {
    /// Returns the event type of the enclosed event.
    #[must_use]
    pub const fn event_type(&self) -> &EventType {
        self.event.event_type()
    }
}
