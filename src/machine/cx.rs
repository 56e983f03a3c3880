//! The machine-side capability context.
//!
//! Every handler receives a [`MachineCx`]: the only doorway to side effects.
//! There is no ambient runtime global; raises, transitions, sends, creates,
//! monitor invocations, and nondeterministic choices all flow through the
//! context, which traps them in the current step's frame so the scheduler can
//! apply them at a controlled point. Sends and creates are buffered and
//! applied atomically when the step ends or suspends; transitions are applied
//! after the handler returns; monitor invocations and random choices take
//! effect immediately (both are scheduler checkpoints, not peer mutations).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventEnvelope, SendOptions};
use crate::runtime::RuntimeInner;
use crate::types::{EventType, MachineId, OperationGroupId, StateName};

/// A stack operation trapped during handler execution, applied in order
/// after the handler returns.
#[derive(Debug, Clone)]
pub(crate) enum Transition {
    Goto(StateName),
    Push(StateName),
    Pop,
    Halt,
}

/// A buffered side effect, applied when the step ends or suspends.
pub(crate) enum Effect {
    Send {
        sender_state: StateName,
        target: MachineId,
        event: Event,
        operation_group: OperationGroupId,
        send_seq: u64,
        must_handle: bool,
        assert_at_most_n: Option<u32>,
    },
    Create {
        id: MachineId,
        type_name: String,
        event: Option<Event>,
    },
}

/// Receive bookkeeping for a suspended handler.
#[derive(Default)]
pub(crate) struct ReceiveSlot {
    /// Event types the parked handler will accept.
    pub(crate) waiting: Option<Vec<EventType>>,
    /// Envelope the scheduler delivered for the next resume.
    pub(crate) delivered: Option<EventEnvelope>,
}

/// Mutable state of one in-flight step.
pub(crate) struct StepFrame {
    pub(crate) machine: MachineId,
    /// Top of the state stack; the runner keeps this in sync across
    /// transitions so trace attribution is accurate.
    pub(crate) current_state: StateName,
    pub(crate) current_event: Option<EventEnvelope>,
    pub(crate) operation_group: OperationGroupId,
    /// Event raised this step; at most one.
    pub(crate) raised: Option<Event>,
    pub(crate) transitions: VecDeque<Transition>,
    pub(crate) effects: Vec<Effect>,
    pub(crate) receive: ReceiveSlot,
}

impl StepFrame {
    pub(crate) fn new(
        machine: MachineId,
        current_state: StateName,
        operation_group: OperationGroupId,
    ) -> Self {
        Self {
            machine,
            current_state,
            current_event: None,
            operation_group,
            raised: None,
            transitions: VecDeque::new(),
            effects: Vec::new(),
            receive: ReceiveSlot::default(),
        }
    }
}

/// The capability context handed to machine handlers.
///
/// Cloning is cheap; async handlers keep a clone across suspension points.
pub struct MachineCx {
    pub(crate) inner: Rc<RuntimeInner>,
    pub(crate) frame: Rc<RefCell<StepFrame>>,
}

impl Clone for MachineCx {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            frame: Rc::clone(&self.frame),
        }
    }
}

impl MachineCx {
    /// The id of the machine executing this step.
    #[must_use]
    pub fn id(&self) -> MachineId {
        self.frame.borrow().machine.clone()
    }

    /// The name of the current (top) state.
    #[must_use]
    pub fn current_state(&self) -> StateName {
        self.frame.borrow().current_state.clone()
    }

    /// The event being handled this step, if any.
    #[must_use]
    pub fn current_event(&self) -> Option<Event> {
        self.frame
            .borrow()
            .current_event
            .as_ref()
            .map(|env| env.event.clone())
    }

    /// The sender of the event being handled, if it came from a machine.
    #[must_use]
    pub fn sender(&self) -> Option<MachineId> {
        self.frame
            .borrow()
            .current_event
            .as_ref()
            .and_then(|env| env.sender.clone())
    }

    /// The operation group this step runs under.
    #[must_use]
    pub fn operation_group(&self) -> OperationGroupId {
        self.frame.borrow().operation_group
    }

    /// Raises an event, to be dispatched to this machine before any inbox
    /// event.
    ///
    /// # Errors
    ///
    /// At most one event may be raised per step; a second raise is a
    /// programming error reported as a bug.
    pub fn raise(&self, event: Event) -> Result<()> {
        let mut frame = self.frame.borrow_mut();
        if frame.raised.is_some() {
            return Err(Error::new(ErrorKind::DoubleRaise).with_context(format!(
                "{} raised {} while an earlier raise is still pending",
                frame.machine,
                event.event_type()
            )));
        }
        frame.raised = Some(event);
        Ok(())
    }

    /// Transitions to `state`: pops the current frame and pushes the target,
    /// running exit and entry handlers in between.
    pub fn goto_state(&self, state: &str) {
        self.frame
            .borrow_mut()
            .transitions
            .push_back(Transition::Goto(StateName::new(state)));
    }

    /// Pushes `state` without popping the current frame.
    pub fn push_state(&self, state: &str) {
        self.frame
            .borrow_mut()
            .transitions
            .push_back(Transition::Push(StateName::new(state)));
    }

    /// Pops the current frame; popping the last frame halts the machine.
    pub fn pop_state(&self) {
        self.frame.borrow_mut().transitions.push_back(Transition::Pop);
    }

    /// Halts the machine at the end of this step.
    pub fn halt(&self) {
        self.frame
            .borrow_mut()
            .transitions
            .push_back(Transition::Halt);
    }

    /// Sends an event to another machine.
    ///
    /// The enqueue is buffered and becomes visible when this step ends or
    /// suspends; per-sender FIFO order is preserved.
    ///
    /// # Errors
    ///
    /// Fails only on runtime-internal errors; delivery problems (halted
    /// target, in-flight bounds) surface when the buffer is applied.
    pub fn send(&self, target: &MachineId, event: Event) -> Result<()> {
        self.send_with(target, event, SendOptions::new())
    }

    /// Sends an event with explicit options.
    ///
    /// # Errors
    ///
    /// See [`MachineCx::send`].
    pub fn send_with(&self, target: &MachineId, event: Event, options: SendOptions) -> Result<()> {
        let send_seq = self.inner.alloc_send_seq();
        let mut frame = self.frame.borrow_mut();
        let operation_group = options
            .operation_group_id
            .unwrap_or(frame.operation_group);
        let sender_state = frame.current_state.clone();
        frame.effects.push(Effect::Send {
            sender_state,
            target: target.clone(),
            event,
            operation_group,
            send_seq,
            must_handle: options.must_handle,
            assert_at_most_n: options.assert_at_most_n,
        });
        Ok(())
    }

    /// Creates a machine of the registered type.
    ///
    /// The id is allocated immediately; the machine itself joins the
    /// run-queue when this step ends or suspends.
    ///
    /// # Errors
    ///
    /// Fails if the type is not registered.
    pub fn create_machine(&self, type_name: &str, event: Option<Event>) -> Result<MachineId> {
        let id = self.inner.alloc_machine_id(type_name, None)?;
        self.frame.borrow_mut().effects.push(Effect::Create {
            id: id.clone(),
            type_name: type_name.to_string(),
            event,
        });
        Ok(id)
    }

    /// Creates a machine and synchronously drives it until it is idle or
    /// blocked. No other machine runs in between.
    ///
    /// # Errors
    ///
    /// Fails if the type is not registered or the nested execution forms an
    /// await cycle.
    pub fn create_and_execute(&self, type_name: &str, event: Option<Event>) -> Result<MachineId> {
        crate::runtime::scheduler::create_and_execute(&self.inner, type_name, None, event)
    }

    /// Sends an event and synchronously drives the target until it is idle
    /// or blocked. Returns true if the event was handled before the target
    /// went quiescent.
    ///
    /// # Errors
    ///
    /// Fails if the target does not exist or the nested execution forms an
    /// await cycle.
    pub fn send_and_execute(&self, target: &MachineId, event: Event) -> Result<bool> {
        crate::runtime::scheduler::send_and_execute(&self.inner, target, event)
    }

    /// Invokes a registered specification monitor with an event. The monitor
    /// runs to quiescence within this step.
    ///
    /// # Errors
    ///
    /// Fails if the monitor is not registered or its assertion fails.
    pub fn monitor(&self, monitor_type: &str, event: Event) -> Result<()> {
        self.inner.invoke_monitor(monitor_type, event)
    }

    /// Returns a controlled nondeterministic boolean: true with probability
    /// `1/max` under the random strategy, both values explored under DFS.
    ///
    /// # Errors
    ///
    /// Fails on replay divergence or schedule exhaustion.
    pub fn random_bool(&self, max: u32) -> Result<bool> {
        let (machine, state) = self.origin();
        self.inner.next_random_bool(max, Some((machine, state)))
    }

    /// Returns a controlled nondeterministic integer in `[0, max)`.
    ///
    /// # Errors
    ///
    /// Fails on replay divergence or schedule exhaustion.
    pub fn random_int(&self, max: u32) -> Result<u32> {
        let (machine, state) = self.origin();
        self.inner.next_random_int(max, Some((machine, state)))
    }

    /// Asserts a safety condition; failure is reported as a bug with this
    /// machine and state attached.
    ///
    /// # Errors
    ///
    /// Returns an assertion-failure error when `condition` is false.
    pub fn assert_that(&self, condition: bool, message: &str) -> Result<()> {
        if condition {
            Ok(())
        } else {
            Err(Error::assertion(message))
        }
    }

    /// Suspends this step until an event whose type is in `wanted` arrives.
    ///
    /// The machine is disabled while waiting; events of other types that
    /// arrive in the meantime stay in the inbox in arrival order.
    pub fn receive(&self, wanted: &[&str]) -> Receive {
        Receive {
            frame: Rc::clone(&self.frame),
            wanted: wanted.iter().map(|name| EventType::new(name)).collect(),
        }
    }

    fn origin(&self) -> (MachineId, StateName) {
        let frame = self.frame.borrow();
        (frame.machine.clone(), frame.current_state.clone())
    }
}

/// Future returned by [`MachineCx::receive`].
///
/// Resolves to the matching event once the scheduler delivers one.
pub struct Receive {
    frame: Rc<RefCell<StepFrame>>,
    wanted: Vec<EventType>,
}

impl Future for Receive {
    type Output = Result<Event>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut frame = self.frame.borrow_mut();
        if let Some(envelope) = frame.receive.delivered.take() {
            frame.receive.waiting = None;
            frame.operation_group = envelope.operation_group;
            let event = envelope.event.clone();
            frame.current_event = Some(envelope);
            Poll::Ready(Ok(event))
        } else {
            frame.receive.waiting = Some(self.wanted.clone());
            Poll::Pending
        }
    }
}
