//! Machine instances and single-step execution.
//!
//! An instance owns the mutable half of a machine: its state stack, inbox,
//! raised-event slot, pending receive, and halted flag. The immutable half
//! (handlers, transition maps) lives in the shared [`MachineType`].
//!
//! A step runs to completion or to a suspension point via [`StepRunner`]: the
//! scheduler dispatches one envelope (raised, received, or dequeued), the
//! runner polls the handler future, then applies the trapped transitions in
//! order, running exit and entry handlers as the stack changes. Only the poll
//! of user code can suspend; everything else is synchronous.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{Error, ErrorKind, Result};
use crate::event::EventEnvelope;
use crate::machine::cx::{MachineCx, StepFrame, Transition};
use crate::machine::inbox::Inbox;
use crate::machine::metadata::{ActionFuture, DataCell, EventReaction, MachineType};
use crate::runtime::RuntimeInner;
use crate::types::{EventType, MachineId, OperationGroupId, StateName};

/// Waker for handler futures. Machine handlers only suspend in `receive`,
/// where resumption is driven by the scheduler, so waking is a no-op.
struct StepWaker;

impl Wake for StepWaker {
    fn wake(self: Arc<Self>) {}
}

fn step_waker() -> Waker {
    Waker::from(Arc::new(StepWaker))
}

/// Result of advancing one machine step.
pub(crate) enum StepStatus {
    /// The handler and all its transitions completed.
    Completed,
    /// The handler parked in `receive`; the runner is stored for resumption.
    Suspended,
    /// The machine halted during this step.
    Halted,
    /// User code failed; reported as a bug by the scheduler.
    Failed(Error),
}

/// Per-machine mutable state.
pub(crate) struct MachineInstance {
    pub(crate) id: MachineId,
    pub(crate) mtype: Rc<MachineType>,
    pub(crate) data: DataCell,
    pub(crate) stack: Vec<StateName>,
    pub(crate) inbox: Inbox,
    pub(crate) raised: Option<EventEnvelope>,
    pub(crate) waiting_on: Option<Vec<EventType>>,
    pub(crate) halted: bool,
    /// False until the start state's entry handler has been dispatched.
    pub(crate) started: bool,
    /// Event delivered with the creation request, dispatched to the start
    /// state's entry handler.
    pub(crate) init_event: Option<EventEnvelope>,
    pub(crate) operation_group: OperationGroupId,
    /// Parked step continuation (suspended in `receive`).
    pub(crate) pending: Option<StepRunner>,
}

impl MachineInstance {
    pub(crate) fn new(
        id: MachineId,
        mtype: Rc<MachineType>,
        init_event: Option<EventEnvelope>,
        operation_group: OperationGroupId,
    ) -> Self {
        let data = mtype.new_data();
        let start = mtype.start().clone();
        Self {
            id,
            mtype,
            data,
            stack: vec![start],
            inbox: Inbox::default(),
            raised: None,
            waiting_on: None,
            halted: false,
            started: false,
            init_event,
            operation_group,
            pending: None,
        }
    }

    /// The current (top) state. The stack is never empty for a non-halted
    /// machine.
    pub(crate) fn current_state(&self) -> StateName {
        self.stack
            .last()
            .cloned()
            .unwrap_or_else(|| self.mtype.start().clone())
    }

    /// A machine is enabled iff granting it a step makes observable progress.
    pub(crate) fn is_enabled(&self) -> Result<bool> {
        if self.halted {
            return Ok(false);
        }
        if let Some(wanted) = &self.waiting_on {
            return Ok(self.inbox.has_matching(wanted));
        }
        if !self.started || self.raised.is_some() {
            return Ok(true);
        }
        let flat = self.mtype.state(&self.current_state())?;
        Ok(self.inbox.has_dequeuable(flat))
    }

    /// Marks the machine halted, discarding its inbox. Returns the number of
    /// discarded events.
    pub(crate) fn halt(&mut self) -> u64 {
        self.halted = true;
        self.waiting_on = None;
        self.pending = None;
        self.raised = None;
        self.inbox.discard()
    }

    /// Snapshot of the fields the reliable overlay must be able to roll back.
    pub(crate) fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            stack: self.stack.clone(),
            raised: self.raised.clone(),
            halted: self.halted,
            started: self.started,
            init_event: self.init_event.clone(),
            operation_group: self.operation_group,
        }
    }

    /// Restores a snapshot taken before a failed transactional step.
    pub(crate) fn restore(&mut self, snapshot: InstanceSnapshot) {
        self.stack = snapshot.stack;
        self.raised = snapshot.raised;
        self.halted = snapshot.halted;
        self.started = snapshot.started;
        self.init_event = snapshot.init_event;
        self.operation_group = snapshot.operation_group;
        self.waiting_on = None;
        self.pending = None;
    }
}

/// Rollback state for the reliable overlay.
#[derive(Clone)]
pub(crate) struct InstanceSnapshot {
    pub(crate) stack: Vec<StateName>,
    raised: Option<EventEnvelope>,
    halted: bool,
    started: bool,
    init_event: Option<EventEnvelope>,
    operation_group: OperationGroupId,
}

// ============================================================================
// Step dispatch
// ============================================================================

/// What the scheduler decided to feed this step.
pub(crate) enum Dispatch {
    /// Run the start state's entry handler.
    Start,
    /// Dispatch a raised or dequeued envelope against the current state.
    Envelope(EventEnvelope),
    /// Resume a parked receive with the matching envelope.
    Resume(EventEnvelope),
}

/// Outcome of resolving a dispatch into a runnable step.
pub(crate) enum Dispatched {
    Runner(StepRunner),
    /// An unhandled halt event: the machine halts gracefully.
    GracefulHalt,
    /// The event has no handler: a bug.
    Unhandled(Error),
}

/// Builds the step frame and runner for a dispatch decision.
pub(crate) fn dispatch(
    inner: &Rc<RuntimeInner>,
    inst_rc: &Rc<RefCell<MachineInstance>>,
    decision: Dispatch,
) -> Result<Dispatched> {
    let (machine, state, operation_group, mtype, data) = {
        let inst = inst_rc.borrow();
        (
            inst.id.clone(),
            inst.current_state(),
            inst.operation_group,
            Rc::clone(&inst.mtype),
            Rc::clone(&inst.data),
        )
    };
    let frame = Rc::new(RefCell::new(StepFrame::new(
        machine.clone(),
        state.clone(),
        operation_group,
    )));
    let cx = MachineCx {
        inner: Rc::clone(inner),
        frame: Rc::clone(&frame),
    };

    match decision {
        Dispatch::Start => {
            let init = inst_rc.borrow_mut().init_event.take();
            if let Some(env) = &init {
                frame.borrow_mut().operation_group = env.operation_group;
            }
            frame.borrow_mut().current_event = init;
            let flat = mtype.state(&state)?;
            let phase = match &flat.entry {
                Some(entry) => {
                    inner.note_invoke_action(&machine, &state, "entry");
                    Phase::Poll(entry(data, cx))
                }
                None => Phase::Apply,
            };
            Ok(Dispatched::Runner(StepRunner { frame, phase }))
        }
        Dispatch::Resume(envelope) => {
            inner.note_receive(&machine, &state, envelope.event_type());
            inst_rc.borrow_mut().operation_group = envelope.operation_group;
            let runner = inst_rc
                .borrow_mut()
                .pending
                .take()
                .ok_or_else(|| Error::internal("resume without a parked step"))?;
            runner.frame.borrow_mut().receive.delivered = Some(envelope);
            Ok(Dispatched::Runner(runner))
        }
        Dispatch::Envelope(envelope) => {
            let flat = mtype.state(&state)?;
            let ty = envelope.event_type().clone();
            match flat.reaction(&ty) {
                Some(EventReaction::Do(action)) => {
                    inner.note_invoke_action(&machine, &state, ty.name());
                    frame.borrow_mut().operation_group = envelope.operation_group;
                    frame.borrow_mut().current_event = Some(envelope);
                    let phase = Phase::Poll(action(data, cx));
                    Ok(Dispatched::Runner(StepRunner { frame, phase }))
                }
                Some(EventReaction::Goto(target)) => {
                    let target = target.clone();
                    let mut fr = frame.borrow_mut();
                    fr.operation_group = envelope.operation_group;
                    fr.current_event = Some(envelope);
                    fr.transitions.push_back(Transition::Goto(target));
                    drop(fr);
                    Ok(Dispatched::Runner(StepRunner {
                        frame,
                        phase: Phase::Apply,
                    }))
                }
                Some(EventReaction::Push(target)) => {
                    let target = target.clone();
                    let mut fr = frame.borrow_mut();
                    fr.operation_group = envelope.operation_group;
                    fr.current_event = Some(envelope);
                    fr.transitions.push_back(Transition::Push(target));
                    drop(fr);
                    Ok(Dispatched::Runner(StepRunner {
                        frame,
                        phase: Phase::Apply,
                    }))
                }
                Some(EventReaction::Defer) => Ok(Dispatched::Unhandled(
                    Error::new(ErrorKind::UnhandledEvent).with_context(format!(
                        "{machine} cannot defer raised event {ty} in state {state}"
                    )),
                )),
                Some(EventReaction::Ignore) => {
                    // An ignored raised event is discarded; the step is empty.
                    Ok(Dispatched::Runner(StepRunner {
                        frame,
                        phase: Phase::Apply,
                    }))
                }
                None if ty.is_halt() => Ok(Dispatched::GracefulHalt),
                None => Ok(Dispatched::Unhandled(
                    Error::new(ErrorKind::UnhandledEvent)
                        .with_context(format!("{machine} received {ty} in state {state}")),
                )),
            }
        }
    }
}

// ============================================================================
// Step runner
// ============================================================================

enum Phase {
    /// Polling the current handler future.
    Poll(ActionFuture),
    /// Applying trapped transitions.
    Apply,
}

/// Drives one step of one machine: poll the handler, then apply transitions,
/// running exit/entry handlers as the stack changes. Entry handlers are
/// themselves polled and may suspend, in which case the runner parks with its
/// remaining transition queue intact.
pub(crate) struct StepRunner {
    pub(crate) frame: Rc<RefCell<StepFrame>>,
    phase: Phase,
}

impl StepRunner {
    pub(crate) fn advance(
        &mut self,
        inner: &Rc<RuntimeInner>,
        inst_rc: &Rc<RefCell<MachineInstance>>,
    ) -> StepStatus {
        loop {
            match &mut self.phase {
                Phase::Poll(future) => {
                    let waker = step_waker();
                    let mut task_cx = Context::from_waker(&waker);
                    let polled =
                        catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut task_cx)));
                    match polled {
                        Err(payload) => return StepStatus::Failed(panic_error(payload.as_ref())),
                        Ok(Poll::Pending) => {
                            let waiting = self.frame.borrow().receive.waiting.clone();
                            let Some(wanted) = waiting else {
                                return StepStatus::Failed(Error::internal(
                                    "handler suspended outside receive",
                                ));
                            };
                            let (machine, state) = self.origin();
                            inner.note_wait_to_receive(&machine, &state, &wanted);
                            inst_rc.borrow_mut().waiting_on = Some(wanted);
                            return StepStatus::Suspended;
                        }
                        Ok(Poll::Ready(Err(error))) => return StepStatus::Failed(error),
                        Ok(Poll::Ready(Ok(()))) => self.phase = Phase::Apply,
                    }
                }
                Phase::Apply => {
                    let next = self.frame.borrow_mut().transitions.pop_front();
                    match next {
                        None => return self.finish(inner, inst_rc),
                        Some(Transition::Goto(target)) => {
                            if let Err(error) = self.run_exit(inner, inst_rc) {
                                return StepStatus::Failed(error);
                            }
                            let from = {
                                let mut inst = inst_rc.borrow_mut();
                                let from = inst.current_state();
                                inst.stack.pop();
                                inst.stack.push(target.clone());
                                from
                            };
                            let machine = self.frame.borrow().machine.clone();
                            inner.note_goto(&machine, &from, &target);
                            self.frame.borrow_mut().current_state = target.clone();
                            if let Err(error) = self.enter(inner, inst_rc, &target) {
                                return StepStatus::Failed(error);
                            }
                        }
                        Some(Transition::Push(target)) => {
                            let from = {
                                let mut inst = inst_rc.borrow_mut();
                                let from = inst.current_state();
                                inst.stack.push(target.clone());
                                from
                            };
                            let machine = self.frame.borrow().machine.clone();
                            inner.note_push(&machine, &from, &target);
                            self.frame.borrow_mut().current_state = target.clone();
                            if let Err(error) = self.enter(inner, inst_rc, &target) {
                                return StepStatus::Failed(error);
                            }
                        }
                        Some(Transition::Pop) => {
                            if let Err(error) = self.run_exit(inner, inst_rc) {
                                return StepStatus::Failed(error);
                            }
                            let (machine, from, now_empty) = {
                                let mut inst = inst_rc.borrow_mut();
                                let from = inst.current_state();
                                inst.stack.pop();
                                (inst.id.clone(), from, inst.stack.is_empty())
                            };
                            inner.note_pop(&machine, &from);
                            if now_empty {
                                return self.halt_machine(inner, inst_rc, &from);
                            }
                            let top = inst_rc.borrow().current_state();
                            self.frame.borrow_mut().current_state = top;
                        }
                        Some(Transition::Halt) => {
                            let state = self.frame.borrow().current_state.clone();
                            return self.halt_machine(inner, inst_rc, &state);
                        }
                    }
                }
            }
        }
    }

    fn finish(
        &mut self,
        inner: &Rc<RuntimeInner>,
        inst_rc: &Rc<RefCell<MachineInstance>>,
    ) -> StepStatus {
        let raised = self.frame.borrow_mut().raised.take();
        if let Some(event) = raised {
            let frame = self.frame.borrow();
            let envelope = EventEnvelope {
                event,
                sender: Some(frame.machine.clone()),
                operation_group: frame.operation_group,
                send_seq: inner.alloc_send_seq(),
                must_handle: false,
            };
            drop(frame);
            inst_rc.borrow_mut().raised = Some(envelope);
        }
        StepStatus::Completed
    }

    fn halt_machine(
        &mut self,
        inner: &Rc<RuntimeInner>,
        inst_rc: &Rc<RefCell<MachineInstance>>,
        state: &StateName,
    ) -> StepStatus {
        let (machine, dropped) = {
            let mut inst = inst_rc.borrow_mut();
            let dropped = inst.halt();
            (inst.id.clone(), dropped)
        };
        inner.note_halt(&machine, state, dropped);
        StepStatus::Halted
    }

    /// Runs the exit handler of the current top state, if any. Exit handlers
    /// are synchronous; their raises and pops land in the frame and are
    /// processed by the ongoing apply loop.
    fn run_exit(
        &mut self,
        inner: &Rc<RuntimeInner>,
        inst_rc: &Rc<RefCell<MachineInstance>>,
    ) -> Result<()> {
        let (exit, data, state, machine) = {
            let inst = inst_rc.borrow();
            let state = inst.current_state();
            let flat = inst.mtype.state(&state)?;
            (
                flat.exit.clone(),
                Rc::clone(&inst.data),
                state,
                inst.id.clone(),
            )
        };
        let Some(exit) = exit else { return Ok(()) };
        inner.note_invoke_action(&machine, &state, "exit");
        let cx = MachineCx {
            inner: Rc::clone(inner),
            frame: Rc::clone(&self.frame),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut data = data.borrow_mut();
            exit(&mut *data, &cx)
        }));
        match outcome {
            Ok(result) => result,
            Err(payload) => Err(panic_error(payload.as_ref())),
        }
    }

    /// Starts the entry handler of a newly pushed state, leaving the runner
    /// in the poll phase if one exists.
    fn enter(
        &mut self,
        inner: &Rc<RuntimeInner>,
        inst_rc: &Rc<RefCell<MachineInstance>>,
        state: &StateName,
    ) -> Result<()> {
        let (entry, data, machine) = {
            let inst = inst_rc.borrow();
            let flat = inst.mtype.state(state)?;
            (flat.entry.clone(), Rc::clone(&inst.data), inst.id.clone())
        };
        if let Some(entry) = entry {
            inner.note_invoke_action(&machine, state, "entry");
            let cx = MachineCx {
                inner: Rc::clone(inner),
                frame: Rc::clone(&self.frame),
            };
            self.phase = Phase::Poll(entry(data, cx));
        }
        Ok(())
    }

    fn origin(&self) -> (MachineId, StateName) {
        let frame = self.frame.borrow();
        (frame.machine.clone(), frame.current_state.clone())
    }
}

fn panic_error(payload: &(dyn std::any::Any + Send)) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    Error::new(ErrorKind::UnhandledPanic).with_context(message)
}
