//! The scheduler core.
//!
//! One loop, one invariant: exactly one machine step executes at a time. The
//! loop computes the enabled set, asks the strategy which machine advances,
//! runs that machine for one step, and records the decision. It terminates on
//! quiescence, a found bug, the step bound, or external cancellation.
//!
//! The await primitives (`create_and_execute`, `send_and_execute`) reuse the
//! same step execution as nested loops constrained to a single target, with
//! an await stack that turns cyclic waits into a reported bug instead of a
//! hang.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Bug, Error, ErrorKind, Result};
use crate::event::{Event, EventEnvelope};
use crate::machine::inbox::Dequeued;
use crate::machine::instance::{dispatch, Dispatch, Dispatched, MachineInstance, StepStatus};
use crate::observability::LogEntry;
use crate::runtime::{Delivery, RunStatus, RuntimeInner};
use crate::strategy::ScheduleContext;
use crate::trace::ChoicePoint;
use crate::types::MachineId;

/// Runs the scheduler loop until the run ends.
pub(crate) fn run_loop(inner: &Rc<RuntimeInner>) -> RunStatus {
    loop {
        if inner.bug.borrow().is_some() {
            inner.commit_stage();
            return RunStatus::BugFound;
        }
        if inner.stop_requested.get() {
            inner.commit_stage();
            return RunStatus::Stopped;
        }

        let enabled = match enabled_ids(inner) {
            Ok(enabled) => enabled,
            Err(error) => {
                inner.record_bug(Bug::global(error));
                return RunStatus::BugFound;
            }
        };

        if enabled.is_empty() {
            return finish_idle(inner);
        }

        if inner.steps.get() >= inner.max_steps {
            inner.log(
                LogEntry::warn("step bound reached")
                    .with_field("steps", inner.steps.get()),
            );
            if check_liveness(inner) {
                return RunStatus::BugFound;
            }
            return RunStatus::StepBoundReached;
        }

        let ctx = ScheduleContext {
            steps: inner.steps.get(),
            iteration: inner.iteration.get(),
        };
        let choice = inner
            .strategy
            .borrow_mut()
            .next_operation(&enabled, &ctx);
        let id = match choice {
            Ok(id) if enabled.contains(&id) => id,
            Ok(id) => {
                inner.record_bug(Bug::global(Error::internal(format!(
                    "strategy chose machine {id}, which is not enabled"
                ))));
                return RunStatus::BugFound;
            }
            Err(error) => {
                inner.record_bug(Bug::global(error));
                return RunStatus::BugFound;
            }
        };

        inner.oracle.borrow_mut().begin_step();
        inner.record_choice(ChoicePoint::SchedulingStep(id));
        inner.log(LogEntry::debug("step").with_field("machine", id));
        if let Err(error) = execute_step(inner, id) {
            inner.record_bug(Bug::global(error));
            return RunStatus::BugFound;
        }
        inner.commit_stage();
    }
}

/// The enabled set, sorted by machine id.
pub(crate) fn enabled_ids(inner: &Rc<RuntimeInner>) -> Result<Vec<u64>> {
    let machines = inner.machines.borrow();
    let mut enabled = Vec::new();
    for (value, inst) in machines.iter() {
        if inst.borrow().is_enabled()? {
            enabled.push(*value);
        }
    }
    Ok(enabled)
}

/// No machine is enabled: either quiescent success or a deadlock.
pub(crate) fn finish_idle(inner: &Rc<RuntimeInner>) -> RunStatus {
    let mut blocked = Vec::new();
    for inst in inner.machines.borrow().values() {
        let inst = inst.borrow();
        if inst.halted {
            continue;
        }
        if let Some(wanted) = &inst.waiting_on {
            let types = wanted
                .iter()
                .map(crate::types::EventType::name)
                .collect::<Vec<_>>()
                .join(",");
            blocked.push(format!(
                "{} is waiting to receive {{{types}}}",
                inst.id
            ));
        } else if !inst.inbox.is_empty() {
            let types = inst
                .inbox
                .queued_types()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            blocked.push(format!(
                "{} cannot dequeue any of [{types}]",
                inst.id
            ));
        }
    }

    if blocked.is_empty() {
        if check_liveness(inner) {
            return RunStatus::BugFound;
        }
        inner.commit_stage();
        inner.log(LogEntry::info("run quiescent"));
        return RunStatus::Quiescent;
    }

    inner.record_bug(Bug::global(
        Error::new(ErrorKind::Deadlock).with_context(blocked.join("; ")),
    ));
    inner.commit_stage();
    RunStatus::BugFound
}

/// Reports a liveness bug if any monitor ends the run in a hot state.
pub(crate) fn check_liveness(inner: &Rc<RuntimeInner>) -> bool {
    if let Some((monitor, state)) = inner.hot_monitor() {
        inner.record_bug(Bug::global(
            Error::new(ErrorKind::LivenessViolation).with_context(format!(
                "monitor {monitor} ended the run in hot state {state}"
            )),
        ));
        inner.commit_stage();
        return true;
    }
    false
}

/// Executes one step of one machine. `Err` means an internal failure; bugs in
/// the program under test are recorded, not returned.
pub(crate) fn execute_step(inner: &Rc<RuntimeInner>, id: u64) -> Result<()> {
    let inst_rc = inner.machine(id)?;
    inner.await_stack.borrow_mut().push(id);
    let result = execute_step_inner(inner, id, &inst_rc);
    inner.await_stack.borrow_mut().pop();
    inner.steps.set(inner.steps.get() + 1);
    result
}

fn execute_step_inner(
    inner: &Rc<RuntimeInner>,
    id: u64,
    inst_rc: &Rc<RefCell<MachineInstance>>,
) -> Result<()> {
    // Decide what this step consumes: a resumed receive, the start-state
    // entry, the raised event, or the next dequeuable inbox event.
    let decision = {
        let mut inst = inst_rc.borrow_mut();
        if inst.halted {
            return Err(Error::internal(format!(
                "scheduled halted machine {id}"
            )));
        }
        if inst.pending.is_some() {
            let wanted = inst
                .waiting_on
                .clone()
                .ok_or_else(|| Error::internal("parked step without a receive set"))?;
            let envelope = inst.inbox.take_matching(&wanted).ok_or_else(|| {
                Error::internal(format!("machine {id} scheduled without a matching event"))
            })?;
            inst.waiting_on = None;
            inner.stats.borrow_mut().dequeued += 1;
            if inner.defer_flush.get() {
                inner.consumed.borrow_mut().push((id, envelope.clone()));
            }
            Dispatch::Resume(envelope)
        } else if !inst.started {
            inst.started = true;
            Dispatch::Start
        } else if let Some(envelope) = inst.raised.take() {
            inner.note_raise(&inst.id, &inst.current_state(), envelope.event_type());
            Dispatch::Envelope(envelope)
        } else {
            let state = inst.current_state();
            let mtype = Rc::clone(&inst.mtype);
            let flat = mtype.state(&state)?;
            match inst.inbox.dequeue(flat) {
                Dequeued::Event(envelope, ignored) => {
                    let mut stats = inner.stats.borrow_mut();
                    stats.ignored_dropped += ignored;
                    stats.dequeued += 1;
                    drop(stats);
                    inst.operation_group = envelope.operation_group;
                    inner.note_dequeue(&inst.id, &state, envelope.event_type());
                    if inner.defer_flush.get() {
                        inner.consumed.borrow_mut().push((id, envelope.clone()));
                    }
                    Dispatch::Envelope(envelope)
                }
                Dequeued::None => {
                    return Err(Error::internal(format!(
                        "machine {id} scheduled with nothing to dequeue"
                    )));
                }
            }
        }
    };

    let (machine, state) = {
        let inst = inst_rc.borrow();
        (inst.id.clone(), inst.current_state())
    };

    match dispatch(inner, inst_rc, decision)? {
        Dispatched::GracefulHalt => {
            let dropped = inst_rc.borrow_mut().halt();
            inner.note_halt(&machine, &state, dropped);
            Ok(())
        }
        Dispatched::Unhandled(error) => {
            inner.record_bug(Bug::in_machine(error, machine, Some(state)));
            Ok(())
        }
        Dispatched::Runner(mut runner) => {
            let status = runner.advance(inner, inst_rc);
            let frame = Rc::clone(&runner.frame);
            match status {
                StepStatus::Failed(error) => {
                    let state = frame.borrow().current_state.clone();
                    inner.record_bug(Bug::in_machine(error, machine, Some(state)));
                    Ok(())
                }
                StepStatus::Suspended => {
                    inst_rc.borrow_mut().pending = Some(runner);
                    let effects = std::mem::take(&mut frame.borrow_mut().effects);
                    apply_or_defer(inner, effects, &machine)
                }
                StepStatus::Completed | StepStatus::Halted => {
                    let effects = std::mem::take(&mut frame.borrow_mut().effects);
                    apply_or_defer(inner, effects, &machine)
                }
            }
        }
    }
}

/// Applies effects now, or parks them for the reliable overlay's commit.
fn apply_or_defer(
    inner: &Rc<RuntimeInner>,
    effects: Vec<crate::machine::cx::Effect>,
    origin: &MachineId,
) -> Result<()> {
    if inner.defer_flush.get() {
        inner.deferred.borrow_mut().push((origin.clone(), effects));
        Ok(())
    } else {
        inner.flush_effects(effects, origin)
    }
}

// ============================================================================
// Await primitives
// ============================================================================

impl RuntimeInner {
    /// The machine currently executing, if this call happens inside a step.
    fn current_machine(&self) -> Option<u64> {
        self.await_stack.borrow().last().copied()
    }
}

/// Creates a machine and drives it until idle or blocked.
pub(crate) fn create_and_execute(
    inner: &Rc<RuntimeInner>,
    type_name: &str,
    friendly_name: Option<&str>,
    event: Option<Event>,
) -> Result<MachineId> {
    let id = inner.alloc_machine_id(type_name, friendly_name)?;
    let creator = inner
        .current_machine()
        .and_then(|value| inner.machine(value).ok())
        .map(|inst| inst.borrow().id.clone());
    inner.instantiate(&id, type_name, event, creator.as_ref())?;
    drive_machine(inner, &id)?;
    Ok(id)
}

/// Sends an event and drives the target until idle or blocked. Returns true
/// if the event was handled before the target went quiescent.
pub(crate) fn send_and_execute(
    inner: &Rc<RuntimeInner>,
    target: &MachineId,
    event: Event,
) -> Result<bool> {
    let (sender, operation_group) = match inner.current_machine() {
        Some(value) => {
            let inst = inner.machine(value)?;
            let inst = inst.borrow();
            (Some(inst.id.clone()), inst.operation_group)
        }
        None => (None, inner.fresh_group()),
    };
    let send_seq = inner.alloc_send_seq();
    let envelope = EventEnvelope {
        event,
        sender,
        operation_group,
        send_seq,
        must_handle: false,
    };
    let delivery = inner.route_event(envelope, target, None, None)?;
    if delivery == Delivery::DroppedHalted {
        return Ok(false);
    }
    drive_machine(inner, target)?;
    let still_queued = inner
        .machine(target.value())?
        .borrow()
        .inbox
        .contains_seq(send_seq);
    Ok(!still_queued)
}

/// Runs the target's step loop until it is halted or blocked. The caller's
/// step stays ongoing; no other machine runs in between.
fn drive_machine(inner: &Rc<RuntimeInner>, target: &MachineId) -> Result<()> {
    if inner.await_stack.borrow().contains(&target.value()) {
        let error = Error::new(ErrorKind::AwaitCycle).with_context(format!(
            "synchronous execution of {target} re-enters a machine already executing"
        ));
        inner.record_bug(Bug::global(error.clone()));
        return Err(error);
    }
    loop {
        if inner.bug.borrow().is_some() || inner.stop_requested.get() {
            return Ok(());
        }
        if inner.steps.get() >= inner.max_steps {
            return Ok(());
        }
        let enabled = {
            let inst = inner.machine(target.value())?;
            let enabled = inst.borrow().is_enabled()?;
            enabled
        };
        if !enabled {
            return Ok(());
        }
        // The strategy sees the forced step so that replay stays in
        // lock-step with recording.
        let ctx = ScheduleContext {
            steps: inner.steps.get(),
            iteration: inner.iteration.get(),
        };
        let chosen = inner
            .strategy
            .borrow_mut()
            .next_operation(&[target.value()], &ctx)?;
        if chosen != target.value() {
            return Err(Error::internal(
                "strategy departed from a forced single-machine step",
            ));
        }
        inner.record_choice(ChoicePoint::SchedulingStep(target.value()));
        execute_step(inner, target.value())?;
    }
}
