//! The reliable-state-machine overlay.
//!
//! [`ReliableRuntime`] wraps the bug-finding runtime so that each machine
//! step runs as a transaction over a [`StateStore`]: the step's stack delta,
//! its inbox dequeue, and its peer enqueues commit together or not at all.
//! Buffered sends stay invisible to peers until the commit succeeds. On a
//! transient storage failure the overlay discards everything the step
//! produced — buffered effects, staged trace entries — restores the machine
//! from the persisted state stack, re-stages the step's nondeterministic
//! choices, and re-runs it, up to a retry budget.
//!
//! Two restrictions keep the transaction boundary honest: reliable machines
//! must not suspend in `receive` mid-step, and must not drive peers with the
//! synchronous-execution primitives (a peer's state is outside the
//! transaction). Both are reported as internal errors if violated.

pub mod store;

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::TestConfig;
use crate::error::{Bug, Error, ErrorKind, Result};
use crate::event::{Event, EventEnvelope, SendOptions};
use crate::machine::cx::Effect;
use crate::observability::LogEntry;
use crate::runtime::{scheduler, RunStatus, Runtime, SharedStrategy};
use crate::strategy::ScheduleContext;
use crate::trace::ChoicePoint;
use crate::types::{MachineId, StateName};

pub use store::{InMemoryStore, StateStore, StoreError, StoreTx};

/// Shared handle to a state store, so tests can inject failures and inspect
/// persisted state while the overlay holds it.
pub type SharedStore = Rc<RefCell<dyn StateStore>>;

/// A runtime whose machine steps are transactions over a state store.
pub struct ReliableRuntime {
    runtime: Runtime,
    store: SharedStore,
    retry_budget: u32,
}

impl ReliableRuntime {
    /// Creates a reliable runtime over the given store.
    #[must_use]
    pub fn new(config: &TestConfig, strategy: SharedStrategy, store: SharedStore) -> Self {
        Self {
            runtime: Runtime::new(config, strategy),
            store,
            retry_budget: config.storage_retry_budget,
        }
    }

    /// The wrapped runtime, for registration and inspection.
    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Creates a machine and seeds its persisted stack.
    ///
    /// # Errors
    ///
    /// Configuration error if the type is unknown.
    pub fn create_machine(&self, type_name: &str, event: Option<Event>) -> Result<MachineId> {
        let id = self.runtime.create_machine(type_name, event)?;
        let stack = self.runtime.inner.machine(id.value())?.borrow().stack.clone();
        self.store.borrow_mut().seed_machine(id.value(), stack);
        Ok(id)
    }

    /// Sends an event, mirroring it into the persistent inbox.
    ///
    /// # Errors
    ///
    /// See [`Runtime::send_event`].
    pub fn send_event(
        &self,
        target: &MachineId,
        event: Event,
        options: SendOptions,
    ) -> Result<()> {
        self.runtime.send_event(target, event, options)?;
        let envelope = self
            .runtime
            .inner
            .machine(target.value())?
            .borrow()
            .inbox
            .last()
            .cloned();
        if let Some(envelope) = envelope {
            let mut store = self.store.borrow_mut();
            let mut tx = store.begin();
            tx.enqueue(target.value(), envelope);
            store
                .commit(tx)
                .map_err(|e| Error::new(ErrorKind::TransientStorage).with_context(e.to_string()))?;
        }
        Ok(())
    }

    /// Runs the scheduler loop with transactional steps.
    pub fn run(&self) -> RunStatus {
        let inner = &self.runtime.inner;
        loop {
            if inner.bug_found() {
                inner.commit_stage();
                return RunStatus::BugFound;
            }
            if inner.stop_requested.get() {
                inner.commit_stage();
                return RunStatus::Stopped;
            }

            let enabled = match scheduler::enabled_ids(inner) {
                Ok(enabled) => enabled,
                Err(error) => {
                    inner.record_bug(Bug::global(error));
                    return RunStatus::BugFound;
                }
            };
            if enabled.is_empty() {
                return scheduler::finish_idle(inner);
            }
            if inner.steps.get() >= inner.max_steps {
                if scheduler::check_liveness(inner) {
                    return RunStatus::BugFound;
                }
                return RunStatus::StepBoundReached;
            }

            let ctx = ScheduleContext {
                steps: inner.steps.get(),
                iteration: inner.iteration.get(),
            };
            let choice = inner.strategy.borrow_mut().next_operation(&enabled, &ctx);
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

            if let Err(error) = self.reliable_step(id) {
                inner.record_bug(Bug::global(error));
                return RunStatus::BugFound;
            }
        }
    }

    /// Executes one machine step inside a store transaction, retrying on
    /// transient failure.
    fn reliable_step(&self, id: u64) -> Result<()> {
        let inner = &self.runtime.inner;
        let inst_rc = inner.machine(id)?;
        let snapshot = inst_rc.borrow().snapshot();
        let mut attempt: u32 = 0;

        loop {
            inner.oracle.borrow_mut().begin_step();
            inner.record_choice(ChoicePoint::SchedulingStep(id));
            inner.defer_flush.set(true);
            inner.consumed.borrow_mut().clear();
            let step_result = scheduler::execute_step(inner, id);
            inner.defer_flush.set(false);
            step_result?;

            if inner.bug_found() {
                // The run ends here; the step's durable footprint is moot,
                // but the trace is not.
                inner.deferred.borrow_mut().clear();
                inner.commit_stage();
                return Ok(());
            }
            if inst_rc.borrow().pending.is_some() {
                return Err(Error::internal(
                    "reliable machines cannot suspend in receive",
                ));
            }

            // Stage the step's durable footprint.
            let mut tx = self.store.borrow_mut().begin();
            let stack_after = inst_rc.borrow().stack.clone();
            let (pop_depth, pushed) = stack_delta(&snapshot.stack, &stack_after);
            if pop_depth > 0 || !pushed.is_empty() {
                tx.write_stack(id, pop_depth, pushed);
            }
            let consumed: Vec<(u64, EventEnvelope)> =
                inner.consumed.borrow_mut().drain(..).collect();
            for (machine, _envelope) in &consumed {
                tx.dequeue(*machine);
            }
            for (origin, effects) in inner.deferred.borrow().iter() {
                for effect in effects {
                    if let Effect::Send {
                        target,
                        event,
                        operation_group,
                        send_seq,
                        must_handle,
                        ..
                    } = effect
                    {
                        tx.enqueue(
                            target.value(),
                            EventEnvelope {
                                event: event.clone(),
                                sender: Some(origin.clone()),
                                operation_group: *operation_group,
                                send_seq: *send_seq,
                                must_handle: *must_handle,
                            },
                        );
                    }
                }
            }

            let commit = self.store.borrow_mut().commit(tx);
            match commit {
                Ok(()) => {
                    // Apply buffered out-of-transaction work: runtime-side
                    // enqueues and machine creations.
                    let deferred: Vec<(MachineId, Vec<Effect>)> =
                        inner.deferred.borrow_mut().drain(..).collect();
                    for (origin, effects) in deferred {
                        let created: Vec<MachineId> = effects
                            .iter()
                            .filter_map(|effect| match effect {
                                Effect::Create { id, .. } => Some(id.clone()),
                                Effect::Send { .. } => None,
                            })
                            .collect();
                        inner.flush_effects(effects, &origin)?;
                        let mut store = self.store.borrow_mut();
                        for created_id in created {
                            if let Ok(inst) = inner.machine(created_id.value()) {
                                store
                                    .seed_machine(created_id.value(), inst.borrow().stack.clone());
                            }
                        }
                    }
                    inner.commit_stage();
                    return Ok(());
                }
                Err(StoreError::Transient(reason)) => {
                    attempt += 1;
                    inner.log(
                        LogEntry::warn("transient storage failure, retrying step")
                            .with_field("machine", id)
                            .with_field("attempt", attempt)
                            .with_field("reason", &reason),
                    );
                    // Discard everything the failed attempt produced.
                    inner.deferred.borrow_mut().clear();
                    inner.discard_stage();
                    inner.oracle.borrow_mut().stage_retry();
                    {
                        let mut inst = inst_rc.borrow_mut();
                        inst.restore(snapshot.clone());
                        let persisted = self.store.borrow().read_stack(id);
                        if !persisted.is_empty() {
                            inst.stack = persisted;
                        }
                        for (machine, envelope) in consumed.into_iter().rev() {
                            if machine == id {
                                inst.inbox.push_front(envelope);
                            }
                        }
                    }
                    if attempt > self.retry_budget {
                        return Err(Error::new(ErrorKind::StorageRetriesExhausted)
                            .with_context(format!(
                                "step retry budget ({}) exhausted: {reason}",
                                self.retry_budget
                            )));
                    }
                }
                Err(StoreError::Fatal(reason)) => {
                    return Err(Error::new(ErrorKind::StorageRetriesExhausted)
                        .with_context(format!("fatal storage failure: {reason}")));
                }
            }
        }
    }
}

/// Computes the (pop depth, pushed suffix) delta between two state stacks.
fn stack_delta(before: &[StateName], after: &[StateName]) -> (usize, Vec<StateName>) {
    let common = before
        .iter()
        .zip(after.iter())
        .take_while(|(a, b)| a == b)
        .count();
    (before.len() - common, after[common..].to_vec())
}
