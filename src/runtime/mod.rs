//! The bug-finding runtime.
//!
//! [`Runtime`] owns a population of machine instances and drives them one
//! step at a time under the control of an exploration strategy. All side
//! effects of a step (sends, creates) are buffered and applied when the step
//! ends or suspends, so peers observe a step's output atomically and the
//! schedule trace fully determines the run.
//!
//! The runtime is an explicit value: handlers reach it only through their
//! [`MachineCx`](crate::machine::MachineCx), and tests through the public
//! API. There are no hidden globals.

pub(crate) mod scheduler;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::TestConfig;
use crate::error::{Bug, Error, ErrorKind, Result};
use crate::event::{Event, EventEnvelope, SendOptions};
use crate::machine::cx::Effect;
use crate::machine::instance::MachineInstance;
use crate::machine::metadata::MachineType;
use crate::monitor::{MonitorInstance, MonitorType};
use crate::net::{LocalNetworkProvider, NetworkProvider, RemoteOp};
use crate::observability::{LogCollector, LogEntry, LogLevel};
use crate::oracle::ChoiceOracle;
use crate::strategy::{RandomStrategy, Strategy};
use crate::trace::{BugStep, BugStepKind, BugTrace, ChoicePoint, ScheduleTrace};
use crate::types::{EventType, MachineId, OperationGroupId, StateName};
use crate::util::DetRng;

/// Shared handle to a strategy, so the engine can advance it between
/// iterations while the runtime consults it during one.
pub type SharedStrategy = Rc<RefCell<Box<dyn Strategy>>>;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every machine is halted or idle with an empty inbox; no bug found.
    Quiescent,
    /// A bug was found; see [`Runtime::bug`].
    BugFound,
    /// The per-iteration step bound was reached without finding a bug.
    StepBoundReached,
    /// The run was cancelled via [`Runtime::stop`].
    Stopped,
}

/// Event accounting across a run, for conservation checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Events enqueued into inboxes.
    pub enqueued: u64,
    /// Events dequeued (including receives).
    pub dequeued: u64,
    /// Events dropped because the target had halted.
    pub dropped_halted: u64,
    /// Ignored events discarded during dequeue scans.
    pub ignored_dropped: u64,
}

/// Where a delivered event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Enqueued,
    DroppedHalted,
}

/// Per-step staging buffers: trace entries move into the real traces only
/// when the step commits, so a retried step leaves no residue.
#[derive(Default)]
pub(crate) struct StepStage {
    pub(crate) schedule: Vec<ChoicePoint>,
    pub(crate) bug: Vec<BugStep>,
}

pub(crate) struct RuntimeInner {
    partition: String,
    pub(crate) machines: RefCell<BTreeMap<u64, Rc<RefCell<MachineInstance>>>>,
    machine_types: RefCell<BTreeMap<String, Rc<MachineType>>>,
    monitors: RefCell<BTreeMap<String, MonitorInstance>>,
    pub(crate) strategy: SharedStrategy,
    pub(crate) oracle: RefCell<ChoiceOracle>,
    schedule: RefCell<ScheduleTrace>,
    bug_trace: RefCell<BugTrace>,
    stage: RefCell<StepStage>,
    bug: RefCell<Option<Bug>>,
    next_machine_value: Cell<u64>,
    next_send_seq: Cell<u64>,
    group_rng: RefCell<DetRng>,
    pub(crate) steps: Cell<u64>,
    pub(crate) max_steps: u64,
    pub(crate) iteration: Cell<u64>,
    pub(crate) stop_requested: Cell<bool>,
    pub(crate) await_stack: RefCell<Vec<u64>>,
    log: RefCell<LogCollector>,
    on_failure: RefCell<Option<Box<dyn Fn(&Bug)>>>,
    pub(crate) stats: RefCell<RuntimeStats>,
    network: RefCell<Box<dyn NetworkProvider>>,
    /// When set, step effects are parked in `deferred` instead of applied;
    /// the reliable overlay flushes them after its transaction commits.
    pub(crate) defer_flush: Cell<bool>,
    pub(crate) deferred: RefCell<Vec<(MachineId, Vec<Effect>)>>,
    /// Envelopes consumed from inboxes while `defer_flush` is set, kept so a
    /// rolled-back step can put them back.
    pub(crate) consumed: RefCell<Vec<(u64, EventEnvelope)>>,
}

/// The deterministic bug-finding runtime.
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime driven by the given strategy.
    #[must_use]
    pub fn new(config: &TestConfig, strategy: SharedStrategy) -> Self {
        let (name, seed) = {
            let s = strategy.borrow();
            (s.name(), s.seed())
        };
        let inner = RuntimeInner {
            partition: "local".to_string(),
            machines: RefCell::new(BTreeMap::new()),
            machine_types: RefCell::new(BTreeMap::new()),
            monitors: RefCell::new(BTreeMap::new()),
            strategy,
            oracle: RefCell::new(ChoiceOracle::default()),
            schedule: RefCell::new(ScheduleTrace::new(name, seed, config.iterations)),
            bug_trace: RefCell::new(BugTrace::new()),
            stage: RefCell::new(StepStage::default()),
            bug: RefCell::new(None),
            next_machine_value: Cell::new(1),
            next_send_seq: Cell::new(1),
            group_rng: RefCell::new(DetRng::new(seed ^ 0x9e37_79b9_7f4a_7c15)),
            steps: Cell::new(0),
            max_steps: config.max_steps,
            iteration: Cell::new(0),
            stop_requested: Cell::new(false),
            await_stack: RefCell::new(Vec::new()),
            log: RefCell::new(LogCollector::new(LogLevel::from_verbosity(
                config.verbosity,
            ))),
            on_failure: RefCell::new(None),
            stats: RefCell::new(RuntimeStats::default()),
            network: RefCell::new(Box::new(LocalNetworkProvider::new("local"))),
            defer_flush: Cell::new(false),
            deferred: RefCell::new(Vec::new()),
            consumed: RefCell::new(Vec::new()),
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    /// Creates a runtime with a random strategy, for tests and examples.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        let strategy: SharedStrategy =
            Rc::new(RefCell::new(Box::new(RandomStrategy::new(seed))));
        Self::new(&TestConfig::new(seed), strategy)
    }

    /// Installs a network provider for cross-partition traffic.
    pub fn set_network_provider(&self, provider: Box<dyn NetworkProvider>) {
        *self.inner.network.borrow_mut() = provider;
    }

    /// Registers a machine type.
    ///
    /// # Errors
    ///
    /// Configuration error if the name is already registered.
    pub fn register(&self, machine_type: MachineType) -> Result<()> {
        let name = machine_type.name().to_string();
        let mut types = self.inner.machine_types.borrow_mut();
        if types.contains_key(&name) {
            return Err(Error::configuration(format!(
                "machine type {name} registered twice"
            )));
        }
        types.insert(name, Rc::new(machine_type));
        Ok(())
    }

    /// Registers and instantiates a specification monitor.
    ///
    /// # Errors
    ///
    /// Configuration error on a duplicate name; any failure from the
    /// monitor's start-state entry handler.
    pub fn register_monitor(&self, monitor_type: MonitorType) -> Result<()> {
        let name = monitor_type.name().to_string();
        if self.inner.monitors.borrow().contains_key(&name) {
            return Err(Error::configuration(format!(
                "monitor type {name} registered twice"
            )));
        }
        let instance = MonitorInstance::new(Rc::new(monitor_type))?;
        self.inner.record_bug_step(
            BugStep::new(BugStepKind::CreateMonitor).with_target(&name),
        );
        self.inner.monitors.borrow_mut().insert(name, instance);
        self.inner.commit_stage();
        Ok(())
    }

    /// Creates a machine of a registered type.
    ///
    /// # Errors
    ///
    /// Configuration error if the type is unknown.
    pub fn create_machine(&self, type_name: &str, event: Option<Event>) -> Result<MachineId> {
        let id = self.inner.alloc_machine_id(type_name, None)?;
        self.inner.instantiate(&id, type_name, event, None)?;
        self.inner.commit_stage();
        Ok(id)
    }

    /// Creates a machine with a friendly name.
    ///
    /// # Errors
    ///
    /// Configuration error if the type is unknown.
    pub fn create_machine_named(
        &self,
        type_name: &str,
        friendly_name: &str,
        event: Option<Event>,
    ) -> Result<MachineId> {
        let id = self.inner.alloc_machine_id(type_name, Some(friendly_name))?;
        self.inner.instantiate(&id, type_name, event, None)?;
        self.inner.commit_stage();
        Ok(id)
    }

    /// Allocates a machine id without creating the machine; pair with
    /// [`Runtime::create_machine_with_id`].
    ///
    /// # Errors
    ///
    /// Configuration error if the type is unknown.
    pub fn create_machine_id(
        &self,
        type_name: &str,
        friendly_name: Option<&str>,
    ) -> Result<MachineId> {
        self.inner.alloc_machine_id(type_name, friendly_name)
    }

    /// Creates a machine bound to a previously allocated id.
    ///
    /// # Errors
    ///
    /// Configuration error if the type is unknown or the id is already in
    /// use.
    pub fn create_machine_with_id(
        &self,
        id: &MachineId,
        type_name: &str,
        event: Option<Event>,
    ) -> Result<()> {
        if self.inner.machines.borrow().contains_key(&id.value()) {
            return Err(Error::configuration(format!(
                "machine id {id} is already bound"
            )));
        }
        self.inner.instantiate(id, type_name, event, None)?;
        self.inner.commit_stage();
        Ok(())
    }

    /// Sends an event to a machine from the test harness.
    ///
    /// # Errors
    ///
    /// A bug-kind error when delivery violates a send option; internal error
    /// if the target id was never created.
    pub fn send_event(
        &self,
        target: &MachineId,
        event: Event,
        options: SendOptions,
    ) -> Result<()> {
        let operation_group = options
            .operation_group_id
            .unwrap_or_else(|| self.inner.fresh_group());
        let envelope = EventEnvelope {
            event,
            sender: None,
            operation_group,
            send_seq: self.inner.alloc_send_seq(),
            must_handle: options.must_handle,
        };
        let result =
            self.inner
                .route_event(envelope, target, None, options.assert_at_most_n);
        let outcome = self.inner.absorb_bug(result, None, None).map(|_| ());
        self.inner.commit_stage();
        outcome
    }

    /// Creates a machine and synchronously drives it until it is idle or
    /// blocked.
    ///
    /// # Errors
    ///
    /// Configuration error for an unknown type; await-cycle bug.
    pub fn create_and_execute(
        &self,
        type_name: &str,
        event: Option<Event>,
    ) -> Result<MachineId> {
        let result = scheduler::create_and_execute(&self.inner, type_name, None, event);
        self.inner.commit_stage();
        result
    }

    /// Sends an event and synchronously drives the target until it is idle
    /// or blocked. Returns true if the event was handled before the target
    /// went quiescent.
    ///
    /// # Errors
    ///
    /// Internal error for an unknown target; await-cycle bug.
    pub fn send_and_execute(&self, target: &MachineId, event: Event) -> Result<bool> {
        let result = scheduler::send_and_execute(&self.inner, target, event);
        self.inner.commit_stage();
        result
    }

    /// Invokes a registered monitor with an event.
    ///
    /// # Errors
    ///
    /// Configuration error for an unknown monitor; monitor assertion
    /// failures.
    pub fn invoke_monitor(&self, monitor_type: &str, event: Event) -> Result<()> {
        let result = self.inner.invoke_monitor(monitor_type, event);
        let outcome = self.inner.absorb_bug(result, None, None).map(|_| ());
        self.inner.commit_stage();
        outcome
    }

    /// Draws a controlled nondeterministic boolean from the harness.
    ///
    /// # Errors
    ///
    /// Replay divergence or schedule exhaustion.
    pub fn random_bool(&self, max: u32) -> Result<bool> {
        let value = self.inner.next_random_bool(max, None)?;
        self.inner.commit_stage();
        Ok(value)
    }

    /// Draws a controlled nondeterministic integer from the harness.
    ///
    /// # Errors
    ///
    /// Replay divergence or schedule exhaustion.
    pub fn random_int(&self, max: u32) -> Result<u32> {
        let value = self.inner.next_random_int(max, None)?;
        self.inner.commit_stage();
        Ok(value)
    }

    /// Returns the operation group a machine currently runs under.
    ///
    /// # Errors
    ///
    /// Internal error if the machine does not exist.
    pub fn operation_group_id(&self, machine: &MachineId) -> Result<OperationGroupId> {
        let inst = self.inner.machine(machine.value())?;
        let group = inst.borrow().operation_group;
        Ok(group)
    }

    /// Requests cancellation: the scheduler stops granting steps after the
    /// in-progress one and the run returns [`RunStatus::Stopped`].
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    /// Installs the failure callback, invoked once when a bug is recorded.
    pub fn set_on_failure(&self, callback: impl Fn(&Bug) + 'static) {
        *self.inner.on_failure.borrow_mut() = Some(Box::new(callback));
    }

    /// Runs the scheduler loop to completion.
    pub fn run(&self) -> RunStatus {
        scheduler::run_loop(&self.inner)
    }

    /// The bug found by this run, if any.
    #[must_use]
    pub fn bug(&self) -> Option<Bug> {
        self.inner.bug.borrow().clone()
    }

    /// A copy of the schedule trace recorded so far.
    #[must_use]
    pub fn schedule_trace(&self) -> ScheduleTrace {
        self.inner.schedule.borrow().clone()
    }

    /// A copy of the bug trace recorded so far.
    #[must_use]
    pub fn bug_trace(&self) -> BugTrace {
        self.inner.bug_trace.borrow().clone()
    }

    /// Event accounting for this run.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        *self.inner.stats.borrow()
    }

    /// Steps executed so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.inner.steps.get()
    }

    /// Drains the structured log.
    #[must_use]
    pub fn drain_log(&self) -> Vec<LogEntry> {
        self.inner.log.borrow_mut().drain()
    }

    /// Inbox length of a machine, for tests asserting delivery state.
    ///
    /// # Errors
    ///
    /// Internal error if the machine does not exist.
    pub fn inbox_len(&self, machine: &MachineId) -> Result<usize> {
        let inst = self.inner.machine(machine.value())?;
        let len = inst.borrow().inbox.len();
        Ok(len)
    }

    /// Ids of every machine this runtime has created, in creation order.
    #[must_use]
    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.inner
            .machines
            .borrow()
            .values()
            .map(|inst| inst.borrow().id.clone())
            .collect()
    }

    /// Whether a machine has halted.
    ///
    /// # Errors
    ///
    /// Internal error if the machine does not exist.
    pub fn is_halted(&self, machine: &MachineId) -> Result<bool> {
        let inst = self.inner.machine(machine.value())?;
        let halted = inst.borrow().halted;
        Ok(halted)
    }
}

// ============================================================================
// Internal operations
// ============================================================================

impl RuntimeInner {
    pub(crate) fn machine(&self, value: u64) -> Result<Rc<RefCell<MachineInstance>>> {
        self.machines
            .borrow()
            .get(&value)
            .cloned()
            .ok_or_else(|| Error::internal(format!("no machine with id {value}")))
    }

    pub(crate) fn alloc_send_seq(&self) -> u64 {
        let seq = self.next_send_seq.get();
        self.next_send_seq.set(seq + 1);
        seq
    }

    pub(crate) fn fresh_group(&self) -> OperationGroupId {
        let mut rng = self.group_rng.borrow_mut();
        let high = u128::from(rng.next_u64());
        let low = u128::from(rng.next_u64());
        OperationGroupId::from_raw((high << 64) | low)
    }

    /// Allocates a machine id for a registered type.
    pub(crate) fn alloc_machine_id(
        &self,
        type_name: &str,
        friendly_name: Option<&str>,
    ) -> Result<MachineId> {
        if !self.machine_types.borrow().contains_key(type_name) {
            return Err(Error::configuration(format!(
                "machine type {type_name} is not registered"
            )));
        }
        let value = self.next_machine_value.get();
        self.next_machine_value.set(value + 1);
        Ok(MachineId::new(
            value,
            type_name,
            friendly_name,
            &self.partition,
        ))
    }

    /// Instantiates a machine bound to an allocated id and inserts it into
    /// the run-queue.
    pub(crate) fn instantiate(
        &self,
        id: &MachineId,
        type_name: &str,
        event: Option<Event>,
        creator: Option<&MachineId>,
    ) -> Result<()> {
        let mtype = self
            .machine_types
            .borrow()
            .get(type_name)
            .cloned()
            .ok_or_else(|| {
                Error::configuration(format!("machine type {type_name} is not registered"))
            })?;
        let group = creator
            .map(|c| {
                self.machine(c.value())
                    .map(|inst| inst.borrow().operation_group)
            })
            .transpose()?
            .unwrap_or_else(|| self.fresh_group());

        let init_event = event.map(|event| EventEnvelope {
            event,
            sender: creator.cloned(),
            operation_group: group,
            send_seq: self.alloc_send_seq(),
            must_handle: false,
        });
        let mut step = BugStep::new(BugStepKind::CreateMachine).with_target(id);
        if let Some(creator) = creator {
            step = step.with_machine(creator);
        }
        if let Some(envelope) = &init_event {
            step = step.with_event_type(envelope.event_type());
        }
        self.record_bug_step(step);
        self.log(LogEntry::info("machine created").with_field("machine", id));

        let instance = MachineInstance::new(id.clone(), mtype, init_event, group);
        self.machines
            .borrow_mut()
            .insert(id.value(), Rc::new(RefCell::new(instance)));
        Ok(())
    }

    /// Routes an event to its target, delegating cross-partition traffic to
    /// the network provider.
    pub(crate) fn route_event(
        &self,
        envelope: EventEnvelope,
        target: &MachineId,
        sender_state: Option<&StateName>,
        assert_at_most_n: Option<u32>,
    ) -> Result<Delivery> {
        if target.partition() == self.partition {
            return self.deliver_event(envelope, target, sender_state, assert_at_most_n);
        }
        self.network
            .borrow_mut()
            .send_remote(target, envelope.event.clone())?;
        self.apply_forwarded()?;
        Ok(Delivery::Enqueued)
    }

    /// Applies operations the provider asked us to perform locally.
    pub(crate) fn apply_forwarded(&self) -> Result<()> {
        let ops = self.network.borrow_mut().drain_forwarded();
        for op in ops {
            match op {
                RemoteOp::Create {
                    id,
                    type_name,
                    event,
                } => {
                    self.instantiate(&id, &type_name, event, None)?;
                }
                RemoteOp::Send { target, event } => {
                    let envelope = EventEnvelope {
                        event,
                        sender: None,
                        operation_group: self.fresh_group(),
                        send_seq: self.alloc_send_seq(),
                        must_handle: false,
                    };
                    self.deliver_event(envelope, &target, None, None)?;
                }
            }
        }
        Ok(())
    }

    /// Enqueues an envelope into a local machine's inbox, enforcing send
    /// options.
    pub(crate) fn deliver_event(
        &self,
        envelope: EventEnvelope,
        target: &MachineId,
        sender_state: Option<&StateName>,
        assert_at_most_n: Option<u32>,
    ) -> Result<Delivery> {
        let inst_rc = self.machine(target.value())?;
        let ty = envelope.event_type().clone();

        let mut step = BugStep::new(BugStepKind::SendEvent)
            .with_target(target)
            .with_event_type(&ty);
        if let Some(sender) = &envelope.sender {
            step = step.with_machine(sender);
        }
        if let Some(state) = sender_state {
            step = step.with_state(state);
        }
        self.record_bug_step(step);

        // Counts the send attempt; a drop on a halted target shows up in
        // `dropped_halted` against this.
        self.stats.borrow_mut().enqueued += 1;

        let mut inst = inst_rc.borrow_mut();
        if inst.halted {
            if envelope.must_handle {
                return Err(Error::new(ErrorKind::DroppedMustHandleEvent).with_context(
                    format!("must-handle event {ty} dropped on halted machine {target}"),
                ));
            }
            self.stats.borrow_mut().dropped_halted += 1;
            self.log(
                LogEntry::warn("event dropped on halted machine")
                    .with_field("machine", target)
                    .with_field("event", &ty),
            );
            return Ok(Delivery::DroppedHalted);
        }
        if let Some(bound) = assert_at_most_n {
            let in_flight = inst.inbox.count_of_type(&ty) as u32 + 1;
            if in_flight > bound {
                return Err(Error::new(ErrorKind::EventOverflow).with_context(format!(
                    "{in_flight} in-flight {ty} events at {target}, bound is {bound}"
                )));
            }
        }
        inst.inbox.enqueue(envelope);
        Ok(Delivery::Enqueued)
    }

    /// Applies a completed step's buffered effects in program order.
    pub(crate) fn flush_effects(&self, effects: Vec<Effect>, origin: &MachineId) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::Send {
                    sender_state,
                    target,
                    event,
                    operation_group,
                    send_seq,
                    must_handle,
                    assert_at_most_n,
                } => {
                    let envelope = EventEnvelope {
                        event,
                        sender: Some(origin.clone()),
                        operation_group,
                        send_seq,
                        must_handle,
                    };
                    let result = self.route_event(
                        envelope,
                        &target,
                        Some(&sender_state),
                        assert_at_most_n,
                    );
                    let _ = self.absorb_bug(result, Some(origin.clone()), Some(sender_state))?;
                }
                Effect::Create {
                    id,
                    type_name,
                    event,
                } => {
                    let result = self.instantiate(&id, &type_name, event, Some(origin));
                    let _ = self.absorb_bug(result, Some(origin.clone()), None)?;
                }
            }
            if self.bug.borrow().is_some() {
                break;
            }
        }
        Ok(())
    }

    /// Converts a bug-kind error into a recorded bug (yielding `Ok(None)`);
    /// passes other results through.
    pub(crate) fn absorb_bug<T>(
        &self,
        result: Result<T>,
        machine: Option<MachineId>,
        state: Option<StateName>,
    ) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.is_bug() => {
                let bug = match machine {
                    Some(machine) => Bug::in_machine(error, machine, state),
                    None => Bug::global(error),
                };
                self.record_bug(bug);
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Returns true if a bug has been recorded.
    pub(crate) fn bug_found(&self) -> bool {
        self.bug.borrow().is_some()
    }

    /// Records the first bug of the run and fires the failure callback.
    pub(crate) fn record_bug(&self, bug: Bug) {
        let mut slot = self.bug.borrow_mut();
        if slot.is_some() {
            return;
        }
        self.log(LogEntry::error("bug found").with_field("bug", &bug));
        if let Some(callback) = self.on_failure.borrow().as_ref() {
            callback(&bug);
        }
        *slot = Some(bug);
    }

    pub(crate) fn invoke_monitor(&self, monitor_type: &str, event: Event) -> Result<()> {
        let mut monitors = self.monitors.borrow_mut();
        let monitor = monitors.get_mut(monitor_type).ok_or_else(|| {
            Error::configuration(format!("monitor type {monitor_type} is not registered"))
        })?;
        monitor.invoke(event)
    }

    /// Returns true if any registered liveness monitor sits in a hot state.
    pub(crate) fn hot_monitor(&self) -> Option<(String, StateName)> {
        self.monitors
            .borrow()
            .values()
            .find(|m| m.in_hot_state())
            .map(|m| (m.name().to_string(), m.current_state()))
    }

    // ------------------------------------------------------------------
    // Nondeterministic choices
    // ------------------------------------------------------------------

    pub(crate) fn next_random_bool(
        &self,
        max: u32,
        origin: Option<(MachineId, StateName)>,
    ) -> Result<bool> {
        let value = {
            let mut strategy = self.strategy.borrow_mut();
            self.oracle
                .borrow_mut()
                .next_bool(strategy.as_mut(), max)?
        };
        self.record_choice(ChoicePoint::BoolChoice(value));
        self.note_random(origin, &value.to_string());
        Ok(value)
    }

    pub(crate) fn next_random_int(
        &self,
        max: u32,
        origin: Option<(MachineId, StateName)>,
    ) -> Result<u32> {
        let value = {
            let mut strategy = self.strategy.borrow_mut();
            self.oracle.borrow_mut().next_int(strategy.as_mut(), max)?
        };
        self.record_choice(ChoicePoint::IntChoice(value));
        self.note_random(origin, &value.to_string());
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Staged trace recording
    // ------------------------------------------------------------------

    pub(crate) fn record_choice(&self, point: ChoicePoint) {
        self.stage.borrow_mut().schedule.push(point);
    }

    pub(crate) fn record_bug_step(&self, step: BugStep) {
        self.stage.borrow_mut().bug.push(step);
    }

    /// Moves staged entries into the durable traces.
    pub(crate) fn commit_stage(&self) {
        let mut stage = self.stage.borrow_mut();
        let mut schedule = self.schedule.borrow_mut();
        for point in stage.schedule.drain(..) {
            schedule.push(point);
        }
        let mut bug_trace = self.bug_trace.borrow_mut();
        for step in stage.bug.drain(..) {
            bug_trace.push(step);
        }
    }

    /// Discards staged entries (reliable-overlay rollback).
    pub(crate) fn discard_stage(&self) {
        let mut stage = self.stage.borrow_mut();
        stage.schedule.clear();
        stage.bug.clear();
    }

    pub(crate) fn log(&self, entry: LogEntry) {
        self.log.borrow_mut().log(entry);
    }

    // ------------------------------------------------------------------
    // Bug-trace notes used by the step runner
    // ------------------------------------------------------------------

    pub(crate) fn note_invoke_action(
        &self,
        machine: &MachineId,
        state: &StateName,
        action: &str,
    ) {
        self.record_bug_step(
            BugStep::new(BugStepKind::InvokeAction)
                .with_machine(machine)
                .with_state(state)
                .with_action(action),
        );
    }

    pub(crate) fn note_dequeue(&self, machine: &MachineId, state: &StateName, ty: &EventType) {
        self.record_bug_step(
            BugStep::new(BugStepKind::DequeueEvent)
                .with_machine(machine)
                .with_state(state)
                .with_event_type(ty),
        );
    }

    pub(crate) fn note_raise(&self, machine: &MachineId, state: &StateName, ty: &EventType) {
        self.record_bug_step(
            BugStep::new(BugStepKind::RaiseEvent)
                .with_machine(machine)
                .with_state(state)
                .with_event_type(ty),
        );
    }

    pub(crate) fn note_goto(&self, machine: &MachineId, from: &StateName, to: &StateName) {
        self.record_bug_step(
            BugStep::new(BugStepKind::GotoState)
                .with_machine(machine)
                .with_state(from)
                .with_action(to),
        );
    }

    pub(crate) fn note_push(&self, machine: &MachineId, from: &StateName, to: &StateName) {
        self.record_bug_step(
            BugStep::new(BugStepKind::PushState)
                .with_machine(machine)
                .with_state(from)
                .with_action(to),
        );
    }

    pub(crate) fn note_pop(&self, machine: &MachineId, from: &StateName) {
        self.record_bug_step(
            BugStep::new(BugStepKind::PopState)
                .with_machine(machine)
                .with_state(from),
        );
    }

    pub(crate) fn note_halt(&self, machine: &MachineId, state: &StateName, dropped: u64) {
        self.stats.borrow_mut().dropped_halted += dropped;
        self.record_bug_step(
            BugStep::new(BugStepKind::Halt)
                .with_machine(machine)
                .with_state(state),
        );
        self.log(LogEntry::info("machine halted").with_field("machine", machine));
    }

    pub(crate) fn note_wait_to_receive(
        &self,
        machine: &MachineId,
        state: &StateName,
        wanted: &[EventType],
    ) {
        let types = wanted
            .iter()
            .map(EventType::name)
            .collect::<Vec<_>>()
            .join(",");
        self.record_bug_step(
            BugStep::new(BugStepKind::WaitToReceive)
                .with_machine(machine)
                .with_state(state)
                .with_event_type(types),
        );
    }

    pub(crate) fn note_receive(&self, machine: &MachineId, state: &StateName, ty: &EventType) {
        self.record_bug_step(
            BugStep::new(BugStepKind::ReceiveEvent)
                .with_machine(machine)
                .with_state(state)
                .with_event_type(ty),
        );
    }

    fn note_random(&self, origin: Option<(MachineId, StateName)>, choice: &str) {
        let mut step = BugStep::new(BugStepKind::RandomChoice).with_choice(choice);
        if let Some((machine, state)) = origin {
            step = step.with_machine(machine).with_state(state);
        }
        self.record_bug_step(step);
    }
}
