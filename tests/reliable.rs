//! Reliable overlay: transactional steps, retry on transient failure,
//! exactly-once effects.
//!
//! Run with: `cargo test --test reliable`

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::init_test_logging;
use statelab::{
    BugStepKind, ErrorKind, Event, InMemoryStore, MachineCx, MachineId, MachineType,
    MachineTypeBuilder, RandomStrategy, ReliableRuntime, RunStatus, SharedStore, SharedStrategy,
    StateName, StateStore, StrategyKind, TestConfig,
};

fn strategy(seed: u64) -> SharedStrategy {
    Rc::new(RefCell::new(Box::new(RandomStrategy::new(seed))))
}

#[derive(Default)]
struct Pinger;

#[derive(Default)]
struct Ponger;

fn pinger_type() -> MachineType {
    MachineTypeBuilder::<Pinger>::new("Pinger")
        .state("Init", |s| {
            s.start().on_entry(|_m: &mut Pinger, cx: &MachineCx| {
                let target = cx
                    .current_event()
                    .and_then(|e| e.payload::<MachineId>().cloned())
                    .expect("target id payload");
                cx.send(&target, Event::new("Ping"))?;
                cx.goto_state("Done");
                Ok(())
            })
        })
        .state("Done", |s| s)
        .build()
        .unwrap()
}

fn ponger_type() -> MachineType {
    MachineTypeBuilder::<Ponger>::new("Ponger")
        .state("Waiting", |s| s.start().goto_on("Ping", "Done"))
        .state("Done", |s| s)
        .build()
        .unwrap()
}

fn build_ping_pair(reliable: &ReliableRuntime) -> (MachineId, MachineId) {
    reliable.runtime().register(pinger_type()).unwrap();
    reliable.runtime().register(ponger_type()).unwrap();
    let ponger = reliable.create_machine("Ponger", None).unwrap();
    let pinger = reliable
        .create_machine(
            "Pinger",
            Some(Event::new("Start").with_payload(ponger.clone())),
        )
        .unwrap();
    (pinger, ponger)
}

#[test]
fn clean_run_commits_every_step() {
    init_test_logging();
    let store = Rc::new(RefCell::new(InMemoryStore::new()));
    let shared: SharedStore = store.clone();
    let reliable = ReliableRuntime::new(&TestConfig::new(3), strategy(3), shared);
    let (pinger, ponger) = build_ping_pair(&reliable);

    assert_eq!(reliable.run(), RunStatus::Quiescent);

    let store = store.borrow();
    assert_eq!(store.failures_injected(), 0);
    assert_eq!(
        store.read_stack(pinger.value()),
        vec![StateName::new("Done")]
    );
    assert_eq!(
        store.read_stack(ponger.value()),
        vec![StateName::new("Done")]
    );
    // The ping was enqueued and dequeued durably.
    assert_eq!(store.inbox_len(ponger.value()), 0);
}

#[test]
fn transient_failure_reruns_the_step_exactly_once_effects() {
    init_test_logging();
    let store = Rc::new(RefCell::new(InMemoryStore::new()));
    // The first step commit (the pinger's send) fails once.
    store.borrow_mut().fail_commit_at(0);
    let shared: SharedStore = store.clone();
    let reliable = ReliableRuntime::new(&TestConfig::new(3), strategy(3), shared);
    let (pinger, ponger) = build_ping_pair(&reliable);

    assert_eq!(reliable.run(), RunStatus::Quiescent);
    assert_eq!(store.borrow().failures_injected(), 1);

    // Peers observed the send exactly once.
    let stats = reliable.runtime().stats();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.dequeued, 1);

    // Exactly one dequeue/invoke/send triple for the retried step.
    let trace = reliable.runtime().bug_trace();
    assert_eq!(trace.steps_of_kind(BugStepKind::SendEvent).count(), 1);
    assert_eq!(trace.steps_of_kind(BugStepKind::DequeueEvent).count(), 1);
    assert_eq!(
        trace
            .steps_of_kind(BugStepKind::InvokeAction)
            .filter(|s| s.action.as_deref() == Some("entry"))
            .count(),
        1
    );

    // The durable state converged all the same.
    assert_eq!(
        store.borrow().read_stack(pinger.value()),
        vec![StateName::new("Done")]
    );
    assert_eq!(
        store.borrow().read_stack(ponger.value()),
        vec![StateName::new("Done")]
    );
}

#[test]
fn retried_step_observes_identical_random_choices() {
    init_test_logging();
    let observed: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    #[derive(Default)]
    struct Roller;
    let roller = {
        let observed = Rc::clone(&observed);
        MachineTypeBuilder::<Roller>::new("Roller")
            .state("Init", |s| {
                s.start().on_entry(move |_m: &mut Roller, cx: &MachineCx| {
                    let value = cx.random_int(1000)?;
                    observed.borrow_mut().push(value);
                    cx.goto_state("Done");
                    Ok(())
                })
            })
            .state("Done", |s| s)
            .build()
            .unwrap()
    };

    let store = Rc::new(RefCell::new(InMemoryStore::new()));
    store.borrow_mut().fail_commit_at(0);
    let shared: SharedStore = store.clone();
    let reliable = ReliableRuntime::new(&TestConfig::new(5), strategy(5), shared);
    reliable.runtime().register(roller).unwrap();
    reliable.create_machine("Roller", None).unwrap();

    assert_eq!(reliable.run(), RunStatus::Quiescent);

    // The handler executed twice but saw the same value both times.
    let observed = observed.borrow();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0], observed[1]);

    // The discarded attempt left no residue in the schedule trace.
    let schedule = reliable.runtime().schedule_trace();
    let int_choices = schedule
        .points()
        .iter()
        .filter(|p| matches!(p, statelab::ChoicePoint::IntChoice(_)))
        .count();
    assert_eq!(int_choices, 1);
}

#[test]
fn exhausted_retry_budget_surfaces_as_failure() {
    init_test_logging();
    let store = Rc::new(RefCell::new(InMemoryStore::new()));
    {
        let mut store = store.borrow_mut();
        for attempt in 0..8 {
            store.fail_commit_at(attempt);
        }
    }
    let shared: SharedStore = store.clone();
    let config = TestConfig::new(3).storage_retry_budget(2);
    let reliable = ReliableRuntime::new(&config, strategy(3), shared);
    build_ping_pair(&reliable);

    assert_eq!(reliable.run(), RunStatus::BugFound);
    assert_eq!(
        reliable.runtime().bug().unwrap().error.kind(),
        ErrorKind::StorageRetriesExhausted
    );
}

#[test]
fn overlay_and_core_agree_on_the_program() {
    init_test_logging();
    // The same seed drives the same schedule with and without the overlay.
    let core = statelab::Runtime::with_seed(9);
    core.register(pinger_type()).unwrap();
    core.register(ponger_type()).unwrap();
    let ponger = core.create_machine("Ponger", None).unwrap();
    core.create_machine(
        "Pinger",
        Some(Event::new("Start").with_payload(ponger.clone())),
    )
    .unwrap();
    assert_eq!(core.run(), RunStatus::Quiescent);

    let store = Rc::new(RefCell::new(InMemoryStore::new()));
    let shared: SharedStore = store.clone();
    let config = TestConfig::new(9).strategy(StrategyKind::Random);
    let reliable = ReliableRuntime::new(&config, strategy(9), shared);
    build_ping_pair(&reliable);
    assert_eq!(reliable.run(), RunStatus::Quiescent);

    assert_eq!(
        core.bug_trace().to_json().unwrap(),
        reliable.runtime().bug_trace().to_json().unwrap()
    );
}
