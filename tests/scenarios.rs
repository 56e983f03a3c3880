//! End-to-end scenarios exercising the machine execution model.
//!
//! Run with: `cargo test --test scenarios`

mod common;

use common::{assert_in_order, init_test_logging};
use statelab::{
    BugStepKind, DataRef, Event, ErrorKind, MachineCx, MachineId, MachineType,
    MachineTypeBuilder, RunStatus, Runtime,
};

// ============================================================================
// Ping-pong: two machines, one round trip, clean shutdown
// ============================================================================

#[derive(Default)]
struct Client;

#[derive(Default)]
struct Server;

fn client_type() -> MachineType {
    MachineTypeBuilder::<Client>::new("Client")
        .state("Active", |s| {
            s.start().on_entry(|_m: &mut Client, cx| {
                let server = cx
                    .current_event()
                    .and_then(|e| e.payload::<MachineId>().cloned())
                    .expect("creation event carries the server id");
                cx.send(&server, Event::new("Ping"))?;
                cx.goto_state("Waiting");
                Ok(())
            })
        })
        .state("Waiting", |s| {
            s.on("Pong", |_m: &mut Client, cx| {
                cx.halt();
                Ok(())
            })
        })
        .build()
        .unwrap()
}

fn server_type() -> MachineType {
    MachineTypeBuilder::<Server>::new("Server")
        .state("Active", |s| {
            s.on("Ping", |_m: &mut Server, cx| {
                let sender = cx.sender().expect("ping came from a machine");
                cx.send(&sender, Event::new("Pong"))
            })
            .start()
        })
        .build()
        .unwrap()
}

#[test]
fn ping_pong_round_trip() {
    init_test_logging();
    for seed in [1, 7, 42, 1234] {
        let runtime = Runtime::with_seed(seed);
        runtime.register(client_type()).unwrap();
        runtime.register(server_type()).unwrap();

        let server_id = runtime.create_machine_id("Server", None).unwrap();
        let client = runtime
            .create_machine(
                "Client",
                Some(Event::new("Start").with_payload(server_id.clone())),
            )
            .unwrap();
        runtime
            .create_machine_with_id(&server_id, "Server", None)
            .unwrap();

        assert_eq!(runtime.run(), RunStatus::Quiescent, "seed {seed}");
        assert!(runtime.is_halted(&client).unwrap());

        let trace = runtime.bug_trace();
        let client_name = client.to_string();
        let server_name = server_id.to_string();
        assert_in_order(
            &trace,
            vec![
                (
                    "Create(Client)",
                    is_step(BugStepKind::CreateMachine, {
                        let client_name = client_name.clone();
                        move |s| s.target.as_deref() == Some(client_name.as_str())
                    }),
                ),
                (
                    "Create(Server)",
                    is_step(BugStepKind::CreateMachine, {
                        let server_name = server_name.clone();
                        move |s| s.target.as_deref() == Some(server_name.as_str())
                    }),
                ),
                (
                    "Send(Client, Server, Ping)",
                    is_step(BugStepKind::SendEvent, |s| {
                        s.event_type.as_deref() == Some("Ping")
                    }),
                ),
                (
                    "Dequeue(Server, Active, Ping)",
                    is_step(BugStepKind::DequeueEvent, |s| {
                        s.event_type.as_deref() == Some("Ping")
                            && s.state.as_deref() == Some("Active")
                    }),
                ),
                (
                    "Send(Server, Client, Pong)",
                    is_step(BugStepKind::SendEvent, |s| {
                        s.event_type.as_deref() == Some("Pong")
                    }),
                ),
                (
                    "Dequeue(Client, Waiting, Pong)",
                    is_step(BugStepKind::DequeueEvent, |s| {
                        s.event_type.as_deref() == Some("Pong")
                            && s.state.as_deref() == Some("Waiting")
                    }),
                ),
                (
                    "Halt(Client)",
                    is_step(BugStepKind::Halt, move |s| {
                        s.machine.as_deref() == Some(client_name.as_str())
                    }),
                ),
            ],
        );
    }
}

fn is_step(
    kind: BugStepKind,
    extra: impl Fn(&statelab::BugStep) -> bool + 'static,
) -> Box<dyn Fn(&statelab::BugStep) -> bool> {
    Box::new(move |s| s.kind == kind && extra(s))
}

// ============================================================================
// Unreachable-assert: exit handler fires on a raised transition
// ============================================================================

#[derive(Default)]
struct Raiser;

fn raiser_type() -> MachineType {
    MachineTypeBuilder::<Raiser>::new("Raiser")
        .state("A", |s| {
            s.start()
                .on_entry(|_m: &mut Raiser, cx| cx.raise(Event::new("E")))
                .goto_on("E", "B")
                .on_exit(|_m: &mut Raiser, cx| cx.assert_that(false, "exit of A must not run"))
        })
        .state("B", |s| s)
        .build()
        .unwrap()
}

#[test]
fn exit_assertion_is_found_by_random_and_dfs() {
    init_test_logging();
    for strategy in [statelab::StrategyKind::Random, statelab::StrategyKind::Dfs] {
        let config = statelab::TestConfig::new(42).strategy(strategy).iterations(3);
        let engine = statelab::TestingEngine::new(config, |runtime| {
            runtime.register(raiser_type())?;
            runtime.create_machine("Raiser", None)?;
            Ok(())
        });
        let report = engine.run().unwrap();
        let bug = report.bug.expect("assertion failure must be found");
        assert_eq!(bug.kind, "assertion failure", "{strategy:?}");
        assert_eq!(bug.state.as_deref(), Some("A"));

        // The trace ends with the exit-handler invocation.
        let trace = statelab::BugTrace::from_json(&report.bug_trace.unwrap()).unwrap();
        let last = trace.steps().last().unwrap();
        assert_eq!(last.kind, BugStepKind::InvokeAction);
        assert_eq!(last.action.as_deref(), Some("exit"));
    }
}

// ============================================================================
// Deferral ordering: deferred events keep their position and are never lost
// ============================================================================

#[derive(Default)]
struct Deferrer;

fn deferrer_type() -> MachineType {
    MachineTypeBuilder::<Deferrer>::new("Deferrer")
        .state("S1", |s| s.start().defer("E1").goto_on("E2", "S2"))
        .state("S2", |s| {
            s.on("E1", |_m: &mut Deferrer, cx| {
                cx.halt();
                Ok(())
            })
        })
        .build()
        .unwrap()
}

#[test]
fn deferred_event_is_handled_after_goto() {
    init_test_logging();
    let runtime = Runtime::with_seed(3);
    runtime.register(deferrer_type()).unwrap();
    let machine = runtime.create_machine("Deferrer", None).unwrap();
    runtime
        .send_event(&machine, Event::new("E1"), statelab::SendOptions::new())
        .unwrap();
    runtime
        .send_event(&machine, Event::new("E2"), statelab::SendOptions::new())
        .unwrap();

    assert_eq!(runtime.run(), RunStatus::Quiescent);

    assert_in_order(
        &runtime.bug_trace(),
        vec![
            (
                "Dequeue(S1, E2)",
                is_step(BugStepKind::DequeueEvent, |s| {
                    s.event_type.as_deref() == Some("E2") && s.state.as_deref() == Some("S1")
                }),
            ),
            (
                "Goto(S1 -> S2)",
                is_step(BugStepKind::GotoState, |s| {
                    s.state.as_deref() == Some("S1") && s.action.as_deref() == Some("S2")
                }),
            ),
            (
                "Dequeue(S2, E1)",
                is_step(BugStepKind::DequeueEvent, |s| {
                    s.event_type.as_deref() == Some("E1") && s.state.as_deref() == Some("S2")
                }),
            ),
        ],
    );

    // The deferred event was consumed, not discarded.
    let stats = runtime.stats();
    assert_eq!(stats.ignored_dropped, 0);
    assert_eq!(stats.enqueued, stats.dequeued);
}

// ============================================================================
// Receive blocks: only the awaited type is consumed, others stay queued
// ============================================================================

#[derive(Default)]
struct Waiter {
    got_e1: bool,
}

fn waiter_type() -> MachineType {
    MachineTypeBuilder::<Waiter>::new("Waiter")
        .state("Main", |s| {
            s.start()
                .on_entry_async(|data: DataRef<Waiter>, cx: MachineCx| async move {
                    let event = cx.receive(&["E1"]).await?;
                    cx.assert_that(event.event_type().name() == "E1", "receive filters by type")?;
                    data.borrow_mut().got_e1 = true;
                    Ok(())
                })
                .on("E2", |m: &mut Waiter, cx| {
                    cx.assert_that(m.got_e1, "E2 is dequeued only after the receive completes")?;
                    cx.halt();
                    Ok(())
                })
        })
        .build()
        .unwrap()
}

#[test]
fn receive_defers_non_matching_events() {
    init_test_logging();
    let runtime = Runtime::with_seed(11);
    runtime.register(waiter_type()).unwrap();
    let machine = runtime.create_machine("Waiter", None).unwrap();
    // E2 arrives first and must stay at the head while the machine waits.
    runtime
        .send_event(&machine, Event::new("E2"), statelab::SendOptions::new())
        .unwrap();
    runtime
        .send_event(&machine, Event::new("E1"), statelab::SendOptions::new())
        .unwrap();

    assert_eq!(runtime.run(), RunStatus::Quiescent);

    assert_in_order(
        &runtime.bug_trace(),
        vec![
            (
                "WaitToReceive({E1})",
                is_step(BugStepKind::WaitToReceive, |s| {
                    s.event_type.as_deref() == Some("E1")
                }),
            ),
            (
                "ReceiveEvent(E1)",
                is_step(BugStepKind::ReceiveEvent, |s| {
                    s.event_type.as_deref() == Some("E1")
                }),
            ),
            (
                "Dequeue(E2)",
                is_step(BugStepKind::DequeueEvent, |s| {
                    s.event_type.as_deref() == Some("E2")
                }),
            ),
        ],
    );
}

// ============================================================================
// Halt event and unhandled events
// ============================================================================

#[derive(Default)]
struct Idle;

fn idle_type() -> MachineType {
    MachineTypeBuilder::<Idle>::new("Idle")
        .state("Init", |s| s.start())
        .build()
        .unwrap()
}

#[test]
fn unhandled_halt_event_halts_gracefully() {
    init_test_logging();
    let runtime = Runtime::with_seed(5);
    runtime.register(idle_type()).unwrap();
    let machine = runtime.create_machine("Idle", None).unwrap();
    runtime
        .send_event(&machine, Event::halt(), statelab::SendOptions::new())
        .unwrap();

    assert_eq!(runtime.run(), RunStatus::Quiescent);
    assert!(runtime.is_halted(&machine).unwrap());
    assert!(runtime.bug().is_none());
}

#[test]
fn unhandled_event_is_a_bug() {
    init_test_logging();
    let runtime = Runtime::with_seed(5);
    runtime.register(idle_type()).unwrap();
    let machine = runtime.create_machine("Idle", None).unwrap();
    runtime
        .send_event(&machine, Event::new("Surprise"), statelab::SendOptions::new())
        .unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    let bug = runtime.bug().unwrap();
    assert_eq!(bug.error.kind(), ErrorKind::UnhandledEvent);
    assert!(bug.to_string().contains("Surprise"));
}

#[test]
fn handler_panic_is_reported_as_a_bug() {
    init_test_logging();
    #[derive(Default)]
    struct Panicky;
    let mtype = MachineTypeBuilder::<Panicky>::new("Panicky")
        .state("Init", |s| {
            s.start()
                .on_entry(|_m: &mut Panicky, _cx| panic!("boom in handler"))
        })
        .build()
        .unwrap();

    let runtime = Runtime::with_seed(5);
    runtime.register(mtype).unwrap();
    runtime.create_machine("Panicky", None).unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    let bug = runtime.bug().unwrap();
    assert_eq!(bug.error.kind(), ErrorKind::UnhandledPanic);
    assert!(bug.to_string().contains("boom in handler"));
}
