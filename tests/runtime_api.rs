//! Runtime API behavior: synchronous execution, monitors, send options,
//! deadlock detection, and cancellation.
//!
//! Run with: `cargo test --test runtime_api`

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::init_test_logging;
use statelab::{
    DataRef, ErrorKind, Event, MachineCx, MachineType, MachineTypeBuilder, MonitorTypeBuilder,
    OperationGroupId, RunStatus, Runtime, SendOptions,
};

// ============================================================================
// Synchronous execution primitives
// ============================================================================

#[derive(Default)]
struct OneShot;

fn one_shot_type() -> MachineType {
    MachineTypeBuilder::<OneShot>::new("OneShot")
        .state("Init", |s| {
            s.start().on_entry(|_m: &mut OneShot, cx| {
                cx.halt();
                Ok(())
            })
        })
        .build()
        .unwrap()
}

#[test]
fn create_and_execute_drives_target_to_completion() {
    init_test_logging();
    let runtime = Runtime::with_seed(2);
    runtime.register(one_shot_type()).unwrap();
    // The target runs to halt inside the call; no scheduler loop needed.
    let id = runtime.create_and_execute("OneShot", None).unwrap();
    assert!(runtime.is_halted(&id).unwrap());
}

#[derive(Default)]
struct Worker {
    jobs: u32,
}

fn worker_type(counter: &Rc<RefCell<u32>>) -> MachineType {
    let counter = Rc::clone(counter);
    MachineTypeBuilder::<Worker>::new("Worker")
        .state("Idle", |s| {
            s.start().on("Job", move |m: &mut Worker, _cx: &MachineCx| {
                m.jobs += 1;
                *counter.borrow_mut() += 1;
                Ok(())
            })
        })
        .build()
        .unwrap()
}

#[test]
fn send_and_execute_reports_handled() {
    init_test_logging();
    let counter = Rc::new(RefCell::new(0_u32));
    let runtime = Runtime::with_seed(2);
    runtime.register(worker_type(&counter)).unwrap();
    let worker = runtime.create_machine("Worker", None).unwrap();

    let handled = runtime.send_and_execute(&worker, Event::new("Job")).unwrap();
    assert!(handled);
    assert_eq!(*counter.borrow(), 1);
}

#[derive(Default)]
struct Selective;

fn selective_type() -> MachineType {
    MachineTypeBuilder::<Selective>::new("Selective")
        .state("Main", |s| {
            s.start()
                .on_entry_async(|_data: DataRef<Selective>, cx: MachineCx| async move {
                    let _ = cx.receive(&["Wanted"]).await?;
                    Ok(())
                })
        })
        .build()
        .unwrap()
}

#[test]
fn send_and_execute_reports_unhandled_when_target_blocks() {
    init_test_logging();
    let runtime = Runtime::with_seed(2);
    runtime.register(selective_type()).unwrap();
    let target = runtime.create_machine("Selective", None).unwrap();

    // The target parks waiting for `Wanted`; `Job` stays queued.
    let handled = runtime.send_and_execute(&target, Event::new("Job")).unwrap();
    assert!(!handled);
    assert_eq!(runtime.inbox_len(&target).unwrap(), 1);
}

#[derive(Default)]
struct SelfCaller;

fn self_caller_type() -> MachineType {
    MachineTypeBuilder::<SelfCaller>::new("SelfCaller")
        .state("Init", |s| {
            s.start().on("Kick", |_m: &mut SelfCaller, cx| {
                let me = cx.id();
                let _ = cx.send_and_execute(&me, Event::new("Loop"))?;
                Ok(())
            })
        })
        .build()
        .unwrap()
}

#[test]
fn await_cycle_is_a_bug() {
    init_test_logging();
    let runtime = Runtime::with_seed(2);
    runtime.register(self_caller_type()).unwrap();
    let machine = runtime.create_machine("SelfCaller", None).unwrap();
    runtime
        .send_event(&machine, Event::new("Kick"), SendOptions::new())
        .unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    assert_eq!(runtime.bug().unwrap().error.kind(), ErrorKind::AwaitCycle);
}

// ============================================================================
// Monitors
// ============================================================================

#[derive(Default)]
struct SeenCount {
    seen: u32,
}

#[test]
fn safety_monitor_catches_the_third_request() {
    init_test_logging();
    let monitor = MonitorTypeBuilder::<SeenCount>::new("AtMostTwo")
        .state("Counting", |s| {
            s.start().on("Request", |m: &mut SeenCount, cx| {
                m.seen += 1;
                cx.assert_that(m.seen <= 2, "at most two requests")
            })
        })
        .build()
        .unwrap();

    #[derive(Default)]
    struct Requester;
    let requester = MachineTypeBuilder::<Requester>::new("Requester")
        .state("Init", |s| {
            s.start().on_entry(|_m: &mut Requester, cx| {
                for _ in 0..3 {
                    cx.monitor("AtMostTwo", Event::new("Request"))?;
                }
                Ok(())
            })
        })
        .build()
        .unwrap();

    let runtime = Runtime::with_seed(4);
    runtime.register_monitor(monitor).unwrap();
    runtime.register(requester).unwrap();
    runtime.create_machine("Requester", None).unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    let bug = runtime.bug().unwrap();
    assert_eq!(bug.error.kind(), ErrorKind::AssertionFailure);
    // Attributed to the invoking machine's step.
    assert!(bug.machine.is_some());
}

#[test]
fn liveness_monitor_hot_at_quiescence_is_a_bug() {
    init_test_logging();
    let monitor = MonitorTypeBuilder::<SeenCount>::new("Progress")
        .state("Waiting", |s| s.start().hot().goto_on("Done", "Satisfied"))
        .state("Satisfied", |s| s.cold())
        .build()
        .unwrap();

    #[derive(Default)]
    struct Staller;
    let staller = MachineTypeBuilder::<Staller>::new("Staller")
        .state("Init", |s| s.start())
        .build()
        .unwrap();

    let runtime = Runtime::with_seed(4);
    runtime.register_monitor(monitor).unwrap();
    runtime.register(staller).unwrap();
    runtime.create_machine("Staller", None).unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    assert_eq!(
        runtime.bug().unwrap().error.kind(),
        ErrorKind::LivenessViolation
    );
}

// ============================================================================
// Send options
// ============================================================================

#[derive(Default)]
struct Sink;

fn sink_type() -> MachineType {
    MachineTypeBuilder::<Sink>::new("Sink")
        .state("Init", |s| {
            s.start().on("Stop", |_m: &mut Sink, cx| {
                cx.halt();
                Ok(())
            })
            .ignore("Data")
        })
        .build()
        .unwrap()
}

#[test]
fn must_handle_drop_on_halted_machine_is_a_bug() {
    init_test_logging();
    let runtime = Runtime::with_seed(8);
    runtime.register(sink_type()).unwrap();
    let sink = runtime.create_machine("Sink", None).unwrap();
    runtime
        .send_event(&sink, Event::new("Stop"), SendOptions::new())
        .unwrap();
    assert_eq!(runtime.run(), RunStatus::Quiescent);

    runtime
        .send_event(
            &sink,
            Event::new("Data"),
            SendOptions::new().must_handle(),
        )
        .unwrap();
    let bug = runtime.bug().expect("must-handle drop is reported");
    assert_eq!(bug.error.kind(), ErrorKind::DroppedMustHandleEvent);
}

#[test]
fn in_flight_bound_is_enforced() {
    init_test_logging();
    let runtime = Runtime::with_seed(8);
    runtime.register(sink_type()).unwrap();
    let sink = runtime.create_machine("Sink", None).unwrap();

    let bounded = SendOptions::new().assert_at_most(1);
    runtime
        .send_event(&sink, Event::new("Data"), bounded.clone())
        .unwrap();
    runtime
        .send_event(&sink, Event::new("Data"), bounded)
        .unwrap();

    let bug = runtime.bug().expect("second in-flight event exceeds bound");
    assert_eq!(bug.error.kind(), ErrorKind::EventOverflow);
}

#[test]
fn operation_group_propagates_to_receiver() {
    init_test_logging();
    let counter = Rc::new(RefCell::new(0_u32));
    let runtime = Runtime::with_seed(8);
    runtime.register(worker_type(&counter)).unwrap();
    let worker = runtime.create_machine("Worker", None).unwrap();

    let group = OperationGroupId::from_raw(0xfeed_beef);
    runtime
        .send_event(
            &worker,
            Event::new("Job"),
            SendOptions::new().with_operation_group(group),
        )
        .unwrap();
    assert_eq!(runtime.run(), RunStatus::Quiescent);
    assert_eq!(runtime.operation_group_id(&worker).unwrap(), group);
}

// ============================================================================
// Deadlock, double raise, cancellation
// ============================================================================

#[test]
fn blocked_receive_with_no_sender_is_a_deadlock() {
    init_test_logging();
    #[derive(Default)]
    struct Forever;
    let forever = MachineTypeBuilder::<Forever>::new("Forever")
        .state("Main", |s| {
            s.start()
                .on_entry_async(|_data: DataRef<Forever>, cx: MachineCx| async move {
                    let _ = cx.receive(&["Never"]).await?;
                    Ok(())
                })
        })
        .build()
        .unwrap();

    let runtime = Runtime::with_seed(6);
    runtime.register(forever).unwrap();
    runtime.create_machine("Forever", None).unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    let bug = runtime.bug().unwrap();
    assert_eq!(bug.error.kind(), ErrorKind::Deadlock);
    assert!(bug.to_string().contains("Never"));
}

#[test]
fn second_raise_in_a_step_is_a_bug() {
    init_test_logging();
    #[derive(Default)]
    struct Eager;
    let eager = MachineTypeBuilder::<Eager>::new("Eager")
        .state("Init", |s| {
            s.start()
                .on_entry(|_m: &mut Eager, cx| {
                    cx.raise(Event::new("One"))?;
                    cx.raise(Event::new("Two"))
                })
                .ignore("One")
                .ignore("Two")
        })
        .build()
        .unwrap();

    let runtime = Runtime::with_seed(6);
    runtime.register(eager).unwrap();
    runtime.create_machine("Eager", None).unwrap();

    assert_eq!(runtime.run(), RunStatus::BugFound);
    assert_eq!(runtime.bug().unwrap().error.kind(), ErrorKind::DoubleRaise);
}

#[test]
fn stop_prevents_further_steps() {
    init_test_logging();
    let counter = Rc::new(RefCell::new(0_u32));
    let runtime = Runtime::with_seed(6);
    runtime.register(worker_type(&counter)).unwrap();
    let worker = runtime.create_machine("Worker", None).unwrap();
    runtime
        .send_event(&worker, Event::new("Job"), SendOptions::new())
        .unwrap();

    runtime.stop();
    assert_eq!(runtime.run(), RunStatus::Stopped);
    assert_eq!(*counter.borrow(), 0);
    assert_eq!(runtime.inbox_len(&worker).unwrap(), 1);
}

#[test]
fn failure_callback_fires_once() {
    init_test_logging();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let runtime = Runtime::with_seed(6);
    runtime.register(sink_type()).unwrap();
    let sink = runtime.create_machine("Sink", None).unwrap();
    runtime.set_on_failure({
        let calls = Rc::clone(&calls);
        move |bug| calls.borrow_mut().push(bug.error.kind())
    });

    runtime
        .send_event(&sink, Event::new("Unknown"), SendOptions::new())
        .unwrap();
    assert_eq!(runtime.run(), RunStatus::BugFound);
    assert_eq!(calls.borrow().as_slice(), &[ErrorKind::UnhandledEvent]);
}
