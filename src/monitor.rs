//! Specification monitors.
//!
//! A monitor is a state machine driven synchronously from the invoking
//! machine's step: `invoke` runs its handlers to quiescence before returning,
//! so monitors observe events in exactly the order the step produced them.
//! Monitors are never scheduled, have no inbox, and may only raise, change
//! state, and assert; they cannot send, create machines, receive, or make
//! nondeterministic choices — the API simply does not offer those.
//!
//! Liveness properties use *hot* and *cold* state designations: a monitor
//! still in a hot state when a bounded run ends is a liveness violation.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use crate::types::{EventType, StateName};

/// Synchronous monitor handler.
type MonitorHandler = Rc<dyn Fn(&mut dyn Any, &MonitorCx) -> Result<()>>;

/// How a monitor state reacts to one event type.
#[derive(Clone)]
enum MonitorReaction {
    Do(MonitorHandler),
    Goto(StateName),
    Push(StateName),
    Ignore,
}

/// Temperature of a monitor state, for liveness checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Temperature {
    /// No pending obligation.
    #[default]
    Neutral,
    /// An obligation is outstanding; ending a run here is a liveness bug.
    Hot,
    /// An obligation was discharged.
    Cold,
}

struct MonitorStateDecl {
    parent: Option<StateName>,
    is_start: bool,
    temperature: Temperature,
    entry: Option<MonitorHandler>,
    exit: Option<MonitorHandler>,
    reactions: BTreeMap<EventType, MonitorReaction>,
    duplicate_event: Option<EventType>,
}

struct FlatMonitorState {
    temperature: Temperature,
    entry: Option<MonitorHandler>,
    exit: Option<MonitorHandler>,
    reactions: BTreeMap<EventType, MonitorReaction>,
}

/// Validated metadata for one monitor type.
pub struct MonitorType {
    name: String,
    factory: Rc<dyn Fn() -> Box<dyn Any>>,
    start: StateName,
    states: BTreeMap<StateName, FlatMonitorState>,
}

impl MonitorType {
    /// Returns the monitor type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self, name: &StateName) -> Result<&FlatMonitorState> {
        self.states.get(name).ok_or_else(|| {
            Error::internal(format!("monitor type {} has no state {name}", self.name))
        })
    }
}

impl core::fmt::Debug for MonitorType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MonitorType")
            .field("name", &self.name)
            .field("start", &self.start)
            .finish()
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for one monitor state.
pub struct MonitorStateBuilder<M: Any> {
    decl: MonitorStateDecl,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Any> MonitorStateBuilder<M> {
    fn new() -> Self {
        Self {
            decl: MonitorStateDecl {
                parent: None,
                is_start: false,
                temperature: Temperature::Neutral,
                entry: None,
                exit: None,
                reactions: BTreeMap::new(),
                duplicate_event: None,
            },
            _marker: PhantomData,
        }
    }

    fn react(mut self, event: &str, reaction: MonitorReaction) -> Self {
        let ty = EventType::new(event);
        if self.decl.reactions.insert(ty.clone(), reaction).is_some() {
            self.decl.duplicate_event = Some(ty);
        }
        self
    }

    /// Marks this state as the start state.
    #[must_use]
    pub fn start(mut self) -> Self {
        self.decl.is_start = true;
        self
    }

    /// Names the parent state whose handler map this state inherits.
    #[must_use]
    pub fn parent(mut self, name: &str) -> Self {
        self.decl.parent = Some(StateName::new(name));
        self
    }

    /// Marks this state hot: a pending liveness obligation.
    #[must_use]
    pub fn hot(mut self) -> Self {
        self.decl.temperature = Temperature::Hot;
        self
    }

    /// Marks this state cold: the obligation is discharged.
    #[must_use]
    pub fn cold(mut self) -> Self {
        self.decl.temperature = Temperature::Cold;
        self
    }

    /// Sets the entry handler.
    #[must_use]
    pub fn on_entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut M, &MonitorCx) -> Result<()> + 'static,
    {
        self.decl.entry = Some(erase_monitor_handler(f));
        self
    }

    /// Sets the exit handler.
    #[must_use]
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut M, &MonitorCx) -> Result<()> + 'static,
    {
        self.decl.exit = Some(erase_monitor_handler(f));
        self
    }

    /// Reacts to an event type with an action.
    #[must_use]
    pub fn on<F>(self, event: &str, f: F) -> Self
    where
        F: Fn(&mut M, &MonitorCx) -> Result<()> + 'static,
    {
        self.react(event, MonitorReaction::Do(erase_monitor_handler(f)))
    }

    /// Transitions to `target` when the event arrives.
    #[must_use]
    pub fn goto_on(self, event: &str, target: &str) -> Self {
        self.react(event, MonitorReaction::Goto(StateName::new(target)))
    }

    /// Pushes `target` when the event arrives.
    #[must_use]
    pub fn push_on(self, event: &str, target: &str) -> Self {
        self.react(event, MonitorReaction::Push(StateName::new(target)))
    }

    /// Ignores the event in this state.
    #[must_use]
    pub fn ignore(self, event: &str) -> Self {
        self.react(event, MonitorReaction::Ignore)
    }
}

fn erase_monitor_handler<M, F>(f: F) -> MonitorHandler
where
    M: Any,
    F: Fn(&mut M, &MonitorCx) -> Result<()> + 'static,
{
    Rc::new(move |data, cx| {
        let data = data
            .downcast_mut::<M>()
            .expect("monitor data matches its declared type");
        f(data, cx)
    })
}

/// Builder for a complete monitor type.
pub struct MonitorTypeBuilder<M: Any> {
    name: String,
    factory: Rc<dyn Fn() -> Box<dyn Any>>,
    decls: BTreeMap<StateName, MonitorStateDecl>,
    duplicate_state: Option<StateName>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Any + Default> MonitorTypeBuilder<M> {
    /// Starts a builder whose instance gets `M::default()` data.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::new_with(name, M::default)
    }
}

impl<M: Any> MonitorTypeBuilder<M> {
    /// Starts a builder with an explicit data factory.
    #[must_use]
    pub fn new_with(name: &str, factory: impl Fn() -> M + 'static) -> Self {
        Self {
            name: name.to_string(),
            factory: Rc::new(move || -> Box<dyn Any> { Box::new(factory()) }),
            decls: BTreeMap::new(),
            duplicate_state: None,
            _marker: PhantomData,
        }
    }

    /// Declares a state; the closure configures it.
    #[must_use]
    pub fn state(
        mut self,
        name: &str,
        configure: impl FnOnce(MonitorStateBuilder<M>) -> MonitorStateBuilder<M>,
    ) -> Self {
        let state_name = StateName::new(name);
        let builder = configure(MonitorStateBuilder::new());
        if self
            .decls
            .insert(state_name.clone(), builder.decl)
            .is_some()
        {
            self.duplicate_state = Some(state_name);
        }
        self
    }

    /// Validates the declaration and produces the monitor type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on an invalid state graph, mirroring the
    /// machine-type checks.
    pub fn build(self) -> Result<MonitorType> {
        let name = self.name;
        if let Some(dup) = self.duplicate_state {
            return Err(Error::configuration(format!(
                "monitor type {name}: state {dup} declared twice"
            )));
        }
        if self.decls.is_empty() {
            return Err(Error::configuration(format!(
                "monitor type {name}: no states declared"
            )));
        }
        let mut start = None;
        for (state, decl) in &self.decls {
            if let Some(event) = &decl.duplicate_event {
                return Err(Error::configuration(format!(
                    "monitor type {name}: state {state} declares two handlers for {event}"
                )));
            }
            if decl.is_start {
                if let Some(first) = &start {
                    return Err(Error::configuration(format!(
                        "monitor type {name}: two start states, {first} and {state}"
                    )));
                }
                start = Some(state.clone());
            }
            if let Some(parent) = &decl.parent {
                if !self.decls.contains_key(parent) {
                    return Err(Error::configuration(format!(
                        "monitor type {name}: state {state} names unknown parent {parent}"
                    )));
                }
            }
            for reaction in decl.reactions.values() {
                let target = match reaction {
                    MonitorReaction::Goto(t) | MonitorReaction::Push(t) => t,
                    _ => continue,
                };
                if !self.decls.contains_key(target) {
                    return Err(Error::configuration(format!(
                        "monitor type {name}: state {state} transitions to unknown state {target}"
                    )));
                }
            }
        }
        let Some(start) = start else {
            return Err(Error::configuration(format!(
                "monitor type {name}: no start state"
            )));
        };

        let mut states = BTreeMap::new();
        for state in self.decls.keys() {
            let mut reactions: BTreeMap<EventType, MonitorReaction> = BTreeMap::new();
            let mut seen = BTreeSet::new();
            let mut cursor = Some(state.clone());
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(Error::configuration(format!(
                        "monitor type {name}: parent cycle through state {current}"
                    )));
                }
                let decl = &self.decls[&current];
                for (ty, reaction) in &decl.reactions {
                    reactions
                        .entry(ty.clone())
                        .or_insert_with(|| reaction.clone());
                }
                cursor = decl.parent.clone();
            }
            let decl = &self.decls[state];
            states.insert(
                state.clone(),
                FlatMonitorState {
                    temperature: decl.temperature,
                    entry: decl.entry.clone(),
                    exit: decl.exit.clone(),
                    reactions,
                },
            );
        }

        Ok(MonitorType {
            name,
            factory: self.factory,
            start,
            states,
        })
    }
}

// ============================================================================
// Monitor context
// ============================================================================

struct MonitorFrame {
    monitor: String,
    current_state: StateName,
    current_event: Option<Event>,
    raised: Option<Event>,
    transitions: VecDeque<MonitorTransition>,
}

enum MonitorTransition {
    Goto(StateName),
    Push(StateName),
    Pop,
}

/// The context handed to monitor handlers: raise, state changes, and
/// assertions only.
pub struct MonitorCx {
    frame: Rc<RefCell<MonitorFrame>>,
}

impl MonitorCx {
    /// The monitor type name.
    #[must_use]
    pub fn name(&self) -> String {
        self.frame.borrow().monitor.clone()
    }

    /// The current (top) state.
    #[must_use]
    pub fn current_state(&self) -> StateName {
        self.frame.borrow().current_state.clone()
    }

    /// The event being processed.
    #[must_use]
    pub fn current_event(&self) -> Option<Event> {
        self.frame.borrow().current_event.clone()
    }

    /// Raises an event to this monitor; processed before `invoke` returns.
    ///
    /// # Errors
    ///
    /// At most one raise per handler execution.
    pub fn raise(&self, event: Event) -> Result<()> {
        let mut frame = self.frame.borrow_mut();
        if frame.raised.is_some() {
            return Err(Error::new(ErrorKind::DoubleRaise).with_context(format!(
                "monitor {} raised {} while an earlier raise is still pending",
                frame.monitor,
                event.event_type()
            )));
        }
        frame.raised = Some(event);
        Ok(())
    }

    /// Transitions to `state`.
    pub fn goto_state(&self, state: &str) {
        self.frame
            .borrow_mut()
            .transitions
            .push_back(MonitorTransition::Goto(StateName::new(state)));
    }

    /// Pushes `state`.
    pub fn push_state(&self, state: &str) {
        self.frame
            .borrow_mut()
            .transitions
            .push_back(MonitorTransition::Push(StateName::new(state)));
    }

    /// Pops the current state.
    pub fn pop_state(&self) {
        self.frame
            .borrow_mut()
            .transitions
            .push_back(MonitorTransition::Pop);
    }

    /// Asserts a safety condition observed by this monitor.
    ///
    /// # Errors
    ///
    /// Returns an assertion-failure error when `condition` is false.
    pub fn assert_that(&self, condition: bool, message: &str) -> Result<()> {
        if condition {
            Ok(())
        } else {
            let frame = self.frame.borrow();
            Err(Error::assertion(format!(
                "monitor {} in state {}: {message}",
                frame.monitor, frame.current_state
            )))
        }
    }
}

// ============================================================================
// Monitor instance
// ============================================================================

/// A live monitor: shared metadata plus its state stack and data.
pub(crate) struct MonitorInstance {
    mtype: Rc<MonitorType>,
    data: Box<dyn Any>,
    stack: Vec<StateName>,
}

impl MonitorInstance {
    /// Instantiates the monitor and runs the start state's entry handler.
    pub(crate) fn new(mtype: Rc<MonitorType>) -> Result<Self> {
        let data = (mtype.factory)();
        let start = mtype.start.clone();
        let mut instance = Self {
            mtype,
            data,
            stack: vec![start.clone()],
        };
        instance.enter_to_quiescence(None)?;
        Ok(instance)
    }

    pub(crate) fn name(&self) -> &str {
        self.mtype.name()
    }

    pub(crate) fn current_state(&self) -> StateName {
        self.stack
            .last()
            .cloned()
            .unwrap_or_else(|| self.mtype.start.clone())
    }

    /// Returns true if the monitor currently sits in a hot state.
    pub(crate) fn in_hot_state(&self) -> bool {
        self.mtype
            .state(&self.current_state())
            .map(|s| s.temperature == Temperature::Hot)
            .unwrap_or(false)
    }

    /// Drives the monitor with one event, to quiescence.
    pub(crate) fn invoke(&mut self, event: Event) -> Result<()> {
        let mut pending = Some(event);
        while let Some(event) = pending.take() {
            let state = self.current_state();
            let ty = event.event_type().clone();
            let reaction = self
                .mtype
                .state(&state)?
                .reactions
                .get(&ty)
                .cloned();
            let frame = self.new_frame(Some(event.clone()));
            match reaction {
                Some(MonitorReaction::Do(handler)) => {
                    let cx = MonitorCx {
                        frame: Rc::clone(&frame),
                    };
                    handler(self.data.as_mut(), &cx)?;
                }
                Some(MonitorReaction::Goto(target)) => {
                    frame
                        .borrow_mut()
                        .transitions
                        .push_back(MonitorTransition::Goto(target));
                }
                Some(MonitorReaction::Push(target)) => {
                    frame
                        .borrow_mut()
                        .transitions
                        .push_back(MonitorTransition::Push(target));
                }
                Some(MonitorReaction::Ignore) => {}
                None => {
                    return Err(Error::new(ErrorKind::UnhandledEvent).with_context(format!(
                        "monitor {} received {ty} in state {state}",
                        self.name()
                    )));
                }
            }
            pending = self.apply_frame(&frame)?;
        }
        Ok(())
    }

    fn new_frame(&self, event: Option<Event>) -> Rc<RefCell<MonitorFrame>> {
        Rc::new(RefCell::new(MonitorFrame {
            monitor: self.name().to_string(),
            current_state: self.current_state(),
            current_event: event,
            raised: None,
            transitions: VecDeque::new(),
        }))
    }

    /// Applies trapped transitions, returning a raised event if one is left
    /// to process.
    fn apply_frame(&mut self, frame: &Rc<RefCell<MonitorFrame>>) -> Result<Option<Event>> {
        loop {
            let next = frame.borrow_mut().transitions.pop_front();
            let Some(transition) = next else { break };
            match transition {
                MonitorTransition::Goto(target) => {
                    self.run_exit(frame)?;
                    self.stack.pop();
                    self.stack.push(target.clone());
                    frame.borrow_mut().current_state = target.clone();
                    self.run_entry(frame, &target)?;
                }
                MonitorTransition::Push(target) => {
                    self.stack.push(target.clone());
                    frame.borrow_mut().current_state = target.clone();
                    self.run_entry(frame, &target)?;
                }
                MonitorTransition::Pop => {
                    self.run_exit(frame)?;
                    self.stack.pop();
                    if self.stack.is_empty() {
                        return Err(Error::assertion(format!(
                            "monitor {} popped its last state",
                            self.name()
                        )));
                    }
                    frame.borrow_mut().current_state = self.current_state();
                }
            }
        }
        Ok(frame.borrow_mut().raised.take())
    }

    fn run_entry(&mut self, frame: &Rc<RefCell<MonitorFrame>>, state: &StateName) -> Result<()> {
        let entry = self.mtype.state(state)?.entry.clone();
        if let Some(entry) = entry {
            let cx = MonitorCx {
                frame: Rc::clone(frame),
            };
            entry(self.data.as_mut(), &cx)?;
        }
        Ok(())
    }

    fn run_exit(&mut self, frame: &Rc<RefCell<MonitorFrame>>) -> Result<()> {
        let state = self.current_state();
        let exit = self.mtype.state(&state)?.exit.clone();
        if let Some(exit) = exit {
            let cx = MonitorCx {
                frame: Rc::clone(frame),
            };
            exit(self.data.as_mut(), &cx)?;
        }
        Ok(())
    }

    /// Runs the start state's entry handler at instantiation.
    fn enter_to_quiescence(&mut self, event: Option<Event>) -> Result<()> {
        let start = self.current_state();
        let frame = self.new_frame(event);
        self.run_entry(&frame, &start)?;
        if let Some(raised) = self.apply_frame(&frame)? {
            self.invoke(raised)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SeenCount {
        seen: u32,
    }

    fn liveness_monitor() -> MonitorType {
        MonitorTypeBuilder::<SeenCount>::new("Progress")
            .state("Waiting", |s| {
                s.start().hot().goto_on("Done", "Satisfied").on(
                    "Tick",
                    |m: &mut SeenCount, _cx| {
                        m.seen += 1;
                        Ok(())
                    },
                )
            })
            .state("Satisfied", |s| s.cold())
            .build()
            .unwrap()
    }

    #[test]
    fn hot_until_transition() {
        let mut monitor = MonitorInstance::new(Rc::new(liveness_monitor())).unwrap();
        assert!(monitor.in_hot_state());
        monitor.invoke(Event::new("Tick")).unwrap();
        assert!(monitor.in_hot_state());
        monitor.invoke(Event::new("Done")).unwrap();
        assert!(!monitor.in_hot_state());
        assert_eq!(monitor.current_state().as_str(), "Satisfied");
    }

    #[test]
    fn unhandled_monitor_event_is_a_bug() {
        let mut monitor = MonitorInstance::new(Rc::new(liveness_monitor())).unwrap();
        let err = monitor.invoke(Event::new("Bogus")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnhandledEvent);
    }

    #[test]
    fn raise_is_processed_to_quiescence() {
        #[derive(Default)]
        struct Chain;
        let mtype = MonitorTypeBuilder::<Chain>::new("Chain")
            .state("A", |s| {
                s.start()
                    .on("Kick", |_m, cx| cx.raise(Event::new("Step")))
                    .goto_on("Step", "B")
            })
            .state("B", |s| s)
            .build()
            .unwrap();
        let mut monitor = MonitorInstance::new(Rc::new(mtype)).unwrap();
        monitor.invoke(Event::new("Kick")).unwrap();
        assert_eq!(monitor.current_state().as_str(), "B");
    }

    #[test]
    fn monitor_assertion_carries_state() {
        #[derive(Default)]
        struct Strict;
        let mtype = MonitorTypeBuilder::<Strict>::new("Safety")
            .state("Init", |s| {
                s.start()
                    .on("Bad", |_m, cx| cx.assert_that(false, "never allowed"))
            })
            .build()
            .unwrap();
        let mut monitor = MonitorInstance::new(Rc::new(mtype)).unwrap();
        let err = monitor.invoke(Event::new("Bad")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AssertionFailure);
        assert!(err.to_string().contains("Safety"));
        assert!(err.to_string().contains("Init"));
    }
}
