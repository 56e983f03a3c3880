//! Machine type metadata: the reflection-free state definition registry.
//!
//! A machine type is declared by constructing a [`MachineType`] through the
//! typed builder: name the states, their entry/exit handlers, and how each
//! state reacts to each event type. States form a tree; a state may name one
//! parent whose handler maps it inherits (the child overrides the parent on
//! conflicting event types, the parent fills in otherwise). The builder
//! validates the whole graph at `build` time, so an invalid declaration is a
//! configuration error before any step runs, and flattens the inherited maps
//! once per state so handler lookup during execution is a single map probe.

use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::machine::cx::MachineCx;
use crate::types::{EventType, StateName};

/// Future returned by a machine action handler.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// Type-erased machine data cell.
pub(crate) type DataCell = Rc<RefCell<dyn Any>>;

/// Type-erased asynchronous action handler (entry handlers and do-actions).
pub(crate) type ErasedAction = Rc<dyn Fn(DataCell, MachineCx) -> ActionFuture>;

/// Type-erased synchronous handler (exit handlers).
pub(crate) type ErasedExit = Rc<dyn Fn(&mut dyn Any, &MachineCx) -> Result<()>>;

/// Typed view of a machine's data cell, handed to asynchronous handlers.
///
/// Borrows must not be held across an `await`; take what you need, drop the
/// guard, then suspend.
pub struct DataRef<M: Any> {
    cell: DataCell,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Any> DataRef<M> {
    pub(crate) fn new(cell: DataCell) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// Mutably borrows the machine data.
    ///
    /// # Panics
    ///
    /// Panics if the data is already borrowed; handlers run one at a time,
    /// so this only happens when a borrow is held across an `await`.
    #[must_use]
    pub fn borrow_mut(&self) -> RefMut<'_, M> {
        RefMut::map(self.cell.borrow_mut(), |data| {
            data.downcast_mut::<M>()
                .expect("machine data matches its declared type")
        })
    }
}

impl<M: Any> Clone for DataRef<M> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.cell))
    }
}

fn borrow_typed<M: Any>(cell: &DataCell) -> RefMut<'_, M> {
    RefMut::map(cell.borrow_mut(), |data| {
        data.downcast_mut::<M>()
            .expect("machine data matches its declared type")
    })
}

// ============================================================================
// Declarations
// ============================================================================

/// How a state reacts to one event type, after inheritance is resolved.
#[derive(Clone)]
pub(crate) enum EventReaction {
    /// Run a user action without changing the state stack.
    Do(ErasedAction),
    /// Pop the current frame and push the target.
    Goto(StateName),
    /// Push the target without popping.
    Push(StateName),
    /// Leave the event at its inbox position.
    Defer,
    /// Discard the event on dequeue.
    Ignore,
}

/// Raw per-state declaration, before inheritance flattening.
struct StateDecl {
    parent: Option<StateName>,
    is_start: bool,
    entry: Option<ErasedAction>,
    exit: Option<ErasedExit>,
    reactions: BTreeMap<EventType, EventReaction>,
    /// First event type declared twice at this level, if any.
    duplicate_event: Option<EventType>,
}

/// Flattened per-state metadata used during execution.
pub(crate) struct FlatState {
    pub(crate) entry: Option<ErasedAction>,
    pub(crate) exit: Option<ErasedExit>,
    pub(crate) reactions: BTreeMap<EventType, EventReaction>,
}

impl FlatState {
    /// Resolves the reaction for an event type, if any is declared.
    pub(crate) fn reaction(&self, ty: &EventType) -> Option<&EventReaction> {
        self.reactions.get(ty)
    }

    /// Returns true if an event of this type can be taken from the inbox.
    pub(crate) fn is_dequeuable(&self, ty: &EventType) -> bool {
        !matches!(
            self.reactions.get(ty),
            Some(EventReaction::Defer | EventReaction::Ignore)
        )
    }

    pub(crate) fn is_deferred(&self, ty: &EventType) -> bool {
        matches!(self.reactions.get(ty), Some(EventReaction::Defer))
    }

    pub(crate) fn is_ignored(&self, ty: &EventType) -> bool {
        matches!(self.reactions.get(ty), Some(EventReaction::Ignore))
    }
}

/// Validated, immutable metadata for one machine type.
///
/// Built once via [`MachineTypeBuilder`] and registered with the runtime;
/// instances share it through an `Rc`.
pub struct MachineType {
    name: String,
    factory: Rc<dyn Fn() -> DataCell>,
    start: StateName,
    states: BTreeMap<StateName, FlatState>,
}

impl MachineType {
    /// Returns the machine type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the start state name.
    #[must_use]
    pub(crate) const fn start(&self) -> &StateName {
        &self.start
    }

    /// Creates a fresh data cell for a new instance.
    pub(crate) fn new_data(&self) -> DataCell {
        (self.factory)()
    }

    /// Looks up a state's flattened metadata.
    pub(crate) fn state(&self, name: &StateName) -> Result<&FlatState> {
        self.states.get(name).ok_or_else(|| {
            Error::internal(format!("machine type {} has no state {name}", self.name))
        })
    }
}

impl core::fmt::Debug for MachineType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachineType")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for one state of a machine type.
///
/// Produced by [`MachineTypeBuilder::state`]; the closure configures it and
/// hands it back.
pub struct StateBuilder<M: Any> {
    decl: StateDecl,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Any> StateBuilder<M> {
    fn new() -> Self {
        Self {
            decl: StateDecl {
                parent: None,
                is_start: false,
                entry: None,
                exit: None,
                reactions: BTreeMap::new(),
                duplicate_event: None,
            },
            _marker: PhantomData,
        }
    }

    fn react(mut self, event: &str, reaction: EventReaction) -> Self {
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

    /// Names the parent state whose handler maps this state inherits.
    #[must_use]
    pub fn parent(mut self, name: &str) -> Self {
        self.decl.parent = Some(StateName::new(name));
        self
    }

    /// Sets a synchronous entry handler.
    #[must_use]
    pub fn on_entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut M, &MachineCx) -> Result<()> + 'static,
    {
        self.decl.entry = Some(erase_sync_action(f));
        self
    }

    /// Sets an entry handler that may suspend (e.g. in `receive`).
    #[must_use]
    pub fn on_entry_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DataRef<M>, MachineCx) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.decl.entry = Some(erase_async_action(f));
        self
    }

    /// Sets the exit handler.
    ///
    /// Exit handlers run before the pop takes effect and are synchronous:
    /// they may raise and issue further pops, but not suspend.
    #[must_use]
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut M, &MachineCx) -> Result<()> + 'static,
    {
        self.decl.exit = Some(Rc::new(move |data, cx| {
            let data = data
                .downcast_mut::<M>()
                .expect("machine data matches its declared type");
            f(data, cx)
        }));
        self
    }

    /// Reacts to an event type with a synchronous action.
    #[must_use]
    pub fn on<F>(self, event: &str, f: F) -> Self
    where
        F: Fn(&mut M, &MachineCx) -> Result<()> + 'static,
    {
        self.react(event, EventReaction::Do(erase_sync_action(f)))
    }

    /// Reacts to an event type with an action that may suspend.
    #[must_use]
    pub fn on_async<F, Fut>(self, event: &str, f: F) -> Self
    where
        F: Fn(DataRef<M>, MachineCx) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.react(event, EventReaction::Do(erase_async_action(f)))
    }

    /// Transitions to `target` (pop + push) when the event is dequeued.
    #[must_use]
    pub fn goto_on(self, event: &str, target: &str) -> Self {
        self.react(event, EventReaction::Goto(StateName::new(target)))
    }

    /// Pushes `target` (no pop) when the event is dequeued.
    #[must_use]
    pub fn push_on(self, event: &str, target: &str) -> Self {
        self.react(event, EventReaction::Push(StateName::new(target)))
    }

    /// Defers the event: it stays at its inbox position until a state
    /// that handles it is on top.
    #[must_use]
    pub fn defer(self, event: &str) -> Self {
        self.react(event, EventReaction::Defer)
    }

    /// Ignores the event: it is discarded on dequeue.
    #[must_use]
    pub fn ignore(self, event: &str) -> Self {
        self.react(event, EventReaction::Ignore)
    }
}

fn erase_sync_action<M, F>(f: F) -> ErasedAction
where
    M: Any,
    F: Fn(&mut M, &MachineCx) -> Result<()> + 'static,
{
    let f = Rc::new(f);
    Rc::new(move |cell: DataCell, cx: MachineCx| -> ActionFuture {
        let f = Rc::clone(&f);
        Box::pin(async move {
            let mut data = borrow_typed::<M>(&cell);
            let result = f(&mut data, &cx);
            drop(data);
            result
        })
    })
}

fn erase_async_action<M, F, Fut>(f: F) -> ErasedAction
where
    M: Any,
    F: Fn(DataRef<M>, MachineCx) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Rc::new(move |cell: DataCell, cx: MachineCx| -> ActionFuture {
        Box::pin(f(DataRef::new(cell), cx))
    })
}

/// Builder for a complete machine type.
pub struct MachineTypeBuilder<M: Any> {
    name: String,
    factory: Rc<dyn Fn() -> DataCell>,
    decls: BTreeMap<StateName, StateDecl>,
    duplicate_state: Option<StateName>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Any + Default> MachineTypeBuilder<M> {
    /// Starts a builder whose instances get `M::default()` data.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::new_with(name, M::default)
    }
}

impl<M: Any> MachineTypeBuilder<M> {
    /// Starts a builder with an explicit data factory.
    #[must_use]
    pub fn new_with(name: &str, factory: impl Fn() -> M + 'static) -> Self {
        Self {
            name: name.to_string(),
            factory: Rc::new(move || -> DataCell { Rc::new(RefCell::new(factory())) }),
            decls: BTreeMap::new(),
            duplicate_state: None,
            _marker: PhantomData,
        }
    }

    /// Declares a state; the closure configures its handlers and transitions.
    #[must_use]
    pub fn state(
        mut self,
        name: &str,
        configure: impl FnOnce(StateBuilder<M>) -> StateBuilder<M>,
    ) -> Self {
        let state_name = StateName::new(name);
        let builder = configure(StateBuilder::new());
        if self
            .decls
            .insert(state_name.clone(), builder.decl)
            .is_some()
        {
            self.duplicate_state = Some(state_name);
        }
        self
    }

    /// Validates the declaration and produces the immutable metadata.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the state graph is invalid: no or
    /// multiple start states, an unknown parent or transition target, a
    /// parent cycle, or a duplicate state declaration.
    pub fn build(self) -> Result<MachineType> {
        let name = self.name;
        if let Some(dup) = self.duplicate_state {
            return Err(Error::configuration(format!(
                "machine type {name}: state {dup} declared twice"
            )));
        }
        if self.decls.is_empty() {
            return Err(Error::configuration(format!(
                "machine type {name}: no states declared"
            )));
        }

        let mut start = None;
        for (state, decl) in &self.decls {
            if let Some(event) = &decl.duplicate_event {
                return Err(Error::configuration(format!(
                    "machine type {name}: state {state} declares two handlers for {event}"
                )));
            }
            if decl.is_start {
                if let Some(first) = &start {
                    return Err(Error::configuration(format!(
                        "machine type {name}: two start states, {first} and {state}"
                    )));
                }
                start = Some(state.clone());
            }
            if let Some(parent) = &decl.parent {
                if !self.decls.contains_key(parent) {
                    return Err(Error::configuration(format!(
                        "machine type {name}: state {state} names unknown parent {parent}"
                    )));
                }
            }
            for reaction in decl.reactions.values() {
                let target = match reaction {
                    EventReaction::Goto(t) | EventReaction::Push(t) => t,
                    _ => continue,
                };
                if !self.decls.contains_key(target) {
                    return Err(Error::configuration(format!(
                        "machine type {name}: state {state} transitions to unknown state {target}"
                    )));
                }
            }
        }
        let Some(start) = start else {
            return Err(Error::configuration(format!(
                "machine type {name}: no start state"
            )));
        };

        // Flatten inheritance: walk each parent chain once, nearest level wins.
        let mut states = BTreeMap::new();
        for state in self.decls.keys() {
            let mut reactions: BTreeMap<EventType, EventReaction> = BTreeMap::new();
            let mut seen = BTreeSet::new();
            let mut cursor = Some(state.clone());
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(Error::configuration(format!(
                        "machine type {name}: parent cycle through state {current}"
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
                FlatState {
                    entry: decl.entry.clone(),
                    exit: decl.exit.clone(),
                    reactions,
                },
            );
        }

        Ok(MachineType {
            name,
            factory: self.factory,
            start,
            states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Data;

    #[test]
    fn missing_start_state_is_rejected() {
        let err = MachineTypeBuilder::<Data>::new("M")
            .state("A", |s| s)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn two_start_states_are_rejected() {
        let err = MachineTypeBuilder::<Data>::new("M")
            .state("A", StateBuilder::start)
            .state("B", StateBuilder::start)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("two start states"));
    }

    #[test]
    fn two_handlers_for_one_event_are_rejected() {
        let err = MachineTypeBuilder::<Data>::new("M")
            .state("A", |s| s.start().defer("E").goto_on("E", "A"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("two handlers"));
    }

    #[test]
    fn unknown_goto_target_is_rejected() {
        let err = MachineTypeBuilder::<Data>::new("M")
            .state("A", |s| s.start().goto_on("E", "Nowhere"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown state"));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let err = MachineTypeBuilder::<Data>::new("M")
            .state("A", |s| s.start().parent("Ghost"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown parent"));
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let err = MachineTypeBuilder::<Data>::new("M")
            .state("A", |s| s.start().parent("B"))
            .state("B", |s| s.parent("A"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("parent cycle"));
    }

    #[test]
    fn child_overrides_parent_reaction() {
        let mtype = MachineTypeBuilder::<Data>::new("M")
            .state("Base", |s| s.defer("E").ignore("F"))
            .state("A", |s| s.start().parent("Base").goto_on("E", "A"))
            .build()
            .unwrap();

        let flat = mtype.state(&StateName::new("A")).unwrap();
        assert!(matches!(
            flat.reaction(&EventType::new("E")),
            Some(EventReaction::Goto(_))
        ));
        // Parent fills in where the child is silent.
        assert!(flat.is_ignored(&EventType::new("F")));
    }

    #[test]
    fn flattened_dequeue_predicates() {
        let mtype = MachineTypeBuilder::<Data>::new("M")
            .state("A", |s| s.start().defer("D").ignore("I").goto_on("G", "A"))
            .build()
            .unwrap();
        let flat = mtype.state(&StateName::new("A")).unwrap();
        assert!(!flat.is_dequeuable(&EventType::new("D")));
        assert!(!flat.is_dequeuable(&EventType::new("I")));
        assert!(flat.is_dequeuable(&EventType::new("G")));
        assert!(flat.is_dequeuable(&EventType::new("unknown")));
    }
}
