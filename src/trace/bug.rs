//! Bug traces: the human-oriented semantic log of a run.
//!
//! Where the schedule trace records *decisions*, the bug trace records what
//! those decisions *did*: machine creations, sends, dequeues, state changes,
//! receives, random choices, halts. Each step carries predecessor and
//! successor pointers so a UI can walk the trace in either direction.
//!
//! The serialized form is a JSON array of step objects; absent fields are
//! null.

use serde::{Deserialize, Serialize};

/// The kind of a bug-trace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BugStepKind {
    /// A machine was created.
    CreateMachine,
    /// A monitor was registered.
    CreateMonitor,
    /// A machine sent an event.
    SendEvent,
    /// A machine dequeued an event from its inbox.
    DequeueEvent,
    /// A machine dispatched an event it had raised.
    RaiseEvent,
    /// A machine transitioned between states.
    GotoState,
    /// A machine pushed a state.
    PushState,
    /// A machine popped a state.
    PopState,
    /// A machine invoked a handler.
    InvokeAction,
    /// A machine suspended waiting to receive.
    WaitToReceive,
    /// A machine received an awaited event.
    ReceiveEvent,
    /// A machine observed a nondeterministic choice.
    RandomChoice,
    /// A machine halted.
    Halt,
}

/// One semantic step in the bug trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugStep {
    /// Position in the trace.
    pub index: u64,
    /// Step kind.
    pub kind: BugStepKind,
    /// Machine the step belongs to, as a display string.
    pub machine: Option<String>,
    /// The machine's state when the step happened.
    pub state: Option<String>,
    /// Event type involved, if any.
    pub event_type: Option<String>,
    /// Target machine of a send or create.
    pub target: Option<String>,
    /// Handler name for action invocations ("entry", "exit", or the event
    /// type), or the goto/push target state.
    pub action: Option<String>,
    /// Chosen value for random choices.
    pub choice: Option<String>,
    /// Index of the previous step, if any.
    pub prev: Option<u64>,
    /// Index of the next step, if any.
    pub next: Option<u64>,
}

impl BugStep {
    /// Creates a step of the given kind with all optional fields empty.
    /// Index and pointers are filled in by [`BugTrace::push`].
    #[must_use]
    pub const fn new(kind: BugStepKind) -> Self {
        Self {
            index: 0,
            kind,
            machine: None,
            state: None,
            event_type: None,
            target: None,
            action: None,
            choice: None,
            prev: None,
            next: None,
        }
    }

    /// Sets the machine field.
    #[must_use]
    pub fn with_machine(mut self, machine: impl ToString) -> Self {
        self.machine = Some(machine.to_string());
        self
    }

    /// Sets the state field.
    #[must_use]
    pub fn with_state(mut self, state: impl ToString) -> Self {
        self.state = Some(state.to_string());
        self
    }

    /// Sets the event-type field.
    #[must_use]
    pub fn with_event_type(mut self, ty: impl ToString) -> Self {
        self.event_type = Some(ty.to_string());
        self
    }

    /// Sets the target field.
    #[must_use]
    pub fn with_target(mut self, target: impl ToString) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Sets the action field.
    #[must_use]
    pub fn with_action(mut self, action: impl ToString) -> Self {
        self.action = Some(action.to_string());
        self
    }

    /// Sets the choice field.
    #[must_use]
    pub fn with_choice(mut self, choice: impl ToString) -> Self {
        self.choice = Some(choice.to_string());
        self
    }
}

/// An append-only bug trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BugTrace {
    steps: Vec<BugStep>,
}

impl BugTrace {
    /// Creates an empty trace.
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Appends a step, wiring up its index and predecessor/successor
    /// pointers.
    pub fn push(&mut self, mut step: BugStep) {
        let index = self.steps.len() as u64;
        step.index = index;
        step.prev = index.checked_sub(1);
        step.next = None;
        if let Some(last) = self.steps.last_mut() {
            last.next = Some(index);
        }
        self.steps.push(step);
    }

    /// Returns the recorded steps in order.
    #[must_use]
    pub fn steps(&self) -> &[BugStep] {
        &self.steps
    }

    /// Returns the number of recorded steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the steps of the given kind, in order.
    pub fn steps_of_kind(&self, kind: BugStepKind) -> impl Iterator<Item = &BugStep> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }

    /// Serializes the trace as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.steps)
    }

    /// Parses a trace from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        Ok(Self {
            steps: serde_json::from_str(text)?,
        })
    }
}
