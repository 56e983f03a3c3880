//! The state store abstraction behind the reliable overlay.
//!
//! A store offers exactly three capabilities: a persistent ordered state
//! stack per machine, a persistent FIFO inbox per machine, and transactions
//! that apply a step's staged mutations atomically. The in-memory
//! implementation backs tests and supports injecting transient commit
//! failures at chosen points; real deployments plug a durable store in
//! behind the same trait.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::event::EventEnvelope;
use crate::types::StateName;

/// Storage failures surfaced by a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Retryable failure (timeout, transaction conflict). The overlay
    /// discards the step's buffered work and re-runs it.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Non-retryable failure.
    #[error("storage failure: {0}")]
    Fatal(String),
}

/// Staged mutations of one transactional step.
#[derive(Debug, Default)]
pub struct StoreTx {
    stack_writes: Vec<StackDelta>,
    dequeues: Vec<u64>,
    enqueues: Vec<(u64, EventEnvelope)>,
}

#[derive(Debug)]
struct StackDelta {
    machine: u64,
    pop_depth: usize,
    pushed: Vec<StateName>,
}

impl StoreTx {
    /// Stages a state-stack delta for a machine.
    pub fn write_stack(&mut self, machine: u64, pop_depth: usize, pushed: Vec<StateName>) {
        self.stack_writes.push(StackDelta {
            machine,
            pop_depth,
            pushed,
        });
    }

    /// Stages the dequeue of the head envelope of a machine's inbox.
    pub fn dequeue(&mut self, machine: u64) {
        self.dequeues.push(machine);
    }

    /// Stages an enqueue into a peer machine's inbox.
    pub fn enqueue(&mut self, machine: u64, envelope: EventEnvelope) {
        self.enqueues.push((machine, envelope));
    }

    /// Returns true if the transaction stages no mutations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack_writes.is_empty() && self.dequeues.is_empty() && self.enqueues.is_empty()
    }
}

/// Persistent state behind reliable machines.
pub trait StateStore {
    /// Reads a machine's persisted state stack (bottom first).
    fn read_stack(&self, machine: u64) -> Vec<StateName>;

    /// Number of envelopes in a machine's persistent inbox.
    fn inbox_len(&self, machine: u64) -> usize;

    /// Registers a machine at creation time with its initial stack. Not
    /// transactional: creation happens before the first step.
    fn seed_machine(&mut self, machine: u64, stack: Vec<StateName>);

    /// Opens a transaction.
    fn begin(&mut self) -> StoreTx {
        StoreTx::default()
    }

    /// Atomically applies a transaction's staged mutations.
    ///
    /// # Errors
    ///
    /// [`StoreError::Transient`] when the commit should be retried; nothing
    /// was applied.
    fn commit(&mut self, tx: StoreTx) -> Result<(), StoreError>;
}

/// In-memory store with injectable commit failures.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    stacks: BTreeMap<u64, Vec<StateName>>,
    inboxes: BTreeMap<u64, VecDeque<EventEnvelope>>,
    /// Zero-based commit indices that fail with a transient error.
    fail_at: BTreeSet<u64>,
    commits_attempted: u64,
    failures_injected: u64,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a transient failure at the given zero-based commit attempt.
    pub fn fail_commit_at(&mut self, attempt: u64) {
        self.fail_at.insert(attempt);
    }

    /// Number of transient failures injected so far.
    #[must_use]
    pub const fn failures_injected(&self) -> u64 {
        self.failures_injected
    }

    /// Number of commit attempts observed so far.
    #[must_use]
    pub const fn commits_attempted(&self) -> u64 {
        self.commits_attempted
    }
}

impl StateStore for InMemoryStore {
    fn read_stack(&self, machine: u64) -> Vec<StateName> {
        self.stacks.get(&machine).cloned().unwrap_or_default()
    }

    fn inbox_len(&self, machine: u64) -> usize {
        self.inboxes.get(&machine).map_or(0, VecDeque::len)
    }

    fn seed_machine(&mut self, machine: u64, stack: Vec<StateName>) {
        self.stacks.insert(machine, stack);
        self.inboxes.entry(machine).or_default();
    }

    fn commit(&mut self, tx: StoreTx) -> Result<(), StoreError> {
        let attempt = self.commits_attempted;
        self.commits_attempted += 1;
        if self.fail_at.remove(&attempt) {
            self.failures_injected += 1;
            return Err(StoreError::Transient(format!(
                "injected failure at commit attempt {attempt}"
            )));
        }
        for delta in tx.stack_writes {
            let stack = self.stacks.entry(delta.machine).or_default();
            let keep = stack.len().saturating_sub(delta.pop_depth);
            stack.truncate(keep);
            stack.extend(delta.pushed);
        }
        for machine in tx.dequeues {
            if let Some(inbox) = self.inboxes.get_mut(&machine) {
                inbox.pop_front();
            }
        }
        for (machine, envelope) in tx.enqueues {
            self.inboxes.entry(machine).or_default().push_back(envelope);
        }
        Ok(())
    }
}
