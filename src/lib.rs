//! Statelab: a deterministic bug-finding runtime for communicating
//! hierarchical state machines.
//!
//! # Overview
//!
//! Statelab executes a population of message-passing state machines on a
//! single-threaded, cooperative scheduler that *controls* every source of
//! nondeterminism: which machine steps next, the value of every random
//! choice, and the order receives resolve. A pluggable exploration strategy
//! walks the space of interleavings, and every run produces a schedule trace
//! that replays it byte-for-byte.
//!
//! # Core Guarantees
//!
//! - **Serial steps**: exactly one machine step executes at a time; user code
//!   of two machines never interleaves within a step
//! - **Atomic step output**: sends and creates buffer during a step and apply
//!   together when it ends or suspends
//! - **Determinism**: the same strategy and seed reproduce the same schedule
//!   trace and bug trace
//! - **Replayability**: a recorded schedule is sufficient input to reproduce
//!   a run; divergence is detected and reported
//! - **Per-sender FIFO**: a receiver dequeues any one sender's events in send
//!   order
//!
//! # Module Structure
//!
//! - [`types`]: identities (machine ids, event types, state names, groups)
//! - [`event`]: events, send options, inbox envelopes
//! - [`machine`]: machine type declarations, instances, inboxes, handler
//!   context
//! - [`monitor`]: synchronous specification monitors with hot/cold states
//! - [`runtime`]: the scheduler and public runtime API
//! - [`strategy`]: exploration strategies (random, DFS, PCT, replay)
//! - [`trace`]: schedule traces and bug traces
//! - [`reliable`]: transactional step overlay and state stores
//! - [`net`]: the network-provider boundary
//! - [`engine`]: the iteration loop around the runtime
//! - [`config`]: run configuration
//! - [`cli`]: argument parsing and exit codes
//! - [`observability`]: structured logging
//! - [`util`]: deterministic RNG
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod machine;
pub mod monitor;
pub mod net;
pub(crate) mod oracle;
pub mod observability;
pub mod reliable;
pub mod runtime;
pub mod strategy;
pub mod trace;
pub mod types;
pub mod util;

// Re-exports for convenient access to core types
pub use config::{StrategyKind, TestConfig};
pub use engine::{BugReport, TestReport, TestingEngine};
pub use error::{Bug, Error, ErrorKind, Result};
pub use event::{Event, EventEnvelope, SendOptions};
pub use machine::{DataRef, MachineCx, MachineType, MachineTypeBuilder, Receive, StateBuilder};
pub use monitor::{MonitorCx, MonitorType, MonitorTypeBuilder};
pub use net::{LocalNetworkProvider, NetworkProvider, RemoteOp};
pub use reliable::{InMemoryStore, ReliableRuntime, SharedStore, StateStore, StoreError};
pub use runtime::{RunStatus, Runtime, RuntimeStats, SharedStrategy};
pub use strategy::{
    DfsStrategy, PctStrategy, RandomStrategy, ReplayStrategy, ScheduleContext, Strategy,
};
pub use trace::{BugStep, BugStepKind, BugTrace, ChoicePoint, ScheduleTrace};
pub use types::{EventType, MachineId, OperationGroupId, StateName};
