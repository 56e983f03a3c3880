//! The machine object model.
//!
//! - [`metadata`]: machine type declarations (states, handlers, transitions)
//! - [`instance`]: per-machine mutable state and single-step execution
//! - [`inbox`]: event queues with deferral and receive rules
//! - [`cx`]: the capability context handed to handlers

pub mod cx;
pub(crate) mod inbox;
pub(crate) mod instance;
pub mod metadata;

pub use cx::{MachineCx, Receive};
pub use metadata::{ActionFuture, DataRef, MachineType, MachineTypeBuilder, StateBuilder};
